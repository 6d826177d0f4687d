//! Key lifecycle manager.
//!
//! Fetches named keys from a [`SecretVault`], caches them for a bounded time
//! and serializes mutations per key name.

use crate::error::{KeyError, KeyResult};
use crate::vault::{self, SecretVault, VaultSecret};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use murmur_core::config::KeyConfig;
use rand::RngCore;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use zeroize::Zeroizing;

/// Length of keys generated by `rotate_key` and `get_or_create_key`.
pub const GENERATED_KEY_LEN: usize = 32;

/// One version of a named key.
#[derive(Clone)]
pub struct KeyMaterial {
    name: Arc<str>,
    version: u32,
    bytes: Arc<Zeroizing<Vec<u8>>>,
}

impl KeyMaterial {
    fn from_secret(name: &str, secret: VaultSecret) -> Self {
        Self {
            name: Arc::from(name),
            version: secret.version,
            bytes: Arc::new(secret.value),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.bytes.as_slice()
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial({} v{}, [REDACTED])", self.name, self.version)
    }
}

struct CachedKey {
    material: KeyMaterial,
    expires_at: Instant,
}

/// Cached, retrying front end to the secret vault.
pub struct KeyManager {
    vault: Arc<dyn SecretVault>,
    latest: DashMap<String, CachedKey>,
    versions: DashMap<(String, u32), CachedKey>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    ttl: Duration,
    retry_attempts: u32,
    retry_backoff: Duration,
}

impl KeyManager {
    pub fn new(
        vault: Arc<dyn SecretVault>,
        ttl: Duration,
        retry_attempts: u32,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            vault,
            latest: DashMap::new(),
            versions: DashMap::new(),
            locks: DashMap::new(),
            ttl,
            retry_attempts: retry_attempts.max(1),
            retry_backoff,
        }
    }

    /// Build the vault and manager described by `config`.
    pub fn from_config(config: &KeyConfig) -> KeyResult<Self> {
        let vault = vault::from_config(&config.vault)?;
        tracing::info!(backend = vault.backend_name(), "key vault configured");
        Ok(Self::new(
            vault,
            config.cache_ttl(),
            config.retry_attempts,
            config.retry_backoff(),
        ))
    }

    pub fn backend_name(&self) -> &'static str {
        self.vault.backend_name()
    }

    pub async fn health_check(&self) -> KeyResult<()> {
        self.with_retry("health_check", "", || self.vault.health_check())
            .await
    }

    /// Latest version of `name`.
    pub async fn get_key(&self, name: &str) -> KeyResult<KeyMaterial> {
        if let Some(material) = self.cached_latest(name) {
            return Ok(material);
        }
        let secret = self
            .with_retry("get_key", name, || self.vault.get_secret(name))
            .await?;
        let material = KeyMaterial::from_secret(name, secret);
        self.remember(&material, true);
        Ok(material)
    }

    /// A specific version of `name`, e.g. the KEK a stored key was wrapped under.
    pub async fn get_key_version(&self, name: &str, version: u32) -> KeyResult<KeyMaterial> {
        let cache_key = (name.to_string(), version);
        if let Some(entry) = self.versions.get(&cache_key)
            && entry.expires_at > Instant::now()
        {
            return Ok(entry.material.clone());
        }
        let secret = self
            .with_retry("get_key_version", name, || {
                self.vault.get_secret_version(name, version)
            })
            .await?;
        let material = KeyMaterial::from_secret(name, secret);
        self.remember(&material, false);
        Ok(material)
    }

    /// Store `value` as the first version of a new key.
    pub async fn create_key(&self, name: &str, value: &[u8]) -> KeyResult<KeyMaterial> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        match self
            .with_retry("create_key", name, || self.vault.get_secret(name))
            .await
        {
            Ok(_) => return Err(KeyError::AlreadyExists(name.to_string())),
            Err(KeyError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        let material = self.store_version(name, value).await?;
        tracing::info!(key = name, version = material.version, "key created");
        Ok(material)
    }

    /// Generate fresh key bytes and store them as a new version of `name`.
    ///
    /// Data wrapped under older versions stays readable through
    /// [`get_key_version`](Self::get_key_version) until it is re-wrapped.
    pub async fn rotate_key(&self, name: &str) -> KeyResult<KeyMaterial> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        let previous = self
            .with_retry("rotate_key", name, || self.vault.get_secret(name))
            .await?;
        self.invalidate(name);

        let value = generate_key_bytes();
        let material = self.store_version(name, &value).await?;
        tracing::info!(
            key = name,
            previous_version = previous.version,
            version = material.version,
            "key rotated"
        );
        Ok(material)
    }

    /// Remove every version of `name` from the vault and the cache.
    pub async fn delete_key(&self, name: &str) -> KeyResult<()> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        self.with_retry("delete_key", name, || self.vault.delete_secret(name))
            .await?;
        self.invalidate(name);
        self.versions.retain(|(cached, _), _| cached != name);
        tracing::info!(key = name, "key deleted");
        Ok(())
    }

    pub async fn list_keys(&self) -> KeyResult<Vec<String>> {
        self.with_retry("list_keys", "", || self.vault.list_secrets())
            .await
    }

    /// Latest version of `name`, generating a random key on first use.
    pub async fn get_or_create_key(&self, name: &str) -> KeyResult<KeyMaterial> {
        match self.get_key(name).await {
            Err(KeyError::NotFound(_)) => {}
            other => return other,
        }

        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        // Another task may have created it while we waited for the lock.
        match self
            .with_retry("get_or_create_key", name, || self.vault.get_secret(name))
            .await
        {
            Ok(secret) => {
                let material = KeyMaterial::from_secret(name, secret);
                self.remember(&material, true);
                return Ok(material);
            }
            Err(KeyError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let value = generate_key_bytes();
        let material = self.store_version(name, &value).await?;
        tracing::info!(key = name, version = material.version, "key generated");
        Ok(material)
    }

    /// Drop the cached latest version of `name`.
    pub fn invalidate(&self, name: &str) {
        self.latest.remove(name);
    }

    async fn store_version(&self, name: &str, value: &[u8]) -> KeyResult<KeyMaterial> {
        let version = self
            .with_retry("set_secret", name, || self.vault.set_secret(name, value))
            .await?;
        let material = KeyMaterial {
            name: Arc::from(name),
            version,
            bytes: Arc::new(Zeroizing::new(value.to_vec())),
        };
        self.remember(&material, true);
        Ok(material)
    }

    fn cached_latest(&self, name: &str) -> Option<KeyMaterial> {
        let entry = self.latest.get(name)?;
        if entry.expires_at > Instant::now() {
            return Some(entry.material.clone());
        }
        drop(entry);
        self.latest.remove(name);
        None
    }

    fn remember(&self, material: &KeyMaterial, as_latest: bool) {
        let expires_at = Instant::now() + self.ttl;
        self.versions.insert(
            (material.name().to_string(), material.version),
            CachedKey {
                material: material.clone(),
                expires_at,
            },
        );
        if !as_latest {
            return;
        }
        let fresh = CachedKey {
            material: material.clone(),
            expires_at,
        };
        // A read that raced a rotation must not replace the newer version.
        match self.latest.entry(material.name().to_string()) {
            Entry::Occupied(mut cached) => {
                if material.version >= cached.get().material.version {
                    cached.insert(fresh);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(fresh);
            }
        }
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, name: &str, mut f: F) -> KeyResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = KeyResult<T>>,
    {
        let mut attempt = 1;
        let mut backoff = self.retry_backoff;
        loop {
            match f().await {
                Err(e) if e.is_retryable() && attempt < self.retry_attempts => {
                    tracing::warn!(
                        op,
                        key = name,
                        attempt,
                        error = %e,
                        "vault call failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

fn generate_key_bytes() -> Zeroizing<Vec<u8>> {
    let mut bytes = Zeroizing::new(vec![0u8; GENERATED_KEY_LEN]);
    rand::rngs::OsRng.fill_bytes(bytes.as_mut_slice());
    bytes
}
