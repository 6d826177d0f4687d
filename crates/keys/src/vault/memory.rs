//! In-process vault for tests and local development.

use super::{SecretVault, VaultSecret, validate_secret_name};
use crate::error::{KeyError, KeyResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use zeroize::Zeroizing;

/// Versions are kept in insertion order; index + 1 is the version number.
#[derive(Default)]
pub struct MemoryVault {
    secrets: RwLock<BTreeMap<String, Vec<Zeroizing<Vec<u8>>>>>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretVault for MemoryVault {
    async fn get_secret(&self, name: &str) -> KeyResult<VaultSecret> {
        let secrets = self.secrets.read().await;
        let versions = secrets
            .get(name)
            .ok_or_else(|| KeyError::NotFound(name.to_string()))?;
        let value = versions
            .last()
            .ok_or_else(|| KeyError::NotFound(name.to_string()))?;
        Ok(VaultSecret {
            version: versions.len() as u32,
            value: value.clone(),
        })
    }

    async fn get_secret_version(&self, name: &str, version: u32) -> KeyResult<VaultSecret> {
        let secrets = self.secrets.read().await;
        let value = secrets
            .get(name)
            .and_then(|versions| versions.get((version as usize).checked_sub(1)?))
            .ok_or_else(|| KeyError::NotFound(format!("{name} v{version}")))?;
        Ok(VaultSecret {
            version,
            value: value.clone(),
        })
    }

    async fn set_secret(&self, name: &str, value: &[u8]) -> KeyResult<u32> {
        validate_secret_name(name)?;
        let mut secrets = self.secrets.write().await;
        let versions = secrets.entry(name.to_string()).or_default();
        versions.push(Zeroizing::new(value.to_vec()));
        Ok(versions.len() as u32)
    }

    async fn delete_secret(&self, name: &str) -> KeyResult<()> {
        self.secrets
            .write()
            .await
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| KeyError::NotFound(name.to_string()))
    }

    async fn list_secrets(&self) -> KeyResult<Vec<String>> {
        Ok(self.secrets.read().await.keys().cloned().collect())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
