//! Secret vault backends.
//!
//! A vault stores versioned opaque secrets by name. Every `set_secret` creates
//! a new version; older versions stay readable until the secret is deleted.

pub mod file;
pub mod http;
pub mod memory;

pub use file::FileVault;
pub use http::{HttpVault, HttpVaultSettings};
pub use memory::MemoryVault;

use crate::error::{KeyError, KeyResult};
use async_trait::async_trait;
use murmur_core::config::VaultConfig;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

/// Longest accepted secret name.
pub const MAX_SECRET_NAME_LEN: usize = 128;

/// One version of a secret.
pub struct VaultSecret {
    pub version: u32,
    pub value: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for VaultSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VaultSecret(v{}, [REDACTED])", self.version)
    }
}

/// External secret store holding key material.
#[async_trait]
pub trait SecretVault: Send + Sync {
    /// Latest version of a secret.
    async fn get_secret(&self, name: &str) -> KeyResult<VaultSecret>;

    /// A specific version of a secret.
    async fn get_secret_version(&self, name: &str, version: u32) -> KeyResult<VaultSecret>;

    /// Store a new version and return its number. Versions start at 1.
    async fn set_secret(&self, name: &str, value: &[u8]) -> KeyResult<u32>;

    /// Remove every version. `NotFound` if the secret does not exist.
    async fn delete_secret(&self, name: &str) -> KeyResult<()>;

    /// Names of all stored secrets, sorted.
    async fn list_secrets(&self) -> KeyResult<Vec<String>>;

    fn backend_name(&self) -> &'static str;

    async fn health_check(&self) -> KeyResult<()> {
        Ok(())
    }
}

/// Secret names double as path segments, so only a conservative alphabet is
/// accepted.
pub fn validate_secret_name(name: &str) -> KeyResult<()> {
    if name.is_empty() || name.len() > MAX_SECRET_NAME_LEN {
        return Err(KeyError::InvalidKey(format!(
            "secret name must be 1-{MAX_SECRET_NAME_LEN} characters"
        )));
    }
    if name.starts_with('.') {
        return Err(KeyError::InvalidKey(format!(
            "secret name may not start with '.': {name}"
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(KeyError::InvalidKey(format!(
            "invalid character {c:?} in secret name {name}"
        )));
    }
    Ok(())
}

/// Create a vault from configuration.
pub fn from_config(config: &VaultConfig) -> KeyResult<Arc<dyn SecretVault>> {
    match config {
        VaultConfig::Memory => Ok(Arc::new(MemoryVault::new())),
        VaultConfig::File { path } => Ok(Arc::new(FileVault::new(path)?)),
        VaultConfig::Http {
            address,
            mount,
            token,
            token_env,
            namespace,
            request_timeout_secs,
        } => {
            let token = match token {
                Some(token) => token.clone(),
                None => std::env::var(token_env).map_err(|_| {
                    KeyError::Unauthorized(format!(
                        "no vault token configured and {token_env} is not set"
                    ))
                })?,
            };
            let settings = HttpVaultSettings {
                address: address.clone(),
                mount: mount.clone(),
                token: Zeroizing::new(token),
                namespace: namespace.clone(),
                request_timeout: Duration::from_secs(*request_timeout_secs),
            };
            Ok(Arc::new(HttpVault::new(settings)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_name_validation() {
        assert!(validate_secret_name("master").is_ok());
        assert!(validate_secret_name("user-42").is_ok());
        assert!(validate_secret_name("metadata-integrity.v2").is_ok());

        assert!(validate_secret_name("").is_err());
        assert!(validate_secret_name(".hidden").is_err());
        assert!(validate_secret_name("../etc").is_err());
        assert!(validate_secret_name("a/b").is_err());
        assert!(validate_secret_name("with space").is_err());
        assert!(validate_secret_name(&"k".repeat(MAX_SECRET_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_vault_secret_debug_redacts() {
        let secret = VaultSecret {
            version: 3,
            value: Zeroizing::new(b"hunter2".to_vec()),
        };
        let debug = format!("{secret:?}");
        assert!(debug.contains("v3"));
        assert!(!debug.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_from_config_memory() {
        let vault = from_config(&VaultConfig::Memory).unwrap();
        assert_eq!(vault.backend_name(), "memory");
        vault.health_check().await.unwrap();
    }
}
