//! Shared helpers for key management tests.

#![allow(dead_code)]

use async_trait::async_trait;
use murmur_keys::vault::MemoryVault;
use murmur_keys::{KeyError, KeyResult, SecretVault, VaultSecret};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Vault wrapper that fails the next `failures` calls with a transient error
/// and counts every call it sees.
pub struct FlakyVault {
    inner: MemoryVault,
    failures: AtomicU32,
    pub calls: AtomicU32,
}

impl FlakyVault {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryVault::new(),
            failures: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        })
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn tick(&self) -> KeyResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(KeyError::Unavailable("injected outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SecretVault for FlakyVault {
    async fn get_secret(&self, name: &str) -> KeyResult<VaultSecret> {
        self.tick()?;
        self.inner.get_secret(name).await
    }

    async fn get_secret_version(&self, name: &str, version: u32) -> KeyResult<VaultSecret> {
        self.tick()?;
        self.inner.get_secret_version(name, version).await
    }

    async fn set_secret(&self, name: &str, value: &[u8]) -> KeyResult<u32> {
        self.tick()?;
        self.inner.set_secret(name, value).await
    }

    async fn delete_secret(&self, name: &str) -> KeyResult<()> {
        self.tick()?;
        self.inner.delete_secret(name).await
    }

    async fn list_secrets(&self) -> KeyResult<Vec<String>> {
        self.tick()?;
        self.inner.list_secrets().await
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}
