//! Directory-backed vault.
//!
//! Layout: `<root>/<name>/v<N>`, one file per version holding the raw secret
//! bytes. Files are created with mode 0600 on unix.

use super::{SecretVault, VaultSecret, validate_secret_name};
use crate::error::{KeyError, KeyResult};
use async_trait::async_trait;
use rand::RngCore;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use zeroize::Zeroizing;

/// Attempts at claiming a version number when writers race on one name.
const MAX_VERSION_CLAIMS: usize = 8;

pub struct FileVault {
    root: PathBuf,
}

impl FileVault {
    pub fn new(root: impl AsRef<Path>) -> KeyResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn secret_dir(&self, name: &str) -> KeyResult<PathBuf> {
        validate_secret_name(name)?;
        Ok(self.root.join(name))
    }

    /// Version numbers present for a secret, ascending.
    async fn versions(&self, dir: &Path) -> KeyResult<Vec<u32>> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut versions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            if let Some(version) = file_name
                .to_str()
                .and_then(|n| n.strip_prefix('v'))
                .and_then(|n| n.parse::<u32>().ok())
            {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    async fn read_version(&self, dir: &Path, name: &str, version: u32) -> KeyResult<VaultSecret> {
        match fs::read(dir.join(format!("v{version}"))).await {
            Ok(bytes) => Ok(VaultSecret {
                version,
                value: Zeroizing::new(bytes),
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(KeyError::NotFound(format!("{name} v{version}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_private(path: &Path, data: &[u8]) -> KeyResult<()> {
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl SecretVault for FileVault {
    async fn get_secret(&self, name: &str) -> KeyResult<VaultSecret> {
        let dir = self.secret_dir(name)?;
        let latest = self
            .versions(&dir)
            .await?
            .last()
            .copied()
            .ok_or_else(|| KeyError::NotFound(name.to_string()))?;
        self.read_version(&dir, name, latest).await
    }

    async fn get_secret_version(&self, name: &str, version: u32) -> KeyResult<VaultSecret> {
        let dir = self.secret_dir(name)?;
        self.read_version(&dir, name, version).await
    }

    async fn set_secret(&self, name: &str, value: &[u8]) -> KeyResult<u32> {
        let dir = self.secret_dir(name)?;
        fs::create_dir_all(&dir).await?;

        let temp = dir.join(format!(".tmp.{:016x}", rand::rngs::OsRng.next_u64()));
        Self::write_private(&temp, value).await?;

        // hard_link refuses to replace an existing file, so two writers can
        // never publish the same version number.
        let mut result = Err(KeyError::Unavailable(format!(
            "could not claim a version for {name}"
        )));
        for _ in 0..MAX_VERSION_CLAIMS {
            let next = self.versions(&dir).await?.last().copied().unwrap_or(0) + 1;
            match fs::hard_link(&temp, dir.join(format!("v{next}"))).await {
                Ok(()) => {
                    result = Ok(next);
                    break;
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    result = Err(e.into());
                    break;
                }
            }
        }
        let _ = fs::remove_file(&temp).await;
        let version = result?;

        tracing::debug!(secret = name, version, backend = "file", "stored secret version");
        Ok(version)
    }

    async fn delete_secret(&self, name: &str) -> KeyResult<()> {
        let dir = self.secret_dir(name)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(KeyError::NotFound(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_secrets(&self) -> KeyResult<Vec<String>> {
        let mut entries = fs::read_dir(&self.root).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if validate_secret_name(&name).is_ok() && !self.versions(&entry.path()).await?.is_empty()
            {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn backend_name(&self) -> &'static str {
        "file"
    }

    async fn health_check(&self) -> KeyResult<()> {
        let probe = self.root.join(format!(".health.{:016x}", rand::rngs::OsRng.next_u64()));
        Self::write_private(&probe, b"ok").await?;
        fs::remove_file(&probe).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_versions_persist_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let vault = FileVault::new(dir.path()).unwrap();
            assert_eq!(vault.set_secret("master", b"first").await.unwrap(), 1);
            assert_eq!(vault.set_secret("master", b"second").await.unwrap(), 2);
        }

        let vault = FileVault::new(dir.path()).unwrap();
        let latest = vault.get_secret("master").await.unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.value.as_slice(), b"second");
        let first = vault.get_secret_version("master", 1).await.unwrap();
        assert_eq!(first.value.as_slice(), b"first");
    }

    #[tokio::test]
    async fn test_missing_and_invalid_names() {
        let dir = tempfile::tempdir().unwrap();
        let vault = FileVault::new(dir.path()).unwrap();
        assert!(matches!(vault.get_secret("absent").await, Err(KeyError::NotFound(_))));
        assert!(matches!(
            vault.set_secret("../escape", b"x").await,
            Err(KeyError::InvalidKey(_))
        ));
        assert!(matches!(vault.delete_secret("absent").await, Err(KeyError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let vault = FileVault::new(dir.path()).unwrap();
        vault.set_secret("user-b", b"1").await.unwrap();
        vault.set_secret("user-a", b"1").await.unwrap();
        vault.health_check().await.unwrap();

        assert_eq!(vault.list_secrets().await.unwrap(), vec!["user-a", "user-b"]);
        vault.delete_secret("user-a").await.unwrap();
        assert_eq!(vault.list_secrets().await.unwrap(), vec!["user-b"]);
    }

    #[tokio::test]
    async fn test_concurrent_writers_get_distinct_versions() {
        let dir = tempfile::tempdir().unwrap();
        let vault = std::sync::Arc::new(FileVault::new(dir.path()).unwrap());
        let mut handles = Vec::new();
        for i in 0..4u8 {
            let vault = vault.clone();
            handles.push(tokio::spawn(async move {
                vault.set_secret("shared", &[i]).await.unwrap()
            }));
        }
        let mut versions = Vec::new();
        for handle in handles {
            versions.push(handle.await.unwrap());
        }
        versions.sort_unstable();
        assert_eq!(versions, vec![1, 2, 3, 4]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_secret_files_are_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let vault = FileVault::new(dir.path()).unwrap();
        vault.set_secret("master", b"k").await.unwrap();
        let meta = std::fs::metadata(dir.path().join("master").join("v1")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }
}
