//! Local filesystem storage backend.
//!
//! Blob bytes live under `<root>/objects/<key>`; attributes are a JSON
//! sidecar at `<root>/attrs/<key>.json`. Both are written to a temporary file,
//! synced and renamed into place so readers never observe a partial object.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, ObjectAttributes, ObjectMeta, ObjectStore, StreamingUpload};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

/// Read buffer size for streaming reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

const OBJECTS_DIR: &str = "objects";
const ATTRS_DIR: &str = "attrs";

#[derive(Default, Serialize, Deserialize)]
struct Sidecar {
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

impl From<&ObjectAttributes> for Sidecar {
    fn from(attrs: &ObjectAttributes) -> Self {
        Self {
            content_type: attrs.content_type.clone(),
            metadata: attrs.metadata.clone(),
        }
    }
}

/// Local filesystem object store.
pub struct FilesystemBackend {
    objects: PathBuf,
    attrs: PathBuf,
}

fn not_found_or_io(key: &str) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |e| {
        if e.kind() == ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::Io(e)
        }
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let suffix = format!(".tmp.{}", Uuid::new_v4());
    let name = path
        .file_name()
        .map(|n| format!("{}{suffix}", n.to_string_lossy()))
        .unwrap_or(suffix);
    path.with_file_name(name)
}

impl FilesystemBackend {
    /// Create a new filesystem backend rooted at `root`.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref();
        let objects = root.join(OBJECTS_DIR);
        let attrs = root.join(ATTRS_DIR);
        fs::create_dir_all(&objects).await?;
        fs::create_dir_all(&attrs).await?;
        Ok(Self { objects, attrs })
    }

    /// Resolve `key` under `base`, off the async runtime.
    async fn resolve(base: &Path, key: &str) -> StorageResult<PathBuf> {
        let base = base.to_path_buf();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || resolve_sync(&base, &key))
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}"))))?
    }

    async fn object_path(&self, key: &str) -> StorageResult<PathBuf> {
        Self::resolve(&self.objects, key).await
    }

    async fn attrs_path(&self, key: &str) -> StorageResult<PathBuf> {
        Self::resolve(&self.attrs, &format!("{key}.json")).await
    }

    async fn ensure_parent(path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    async fn write_atomic(path: &Path, data: &[u8]) -> StorageResult<()> {
        Self::ensure_parent(path).await?;
        let temp_path = temp_sibling(path);
        {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
        }
        if let Err(e) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn read_sidecar(&self, key: &str) -> StorageResult<Sidecar> {
        let path = self.attrs_path(key).await?;
        match fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| StorageError::InvalidAttributes(format!("{key}: {e}"))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Sidecar::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn encode_sidecar(attributes: &ObjectAttributes) -> StorageResult<Vec<u8>> {
        serde_json::to_vec(&Sidecar::from(attributes))
            .map_err(|e| StorageError::InvalidAttributes(e.to_string()))
    }
}

/// Map `key` to a path under `root`, refusing anything that could escape it:
/// `..` and absolute components, and symlinks (on the path itself or on the
/// nearest existing ancestor) that resolve outside the root.
fn resolve_sync(root: &Path, key: &str) -> StorageResult<PathBuf> {
    if key.is_empty() || key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
        return Err(StorageError::InvalidKey(format!(
            "path traversal not allowed: {key}"
        )));
    }
    if Path::new(key)
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(StorageError::InvalidKey(format!(
            "contains unsafe path component: {key}"
        )));
    }

    let path = root.join(key);
    let root_canonical = root.canonicalize().map_err(|e| {
        StorageError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to canonicalize root: {e}"),
        ))
    })?;

    let check = |candidate: &Path, what: &str| -> StorageResult<bool> {
        match std::fs::symlink_metadata(candidate) {
            Ok(meta) => {
                let canonical = candidate.canonicalize().map_err(|e| {
                    if meta.file_type().is_symlink() {
                        StorageError::InvalidKey(format!("{what} symlink target missing: {key}"))
                    } else {
                        StorageError::Io(e)
                    }
                })?;
                if !canonical.starts_with(&root_canonical) {
                    return Err(StorageError::InvalidKey(format!(
                        "{what} escapes storage root: {key}"
                    )));
                }
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Io(e)),
        }
    };

    if check(&path, "resolved path")? {
        return Ok(path);
    }

    // New path: the nearest existing ancestor decides where create_dir_all lands.
    let mut ancestor = path.as_path();
    while let Some(parent) = ancestor.parent() {
        if check(parent, "ancestor path")? {
            break;
        }
        ancestor = parent;
    }
    Ok(path)
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.object_path(key).await?;
        fs::try_exists(&path).await.map_err(StorageError::Io)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn stat(&self, key: &str) -> StorageResult<ObjectMeta> {
        let path = self.object_path(key).await?;
        let metadata = fs::metadata(&path).await.map_err(not_found_or_io(key))?;
        let sidecar = self.read_sidecar(key).await?;

        Ok(ObjectMeta {
            size: metadata.len(),
            last_modified: metadata.modified().ok().map(|t| t.into()),
            content_type: sidecar.content_type,
            metadata: sidecar.metadata,
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.object_path(key).await?;
        let data = fs::read(&path).await.map_err(not_found_or_io(key))?;
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        use tokio::io::AsyncReadExt;

        let path = self.object_path(key).await?;
        let file = fs::File::open(&path).await.map_err(not_found_or_io(key))?;

        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self, data, attributes), fields(backend = "filesystem", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes, attributes: ObjectAttributes) -> StorageResult<()> {
        attributes.validate()?;
        let path = self.object_path(key).await?;
        let attrs_path = self.attrs_path(key).await?;
        Self::write_atomic(&attrs_path, &Self::encode_sidecar(&attributes)?).await?;
        Self::write_atomic(&path, &data).await
    }

    #[instrument(skip(self, attributes), fields(backend = "filesystem"))]
    async fn put_stream(
        &self,
        key: &str,
        attributes: ObjectAttributes,
    ) -> StorageResult<Box<dyn StreamingUpload>> {
        attributes.validate()?;
        let path = self.object_path(key).await?;
        let attrs_path = self.attrs_path(key).await?;
        Self::ensure_parent(&path).await?;

        // Unique temp name keeps concurrent writers to one key apart.
        let temp_path = temp_sibling(&path);
        let file = fs::File::create(&temp_path).await?;

        Ok(Box::new(FilesystemUpload {
            file,
            temp_path,
            final_path: path,
            attrs_path,
            sidecar: Self::encode_sidecar(&attributes)?,
            bytes_written: 0,
        }))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.object_path(key).await?;
        fs::remove_file(&path).await.map_err(not_found_or_io(key))?;

        let attrs_path = self.attrs_path(key).await?;
        match fs::remove_file(&attrs_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let base = if prefix.is_empty() {
            self.objects.clone()
        } else {
            self.object_path(prefix.trim_end_matches('/')).await?
        };
        let mut results = Vec::new();
        if !fs::try_exists(&base).await.unwrap_or(false) {
            return Ok(results);
        }

        let mut stack = vec![base];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                // file_type() does not follow symlinks; those are skipped.
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if file_type.is_file()
                    && !path.to_string_lossy().contains(".tmp.")
                    && let Ok(rel) = path.strip_prefix(&self.objects)
                {
                    results.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }

        results.sort();
        Ok(results)
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        let marker = self.objects.join(format!(".health.tmp.{}", Uuid::new_v4()));
        fs::write(&marker, b"ok").await?;
        fs::remove_file(&marker).await?;
        Ok(())
    }
}

/// Streaming upload for the filesystem backend.
struct FilesystemUpload {
    file: fs::File,
    temp_path: PathBuf,
    final_path: PathBuf,
    attrs_path: PathBuf,
    sidecar: Vec<u8>,
    bytes_written: u64,
}

#[async_trait]
impl StreamingUpload for FilesystemUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.file.write_all(&data).await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> StorageResult<u64> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        let FilesystemUpload {
            file,
            temp_path,
            final_path,
            attrs_path,
            sidecar,
            bytes_written,
        } = *self;
        drop(file);

        let published = async {
            FilesystemBackend::write_atomic(&attrs_path, &sidecar).await?;
            fs::rename(&temp_path, &final_path).await?;
            StorageResult::Ok(())
        }
        .await;
        if let Err(e) = published {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }
        Ok(bytes_written)
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        let FilesystemUpload {
            file, temp_path, ..
        } = *self;
        drop(file);
        match fs::remove_file(&temp_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
