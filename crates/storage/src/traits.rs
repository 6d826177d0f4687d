//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::collections::BTreeMap;
use std::pin::Pin;

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Descriptive attributes stored next to a blob.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectAttributes {
    pub content_type: Option<String>,
    /// Free-form string pairs. Keys are lowercase ASCII.
    pub metadata: BTreeMap<String, String>,
}

impl ObjectAttributes {
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Reject keys that S3 user metadata cannot carry.
    pub fn validate(&self) -> StorageResult<()> {
        for key in self.metadata.keys() {
            let valid = !key.is_empty()
                && key
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
            if !valid {
                return Err(crate::StorageError::InvalidAttributes(format!(
                    "metadata key must be lowercase ascii: {key:?}"
                )));
            }
        }
        Ok(())
    }
}

/// Blob store for object bytes. Keys are `/`-separated relative paths.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Size and attributes without fetching content. `NotFound` if absent.
    async fn stat(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// Read a whole object into memory. Meant for small objects and tests.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Read an object as a byte stream.
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream>;

    /// Write an object atomically.
    async fn put(&self, key: &str, data: Bytes, attributes: ObjectAttributes) -> StorageResult<()>;

    /// Start a streaming upload. Nothing is visible at `key` until
    /// [`StreamingUpload::finish`] succeeds.
    async fn put_stream(
        &self,
        key: &str,
        attributes: ObjectAttributes,
    ) -> StorageResult<Box<dyn StreamingUpload>>;

    /// Delete an object. `NotFound` if it does not exist.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// List object keys under a prefix.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Static identifier for logs, e.g. "s3" or "filesystem".
    fn backend_name(&self) -> &'static str;

    /// Verify the backend is reachable and writable.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Metadata about a stored object.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    pub size: u64,
    pub last_modified: Option<time::OffsetDateTime>,
    pub content_type: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// Incremental writer returned by [`ObjectStore::put_stream`].
#[async_trait]
pub trait StreamingUpload: Send {
    /// Write a chunk of data.
    async fn write(&mut self, data: Bytes) -> StorageResult<()>;

    /// Publish the object and return the total bytes written.
    async fn finish(self: Box<Self>) -> StorageResult<u64>;

    /// Discard everything written so far.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_keys_validated() {
        let ok = ObjectAttributes::default()
            .with_content_type("audio/mpeg")
            .with_entry("murmur-encrypted", "true");
        assert!(ok.validate().is_ok());

        let bad = ObjectAttributes::default().with_entry("Has Space", "x");
        assert!(bad.validate().is_err());
    }
}
