//! Data builders and storage wrappers shared by service tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use murmur_core::Bucket;
use murmur_storage::{
    ByteStream, ObjectAttributes, ObjectMeta, ObjectStore, StorageError, StorageResult,
    StreamingUpload,
};
use murmur_worker::{ContentStream, ServiceResult};
use rand::RngCore;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub fn audio() -> Bucket {
    Bucket::new("audio").expect("valid bucket")
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

/// Highly compressible text of `len` bytes.
pub fn speech_transcript(len: usize) -> Vec<u8> {
    b"and then she said the recording was fine "
        .iter()
        .copied()
        .cycle()
        .take(len)
        .collect()
}

/// Feed `data` as a stream of `piece`-sized chunks.
pub fn byte_stream(data: Vec<u8>, piece: usize) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    let chunks: Vec<io::Result<Bytes>> = data
        .chunks(piece)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    futures::stream::iter(chunks)
}

pub async fn collect(stream: ContentStream) -> ServiceResult<Vec<u8>> {
    let parts: Vec<Bytes> = stream.try_collect().await?;
    Ok(parts.concat())
}

/// Drain a stream, returning the bytes delivered before the first error and
/// that error.
pub async fn drain(mut stream: ContentStream) -> (Vec<u8>, Option<murmur_worker::ServiceError>) {
    let mut out = Vec::new();
    while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) => out.extend_from_slice(&chunk),
            Err(e) => return (out, Some(e)),
        }
    }
    (out, None)
}

/// Object store whose streaming uploads fail after the first chunk while
/// `failing` is set.
pub struct FailingUploads {
    inner: Arc<dyn ObjectStore>,
    pub failing: AtomicBool,
}

impl FailingUploads {
    pub fn wrap(inner: Arc<dyn ObjectStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failing: AtomicBool::new(true),
        })
    }
}

struct FailingUpload {
    inner: Box<dyn StreamingUpload>,
    written: usize,
}

#[async_trait]
impl StreamingUpload for FailingUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        if self.written > 0 {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "backend went away",
            )));
        }
        self.written += data.len();
        self.inner.write(data).await
    }

    async fn finish(self: Box<Self>) -> StorageResult<u64> {
        self.inner.finish().await
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        self.inner.abort().await
    }
}

#[async_trait]
impl ObjectStore for FailingUploads {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn stat(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.inner.stat(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.inner.get(key).await
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        self.inner.get_stream(key).await
    }

    async fn put(&self, key: &str, data: Bytes, attributes: ObjectAttributes) -> StorageResult<()> {
        self.inner.put(key, data, attributes).await
    }

    async fn put_stream(
        &self,
        key: &str,
        attributes: ObjectAttributes,
    ) -> StorageResult<Box<dyn StreamingUpload>> {
        let upload = self.inner.put_stream(key, attributes).await?;
        if self.failing.load(Ordering::SeqCst) {
            Ok(Box::new(FailingUpload {
                inner: upload,
                written: 0,
            }))
        } else {
            Ok(upload)
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list(prefix).await
    }

    fn backend_name(&self) -> &'static str {
        "failing"
    }
}
