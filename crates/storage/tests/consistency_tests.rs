// Concurrent writers against the filesystem backend.

mod common;

use bytes::Bytes;
use common::{seeded_bytes, sha256_hex};
use murmur_storage::{FilesystemBackend, ObjectAttributes, ObjectStore};
use std::sync::Arc;
use tempfile::TempDir;

async fn streamed_put(backend: &dyn ObjectStore, key: &str, data: Bytes, chunk: usize) -> u64 {
    let mut upload = backend
        .put_stream(key, ObjectAttributes::default())
        .await
        .unwrap();
    for part in data.chunks(chunk) {
        upload.write(Bytes::copy_from_slice(part)).await.unwrap();
        tokio::task::yield_now().await;
    }
    upload.finish().await.unwrap()
}

#[tokio::test]
async fn test_independent_keys_do_not_interfere() {
    let temp_dir = TempDir::new().unwrap();
    let backend: Arc<dyn ObjectStore> =
        Arc::new(FilesystemBackend::new(temp_dir.path()).await.unwrap());

    let mut handles = Vec::new();
    for i in 0..16u64 {
        let backend = backend.clone();
        handles.push(tokio::spawn(async move {
            let data = seeded_bytes(i, 200_000 + i as usize * 1_000);
            let key = format!("audio/{i:04}");
            let written = streamed_put(backend.as_ref(), &key, data.clone(), 7_919).await;
            assert_eq!(written, data.len() as u64);
            (key, sha256_hex(&data))
        }));
    }

    for handle in handles {
        let (key, expected) = handle.await.unwrap();
        let stored = backend.get(&key).await.unwrap();
        assert_eq!(sha256_hex(&stored), expected, "content mismatch for {key}");
    }
    assert_eq!(backend.list("audio/").await.unwrap().len(), 16);
}

#[tokio::test]
async fn test_racing_writers_to_one_key_never_interleave() {
    let temp_dir = TempDir::new().unwrap();
    let backend: Arc<dyn ObjectStore> =
        Arc::new(FilesystemBackend::new(temp_dir.path()).await.unwrap());

    let first = seeded_bytes(1, 300_000);
    let second = seeded_bytes(2, 300_000);

    let a = {
        let backend = backend.clone();
        let data = first.clone();
        tokio::spawn(async move { streamed_put(backend.as_ref(), "audio/same", data, 4_096).await })
    };
    let b = {
        let backend = backend.clone();
        let data = second.clone();
        tokio::spawn(async move { streamed_put(backend.as_ref(), "audio/same", data, 4_096).await })
    };
    a.await.unwrap();
    b.await.unwrap();

    let stored = backend.get("audio/same").await.unwrap();
    assert!(
        stored == first || stored == second,
        "stored bytes must equal exactly one writer's payload"
    );
    assert_eq!(backend.list("audio/").await.unwrap(), vec!["audio/same"]);
}

#[tokio::test]
async fn test_stream_read_matches_written_bytes() {
    use futures::StreamExt;

    let temp_dir = TempDir::new().unwrap();
    let backend = FilesystemBackend::new(temp_dir.path()).await.unwrap();
    let data = seeded_bytes(99, 1_000_003);
    streamed_put(&backend, "video/large", data.clone(), 65_536).await;

    let mut stream = backend.get_stream("video/large").await.unwrap();
    let mut collected = Vec::with_capacity(data.len());
    while let Some(chunk) = stream.next().await {
        collected.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(Bytes::from(collected), data);
}
