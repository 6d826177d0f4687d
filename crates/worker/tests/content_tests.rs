//! Content store behaviour against filesystem blobs and SQLite metadata.

mod common;

use common::*;
use murmur_core::{Compression, ContentHash, JobPayload, JobPriority, ObjectId};
use murmur_metadata::{FileKeyRepo, ObjectRepo};
use murmur_storage::ObjectStore;
use murmur_worker::{ServiceError, StoreRequest};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

const MIB: usize = 1024 * 1024;

#[tokio::test]
async fn test_encrypted_roundtrip() {
    let ctx = TestContext::new().await;
    let data = random_bytes(700 * 1024);

    let request = StoreRequest::new("alice", "interview.wav", audio())
        .with_encryption(true)
        .with_content_type("audio/wav");
    let info = ctx
        .app
        .content
        .store(request, byte_stream(data.clone(), 50_000))
        .await
        .unwrap();

    assert!(info.encrypted);
    // Stored size covers ciphertext framing.
    assert!(info.size > data.len() as u64);

    let stored = ctx.blobs.get(&info.blob_key()).await.unwrap();
    assert_eq!(stored.len() as u64, info.size);
    assert_eq!(ContentHash::compute(&stored), info.content_hash);
    assert_ne!(&stored[stored.len() - 1000..], &data[data.len() - 1000..]);

    let (fetched, stream) = ctx.app.content.retrieve(info.object_id, true).await.unwrap();
    assert_eq!(fetched.object_id, info.object_id);
    assert_eq!(fetched.content_hash, info.content_hash);
    assert_eq!(fetched.content_type.as_deref(), Some("audio/wav"));
    assert_eq!(collect(stream).await.unwrap(), data);

    // Without decryption the stored ciphertext comes back.
    let (_, raw) = ctx.app.content.retrieve(info.object_id, false).await.unwrap();
    assert_eq!(collect(raw).await.unwrap(), stored.to_vec());
}

#[tokio::test]
async fn test_five_mib_unencrypted_roundtrip() {
    let ctx = TestContext::new().await;
    let data = random_bytes(5 * MIB);

    let request = StoreRequest::new("alice", "field-recording.raw", audio())
        .with_encryption(false)
        .with_declared_size(data.len() as u64);
    let info = ctx
        .app
        .content
        .store(request, byte_stream(data.clone(), 256 * 1024))
        .await
        .unwrap();

    let looked_up = ctx.app.content.get_info(info.object_id).await.unwrap().unwrap();
    assert_eq!(looked_up.size, (5 * MIB) as u64);
    assert_eq!(looked_up.hash_algorithm.as_str(), "sha256");
    assert_eq!(looked_up.content_hash, ContentHash::compute(&data));

    let (_, stream) = ctx.app.content.retrieve(info.object_id, false).await.unwrap();
    assert_eq!(collect(stream).await.unwrap(), data);
}

#[tokio::test]
async fn test_unencrypted_object_has_no_file_key() {
    let ctx = TestContext::new().await;
    let info = ctx
        .app
        .content
        .store(
            StoreRequest::new("alice", "plain.txt", audio()).with_encryption(false),
            byte_stream(b"not a secret".to_vec(), 4),
        )
        .await
        .unwrap();

    assert!(!info.encrypted);
    assert!(ctx.app.file_keys.get(info.object_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_compressed_encrypted_roundtrip() {
    let ctx = TestContext::new().await;
    let data = speech_transcript(2 * MIB);

    let info = ctx
        .app
        .content
        .store(
            StoreRequest::new("alice", "transcript.txt", audio())
                .with_encryption(true)
                .with_compression(true),
            byte_stream(data.clone(), 100_000),
        )
        .await
        .unwrap();

    assert_eq!(info.compression, Compression::Zstd);
    assert!(info.size < data.len() as u64 / 10);

    let (_, stream) = ctx.app.content.retrieve(info.object_id, true).await.unwrap();
    assert_eq!(collect(stream).await.unwrap(), data);
}

#[tokio::test]
async fn test_tampered_digest_returns_no_bytes() {
    let ctx = TestContext::new().await;
    let data = random_bytes(300 * 1024);
    let info = ctx
        .app
        .content
        .store(
            StoreRequest::new("alice", "clip.wav", audio()).with_encryption(false),
            byte_stream(data.clone(), 64 * 1024),
        )
        .await
        .unwrap();

    let forged = ContentHash::compute(b"something else entirely");
    sqlx::query("UPDATE objects SET content_hash = ? WHERE object_id = ?")
        .bind(forged.to_hex())
        .bind(*info.object_id.as_uuid())
        .execute(ctx.pool())
        .await
        .unwrap();

    let err = ctx
        .app
        .content
        .retrieve(info.object_id, false)
        .await
        .err()
        .expect("tampered metadata must be rejected");
    assert!(matches!(err, ServiceError::HashVerification(_)), "got {err:?}");
    assert!(matches!(
        ctx.app.content.get_info(info.object_id).await,
        Err(ServiceError::HashVerification(_))
    ));
}

#[tokio::test]
async fn test_tampered_blob_fails_before_streaming() {
    let ctx = TestContext::new().await;
    let data = random_bytes(200 * 1024);
    let info = ctx
        .app
        .content
        .store(
            StoreRequest::new("alice", "clip.wav", audio()).with_encryption(false),
            byte_stream(data.clone(), 64 * 1024),
        )
        .await
        .unwrap();

    let mut corrupted = data.clone();
    corrupted[150_000] ^= 0xff;
    ctx.blobs
        .put(&info.blob_key(), corrupted.into(), Default::default())
        .await
        .unwrap();

    let err = ctx
        .app
        .content
        .retrieve(info.object_id, false)
        .await
        .err()
        .expect("corrupted blob must be rejected");
    assert!(matches!(err, ServiceError::HashVerification(_)), "got {err:?}");
}

#[tokio::test]
async fn test_streaming_verification_ends_with_error() {
    let ctx = TestContext::with_config(|config| config.content.verify_before_stream = false).await;
    let data = random_bytes(200 * 1024);
    let info = ctx
        .app
        .content
        .store(
            StoreRequest::new("alice", "clip.wav", audio()).with_encryption(false),
            byte_stream(data.clone(), 64 * 1024),
        )
        .await
        .unwrap();

    let mut corrupted = data.clone();
    corrupted[10] ^= 0x01;
    ctx.blobs
        .put(&info.blob_key(), corrupted.into(), Default::default())
        .await
        .unwrap();

    let (_, stream) = ctx.app.content.retrieve(info.object_id, false).await.unwrap();
    let (_, err) = drain(stream).await;
    assert!(matches!(err, Some(ServiceError::HashVerification(_))), "got {err:?}");
}

#[tokio::test]
async fn test_swapped_compressed_blob_fails_while_streaming() {
    let ctx = TestContext::with_config(|config| config.content.verify_before_stream = false).await;
    let store = |name: &'static str, text: &'static [u8]| {
        let content = ctx.app.content.clone();
        async move {
            content
                .store(
                    StoreRequest::new("alice", name, audio())
                        .with_encryption(false)
                        .with_compression(true),
                    byte_stream(text.to_vec(), 8),
                )
                .await
                .unwrap()
        }
    };
    let genuine = store("genuine.txt", b"genuine transcript").await;
    let forged = store("forged.txt", b"forged transcript").await;

    // Another valid frame in place of the original blob.
    let forged_blob = ctx.blobs.get(&forged.blob_key()).await.unwrap();
    ctx.blobs
        .put(&genuine.blob_key(), forged_blob, Default::default())
        .await
        .unwrap();

    let (_, stream) = ctx.app.content.retrieve(genuine.object_id, true).await.unwrap();
    let (_, err) = drain(stream).await;
    assert!(matches!(err, Some(ServiceError::HashVerification(_))), "got {err:?}");
}

#[tokio::test]
async fn test_duplicate_object_id_conflicts() {
    let ctx = TestContext::new().await;
    let object_id = ObjectId::new();
    let request = StoreRequest::new("alice", "a.wav", audio()).with_object_id(object_id);

    ctx.app
        .content
        .store(request.clone(), byte_stream(b"first".to_vec(), 5))
        .await
        .unwrap();
    let err = ctx
        .app
        .content
        .store(request, byte_stream(b"second".to_vec(), 5))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)), "got {err:?}");

    let (_, stream) = ctx.app.content.retrieve(object_id, true).await.unwrap();
    assert_eq!(collect(stream).await.unwrap(), b"first");
}

#[tokio::test]
async fn test_validation_rejects_before_reading() {
    let ctx = TestContext::with_config(|config| {
        config.content.max_object_size = 1024;
        config.content.allowed_content_types = vec!["audio/*".to_string()];
    })
    .await;

    let too_big = StoreRequest::new("alice", "big.wav", audio()).with_declared_size(4096);
    let err = ctx
        .app
        .content
        .store(too_big, byte_stream(Vec::new(), 1))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));

    let wrong_type = StoreRequest::new("alice", "notes.pdf", audio()).with_content_type("application/pdf");
    let err = ctx
        .app
        .content
        .store(wrong_type, byte_stream(b"%PDF".to_vec(), 4))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));

    let no_user = StoreRequest::new("", "a.wav", audio());
    assert!(matches!(
        ctx.app.content.store(no_user, byte_stream(b"x".to_vec(), 1)).await,
        Err(ServiceError::Validation(_))
    ));

    let bad_chunk = StoreRequest::new("alice", "a.wav", audio()).with_chunk_size(10);
    assert!(matches!(
        ctx.app.content.store(bad_chunk, byte_stream(b"x".to_vec(), 1)).await,
        Err(ServiceError::Validation(_))
    ));
}

#[tokio::test]
async fn test_oversize_stream_aborts_upload() {
    let ctx = TestContext::with_config(|config| config.content.max_object_size = 100 * 1024).await;
    let object_id = ObjectId::new();

    let err = ctx
        .app
        .content
        .store(
            StoreRequest::new("alice", "liar.wav", audio())
                .with_object_id(object_id)
                .with_encryption(true),
            byte_stream(random_bytes(300 * 1024), 16 * 1024),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)), "got {err:?}");

    assert!(!ctx.blobs.exists(&audio().blob_key(&object_id)).await.unwrap());
    assert!(ctx.sqlite.get_object(*object_id.as_uuid()).await.unwrap().is_none());
    assert!(ctx.sqlite.get_file_key(*object_id.as_uuid()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_declared_size_mismatch_rejected() {
    let ctx = TestContext::new().await;
    let object_id = ObjectId::new();
    let err = ctx
        .app
        .content
        .store(
            StoreRequest::new("alice", "short.wav", audio())
                .with_object_id(object_id)
                .with_declared_size(1000),
            byte_stream(vec![1u8; 10], 10),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));
    assert!(!ctx.blobs.exists(&audio().blob_key(&object_id)).await.unwrap());
}

#[tokio::test]
async fn test_failed_upload_leaves_nothing_behind() {
    let mut failing = None;
    let ctx = TestContext::with_storage(|inner| {
        let wrapped = FailingUploads::wrap(inner);
        failing = Some(wrapped.clone());
        wrapped as Arc<dyn ObjectStore>
    })
    .await;
    let failing = failing.unwrap();
    let object_id = ObjectId::new();

    let err = ctx
        .app
        .content
        .store(
            StoreRequest::new("alice", "a.wav", audio())
                .with_object_id(object_id)
                .with_encryption(true)
                .with_chunk_size(64 * 1024),
            byte_stream(random_bytes(400 * 1024), 64 * 1024),
        )
        .await
        .unwrap_err();
    assert!(err.is_retryable(), "backend failures are transient: {err:?}");
    assert!(!ctx.blobs.exists(&audio().blob_key(&object_id)).await.unwrap());
    assert!(ctx.sqlite.get_object(*object_id.as_uuid()).await.unwrap().is_none());
    assert!(ctx.sqlite.get_file_key(*object_id.as_uuid()).await.unwrap().is_none());

    // The same id is free again once the backend recovers.
    failing.failing.store(false, Ordering::SeqCst);
    ctx.app
        .content
        .store(
            StoreRequest::new("alice", "a.wav", audio()).with_object_id(object_id),
            byte_stream(b"second try".to_vec(), 4),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_failed_key_write_rolls_back_blob() {
    let ctx = TestContext::new().await;
    sqlx::query(
        "CREATE TRIGGER reject_keys BEFORE INSERT ON file_keys BEGIN SELECT RAISE(ABORT, 'key store offline'); END",
    )
    .execute(ctx.pool())
    .await
    .unwrap();

    let object_id = ObjectId::new();
    let err = ctx
        .app
        .content
        .store(
            StoreRequest::new("alice", "a.wav", audio())
                .with_object_id(object_id)
                .with_encryption(true),
            byte_stream(random_bytes(10_000), 1000),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Database(_)), "got {err:?}");

    assert!(!ctx.blobs.exists(&audio().blob_key(&object_id)).await.unwrap());
    assert!(ctx.sqlite.get_object(*object_id.as_uuid()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_delete_cascades_and_is_idempotent() {
    let ctx = TestContext::new().await;
    let info = ctx
        .app
        .content
        .store(
            StoreRequest::new("alice", "a.wav", audio()).with_encryption(true),
            byte_stream(random_bytes(5000), 1000),
        )
        .await
        .unwrap();
    ctx.app.file_keys.share(info.object_id, "bob").await.unwrap();
    let job = ctx
        .app
        .ledger
        .create_job(
            JobPayload::new("verify", "alice").with_object(info.object_id),
            JobPriority::Normal,
            None,
        )
        .await
        .unwrap();

    assert!(ctx.app.content.delete(info.object_id).await.unwrap());

    assert!(!ctx.blobs.exists(&info.blob_key()).await.unwrap());
    assert!(ctx.app.content.get_info(info.object_id).await.unwrap().is_none());
    assert!(ctx.app.file_keys.get(info.object_id).await.unwrap().is_none());
    assert!(ctx.app.file_keys.list_shares(info.object_id).await.unwrap().is_empty());
    assert!(matches!(
        ctx.app.ledger.get_job(job.id).await,
        Err(ServiceError::NotFound(_))
    ));

    assert!(!ctx.app.content.delete(info.object_id).await.unwrap());
    assert!(matches!(
        ctx.app.content.retrieve(info.object_id, true).await,
        Err(ServiceError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_progress_and_bucket_size() {
    let ctx = TestContext::new().await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();

    let data = random_bytes(256 * 1024);
    let first = ctx
        .app
        .content
        .store(
            StoreRequest::new("alice", "a.wav", audio())
                .with_encryption(false)
                .with_declared_size(data.len() as u64)
                .with_chunk_size(64 * 1024)
                .on_progress(move |p| sink.lock().unwrap().push(p)),
            byte_stream(data, 10_000),
        )
        .await
        .unwrap();
    let second = ctx
        .app
        .content
        .store(
            StoreRequest::new("bob", "b.wav", audio()),
            byte_stream(random_bytes(1234), 100),
        )
        .await
        .unwrap();

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 4);
    assert!(seen.windows(2).all(|w| w[0].bytes_stored < w[1].bytes_stored));
    let last = seen.last().unwrap();
    assert_eq!(last.bytes_stored, first.size);
    assert_eq!(last.total, Some(256 * 1024));

    let total = ctx.app.content.get_bucket_size(&audio()).await.unwrap();
    assert_eq!(total, first.size + second.size);

    let bobs = ctx.app.content.list_objects(Some(&audio()), Some("bob"), 10).await.unwrap();
    assert_eq!(bobs.len(), 1);
    assert_eq!(bobs[0].object_id, second.object_id);
}

#[tokio::test]
async fn test_sweep_removes_only_orphaned_blobs() {
    let ctx = TestContext::new().await;
    let kept = ctx
        .app
        .content
        .store(
            StoreRequest::new("alice", "kept.wav", audio()),
            byte_stream(random_bytes(4096), 1024),
        )
        .await
        .unwrap();
    // Left behind by a store that died before committing its record.
    let orphan_key = audio().blob_key(&ObjectId::new());
    ctx.blobs
        .put(&orphan_key, random_bytes(2048).into(), Default::default())
        .await
        .unwrap();

    let young = ctx
        .app
        .content
        .sweep_orphans(&audio(), time::Duration::hours(1), false)
        .await
        .unwrap();
    assert_eq!(young.scanned, 2);
    assert_eq!(young.orphaned, 0);
    assert!(ctx.blobs.exists(&orphan_key).await.unwrap());

    let dry = ctx
        .app
        .content
        .sweep_orphans(&audio(), time::Duration::ZERO, true)
        .await
        .unwrap();
    assert_eq!(dry.orphaned, 1);
    assert_eq!(dry.deleted, 0);
    assert!(ctx.blobs.exists(&orphan_key).await.unwrap());

    let swept = ctx
        .app
        .content
        .sweep_orphans(&audio(), time::Duration::ZERO, false)
        .await
        .unwrap();
    assert_eq!(swept.deleted, 1);
    assert!(!ctx.blobs.exists(&orphan_key).await.unwrap());
    assert!(ctx.blobs.exists(&kept.blob_key()).await.unwrap());
    assert!(ctx.app.content.get_info(kept.object_id).await.unwrap().is_some());
}
