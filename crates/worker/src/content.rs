//! Content store: streaming, encrypted, integrity-verified object storage.
//!
//! Store pipeline:
//!
//! ```text
//! plaintext -> size limit -> compression -> encryption -> re-chunk -> SHA-256 -> blob upload
//! ```
//!
//! The recorded size and digest describe the bytes as stored. Object records
//! carry an HMAC tag under the integrity key, so a digest rewritten through the
//! metadata path alone is detected on read.

use crate::compression::{PipelineStream, compress_stream, decompress_stream};
use crate::error::{ServiceError, ServiceResult};
use crate::file_keys::FileKeyService;
use async_stream::try_stream;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use hmac::{Hmac, Mac};
use murmur_core::config::ContentConfig;
use murmur_core::{Bucket, Compression, ContentHash, ContentHasher, HashAlgorithm, ObjectId, ObjectInfo};
use murmur_keys::KeyManager;
use murmur_keys::cipher::{DEFAULT_BLOCK_SIZE, DataKey, decrypt_stream, encrypt_stream};
use murmur_metadata::MetadataStore;
use murmur_metadata::models::ObjectRow;
use murmur_storage::{ObjectAttributes, ObjectStore, StorageError};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use time::OffsetDateTime;

type HmacSha256 = Hmac<Sha256>;

/// Object bytes handed back by [`ContentStore::retrieve`]. A terminal error
/// item means the bytes already delivered must be discarded.
pub type ContentStream = PipelineStream;

/// Progress of a running store operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreProgress {
    /// Plaintext bytes consumed from the caller.
    pub bytes_read: u64,
    /// Bytes written to the blob backend.
    pub bytes_stored: u64,
    /// Declared plaintext size, when known.
    pub total: Option<u64>,
}

pub type ProgressCallback = Arc<dyn Fn(StoreProgress) + Send + Sync>;

/// Result of [`ContentStore::sweep_orphans`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Blobs listed under the bucket.
    pub scanned: u64,
    /// Blobs with no object record, older than the grace period.
    pub orphaned: u64,
    /// Orphans removed. Zero on a dry run.
    pub deleted: u64,
    pub errors: u64,
}

/// Parameters of a store operation.
#[derive(Clone)]
pub struct StoreRequest {
    pub user_id: String,
    pub name: String,
    pub bucket: Bucket,
    pub declared_size: Option<u64>,
    pub content_type: Option<String>,
    /// Caller-chosen identity. Generated when absent.
    pub object_id: Option<ObjectId>,
    /// Compress with the configured codec before encryption.
    pub compress: bool,
    /// Falls back to `content.encrypt_by_default`.
    pub encrypt: Option<bool>,
    /// Falls back to `content.default_chunk_size`.
    pub chunk_size: Option<u64>,
    pub metadata: BTreeMap<String, String>,
    pub progress: Option<ProgressCallback>,
}

impl StoreRequest {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>, bucket: Bucket) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
            bucket,
            declared_size: None,
            content_type: None,
            object_id: None,
            compress: false,
            encrypt: None,
            chunk_size: None,
            metadata: BTreeMap::new(),
            progress: None,
        }
    }

    pub fn with_object_id(mut self, object_id: ObjectId) -> Self {
        self.object_id = Some(object_id);
        self
    }

    pub fn with_declared_size(mut self, size: u64) -> Self {
        self.declared_size = Some(size);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn with_encryption(mut self, encrypt: bool) -> Self {
        self.encrypt = Some(encrypt);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn on_progress(mut self, callback: impl Fn(StoreProgress) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for StoreRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreRequest")
            .field("user_id", &self.user_id)
            .field("name", &self.name)
            .field("bucket", &self.bucket)
            .field("declared_size", &self.declared_size)
            .field("object_id", &self.object_id)
            .field("compress", &self.compress)
            .field("encrypt", &self.encrypt)
            .finish_non_exhaustive()
    }
}

pub struct ContentStore {
    storage: Arc<dyn ObjectStore>,
    metadata: Arc<dyn MetadataStore>,
    keys: Arc<KeyManager>,
    file_keys: Arc<FileKeyService>,
    config: ContentConfig,
    integrity_key_name: String,
}

impl ContentStore {
    pub fn new(
        storage: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        keys: Arc<KeyManager>,
        file_keys: Arc<FileKeyService>,
        config: ContentConfig,
        integrity_key_name: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            metadata,
            keys,
            file_keys,
            config,
            integrity_key_name: integrity_key_name.into(),
        }
    }

    /// Stream `data` into the blob backend and record it.
    ///
    /// An encrypted object's wrapped data key is written in the same
    /// transaction as its record. When that write fails the blob is removed
    /// again, so no half-stored object survives.
    pub async fn store<S>(&self, request: StoreRequest, data: S) -> ServiceResult<ObjectInfo>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        self.validate_request(&request)?;
        let chunk_size = murmur_core::validate_chunk_size(
            request.chunk_size.unwrap_or(self.config.default_chunk_size),
        )?;
        let chunk_size = usize::try_from(chunk_size)
            .map_err(|_| ServiceError::Validation(format!("chunk size {chunk_size} too large")))?;

        let object_id = request.object_id.unwrap_or_default();
        let blob_key = request.bucket.blob_key(&object_id);
        if self.metadata.get_object(*object_id.as_uuid()).await?.is_some()
            || self.storage.exists(&blob_key).await?
        {
            return Err(ServiceError::Conflict(format!("object {object_id} already exists")));
        }

        let encrypted = request.encrypt.unwrap_or(self.config.encrypt_by_default);
        let compression = if request.compress {
            self.config.compression
        } else {
            Compression::None
        };

        let (data_key, key_row) = if encrypted {
            let data_key = DataKey::generate();
            let row = self.file_keys.wrap_new(object_id, &data_key).await?;
            (Some(data_key), Some(row))
        } else {
            (None, None)
        };

        let bytes_read = Arc::new(AtomicU64::new(0));
        let plaintext = limit_stream(data, self.config.max_object_size, bytes_read.clone());
        let mut stage = compress_stream(plaintext, compression);
        if let Some(data_key) = data_key {
            stage = encrypt_stream(stage, data_key, DEFAULT_BLOCK_SIZE).boxed();
        }
        let mut stage = rechunk(stage, chunk_size).boxed();

        let mut attributes = ObjectAttributes::default()
            .with_entry("object-id", object_id.to_string())
            .with_entry("encrypted", encrypted.to_string())
            .with_entry("compression", compression.as_str());
        if let Some(content_type) = &request.content_type {
            attributes = attributes.with_content_type(content_type.clone());
        }

        let mut upload = self.storage.put_stream(&blob_key, attributes).await?;
        let mut hasher = ContentHasher::new();
        let streamed: ServiceResult<()> = async {
            while let Some(chunk) = stage.next().await {
                let chunk = chunk?;
                hasher.update(&chunk);
                upload.write(chunk).await?;
                if let Some(progress) = &request.progress {
                    progress(StoreProgress {
                        bytes_read: bytes_read.load(Ordering::Relaxed),
                        bytes_stored: hasher.len(),
                        total: request.declared_size,
                    });
                }
            }
            Ok(())
        }
        .await;

        let plaintext_len = bytes_read.load(Ordering::Relaxed);
        let streamed = streamed.and_then(|()| match request.declared_size {
            Some(declared) if declared != plaintext_len => Err(ServiceError::Validation(format!(
                "declared size {declared} but received {plaintext_len} bytes"
            ))),
            _ => Ok(()),
        });
        if let Err(e) = streamed {
            if let Err(abort_err) = upload.abort().await {
                tracing::warn!(key = %blob_key, error = %abort_err, "failed to abort upload");
            }
            return Err(e);
        }
        upload.finish().await?;

        let info = ObjectInfo {
            object_id,
            bucket: request.bucket.clone(),
            user_id: request.user_id.clone(),
            name: request.name.clone(),
            content_type: request.content_type.clone(),
            size: hasher.len(),
            content_hash: hasher.finalize(),
            hash_algorithm: HashAlgorithm::Sha256,
            encrypted,
            compression,
            created_at: OffsetDateTime::now_utc(),
            metadata: request.metadata.clone(),
        };

        let recorded: ServiceResult<()> = async {
            let tag = self.seal_info(&info).await?;
            let row = ObjectRow::from_info(&info, Some(tag))?;
            self.metadata.create_object(&row, key_row.as_ref()).await?;
            Ok(())
        }
        .await;
        if let Err(e) = recorded {
            self.discard_blob(&blob_key).await;
            return Err(e);
        }

        tracing::info!(
            object_id = %object_id,
            bucket = %info.bucket,
            size = info.size,
            plaintext_size = plaintext_len,
            encrypted,
            compression = compression.as_str(),
            "object stored"
        );
        Ok(info)
    }

    /// Stream an object back.
    ///
    /// With `decrypt` set the original plaintext is returned (decrypted and
    /// decompressed); otherwise the stored bytes as-is. The stored bytes are
    /// always re-hashed as they are read and a mismatch ends the stream with
    /// [`ServiceError::HashVerification`].
    pub async fn retrieve(
        &self,
        object_id: ObjectId,
        decrypt: bool,
    ) -> ServiceResult<(ObjectInfo, ContentStream)> {
        self.open(object_id, decrypt, None).await
    }

    /// Like [`retrieve`](Self::retrieve) with decryption, using the data key
    /// shared with `user_id`.
    pub async fn retrieve_as(
        &self,
        object_id: ObjectId,
        user_id: &str,
    ) -> ServiceResult<(ObjectInfo, ContentStream)> {
        self.open(object_id, true, Some(user_id)).await
    }

    async fn open(
        &self,
        object_id: ObjectId,
        decrypt: bool,
        reader: Option<&str>,
    ) -> ServiceResult<(ObjectInfo, ContentStream)> {
        let info = self
            .load_info(object_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("object {object_id}")))?;
        let blob_key = info.blob_key();

        let data_key = if decrypt && info.encrypted {
            Some(self.file_keys.unwrap_for(object_id, reader).await?)
        } else {
            None
        };

        if self.config.verify_before_stream {
            self.verify_blob(&info).await?;
        }

        let raw = self
            .storage
            .get_stream(&blob_key)
            .await?
            .map(|chunk| chunk.map_err(ServiceError::from));
        let mut stream = verify_stream(raw, object_id, info.size, info.content_hash).boxed();
        if decrypt {
            if let Some(data_key) = data_key {
                stream = decrypt_stream(stream, data_key).boxed();
            }
            stream = decompress_stream(stream, info.compression);
        }

        tracing::debug!(object_id = %object_id, decrypt, "object opened");
        Ok((info, stream))
    }

    /// Delete an object, its key material and its jobs. Returns `false` when
    /// nothing existed.
    pub async fn delete(&self, object_id: ObjectId) -> ServiceResult<bool> {
        let Some(row) = self.metadata.get_object(*object_id.as_uuid()).await? else {
            return Ok(false);
        };
        let bucket = Bucket::new(row.bucket.clone())?;
        let blob_key = bucket.blob_key(&object_id);

        let removed_record = self.metadata.delete_object_cascade(row.object_id).await?;
        let removed_blob = match self.storage.delete(&blob_key).await {
            Ok(()) => true,
            Err(StorageError::NotFound(_)) => {
                tracing::warn!(object_id = %object_id, key = %blob_key, "object record had no blob");
                false
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(object_id = %object_id, "object deleted");
        Ok(removed_record || removed_blob)
    }

    /// Verified object metadata, or `None` if the object does not exist.
    pub async fn get_info(&self, object_id: ObjectId) -> ServiceResult<Option<ObjectInfo>> {
        self.load_info(object_id).await
    }

    /// Total stored bytes in `bucket`.
    pub async fn get_bucket_size(&self, bucket: &Bucket) -> ServiceResult<u64> {
        Ok(self.metadata.bucket_size(bucket.as_str()).await?)
    }

    /// Remove blobs in `bucket` that no object record points at.
    ///
    /// A crash between upload and metadata commit leaves such blobs behind.
    /// Blobs younger than `grace` are skipped since their store may still be
    /// running. With `dry_run` orphans are only counted.
    pub async fn sweep_orphans(
        &self,
        bucket: &Bucket,
        grace: time::Duration,
        dry_run: bool,
    ) -> ServiceResult<SweepOutcome> {
        let cutoff = OffsetDateTime::now_utc() - grace;
        let mut outcome = SweepOutcome::default();

        for key in self.storage.list(&format!("{bucket}/")).await? {
            outcome.scanned += 1;
            let Some(object_id) = key
                .rsplit_once('/')
                .and_then(|(_, id)| ObjectId::parse(id).ok())
            else {
                tracing::warn!(key = %key, "skipping blob with a foreign key layout");
                continue;
            };
            match self.metadata.get_object(*object_id.as_uuid()).await? {
                Some(row) if row.bucket == bucket.as_str() => continue,
                _ => {}
            }

            let meta = match self.storage.stat(&key).await {
                Ok(meta) => meta,
                Err(StorageError::NotFound(_)) => continue,
                Err(e) => {
                    outcome.errors += 1;
                    tracing::warn!(key = %key, error = %e, "failed to stat blob");
                    continue;
                }
            };
            if meta.last_modified.is_none_or(|modified| modified > cutoff) {
                continue;
            }

            outcome.orphaned += 1;
            if dry_run {
                tracing::info!(key = %key, size = meta.size, "orphaned blob (dry run)");
                continue;
            }
            match self.storage.delete(&key).await {
                Ok(()) | Err(StorageError::NotFound(_)) => {
                    outcome.deleted += 1;
                    tracing::info!(key = %key, size = meta.size, "orphaned blob deleted");
                }
                Err(e) => {
                    outcome.errors += 1;
                    tracing::warn!(key = %key, error = %e, "failed to delete orphaned blob");
                }
            }
        }

        tracing::info!(
            bucket = %bucket,
            scanned = outcome.scanned,
            orphaned = outcome.orphaned,
            deleted = outcome.deleted,
            errors = outcome.errors,
            dry_run,
            "orphan sweep finished"
        );
        Ok(outcome)
    }

    pub async fn list_objects(
        &self,
        bucket: Option<&Bucket>,
        user_id: Option<&str>,
        limit: u32,
    ) -> ServiceResult<Vec<ObjectInfo>> {
        let rows = self
            .metadata
            .list_objects(bucket.map(Bucket::as_str), user_id, limit)
            .await?;
        let mut objects = Vec::with_capacity(rows.len());
        for row in rows {
            let info = ObjectInfo::try_from(&row)?;
            self.verify_info(&info, row.metadata_mac.as_deref()).await?;
            objects.push(info);
        }
        Ok(objects)
    }

    fn validate_request(&self, request: &StoreRequest) -> ServiceResult<()> {
        if request.user_id.trim().is_empty() {
            return Err(ServiceError::Validation("user id must not be empty".to_string()));
        }
        if request.name.trim().is_empty() {
            return Err(ServiceError::Validation("object name must not be empty".to_string()));
        }
        if let Some(size) = request.declared_size
            && size > self.config.max_object_size
        {
            return Err(ServiceError::Validation(format!(
                "declared size {size} exceeds maximum of {} bytes",
                self.config.max_object_size
            )));
        }
        if !self
            .config
            .allows_content_type(request.content_type.as_deref())
        {
            return Err(ServiceError::Validation(format!(
                "content type {:?} is not accepted",
                request.content_type
            )));
        }
        Ok(())
    }

    async fn load_info(&self, object_id: ObjectId) -> ServiceResult<Option<ObjectInfo>> {
        let Some(row) = self.metadata.get_object(*object_id.as_uuid()).await? else {
            return Ok(None);
        };
        let info = ObjectInfo::try_from(&row)?;
        self.verify_info(&info, row.metadata_mac.as_deref()).await?;
        Ok(Some(info))
    }

    /// First pass over the stored blob, before any byte reaches the caller.
    async fn verify_blob(&self, info: &ObjectInfo) -> ServiceResult<()> {
        let mut raw = self.storage.get_stream(&info.blob_key()).await?;
        let mut hasher = ContentHasher::new();
        while let Some(chunk) = raw.next().await {
            hasher.update(&chunk?);
            if hasher.len() > info.size {
                break;
            }
        }
        check_digest(info.object_id, info.size, &info.content_hash, hasher)
    }

    async fn seal_info(&self, info: &ObjectInfo) -> ServiceResult<String> {
        let key = self.keys.get_or_create_key(&self.integrity_key_name).await?;
        let tag = integrity_tag(key.as_bytes(), info)?.finalize().into_bytes();
        Ok(format!("v{}:{}", key.version(), STANDARD.encode(tag)))
    }

    async fn verify_info(&self, info: &ObjectInfo, tag: Option<&str>) -> ServiceResult<()> {
        let corrupt = |why: &str| {
            ServiceError::HashVerification(format!(
                "metadata of object {} {why}",
                info.object_id
            ))
        };
        let tag = tag.ok_or_else(|| corrupt("carries no integrity tag"))?;
        let (version, encoded) = tag
            .strip_prefix('v')
            .and_then(|rest| rest.split_once(':'))
            .ok_or_else(|| corrupt("has a malformed integrity tag"))?;
        let version: u32 = version
            .parse()
            .map_err(|_| corrupt("has a malformed integrity tag"))?;
        let expected = STANDARD
            .decode(encoded)
            .map_err(|_| corrupt("has a malformed integrity tag"))?;

        let key = self
            .keys
            .get_key_version(&self.integrity_key_name, version)
            .await?;
        integrity_tag(key.as_bytes(), info)?
            .verify_slice(&expected)
            .map_err(|_| corrupt("failed its integrity check"))
    }

    async fn discard_blob(&self, blob_key: &str) {
        match self.storage.delete(blob_key).await {
            Ok(()) | Err(StorageError::NotFound(_)) => {
                tracing::debug!(key = %blob_key, "rolled back blob");
            }
            Err(e) => {
                tracing::error!(key = %blob_key, error = %e, "failed to roll back blob");
            }
        }
    }
}

/// HMAC over the fields that make an object record trustworthy.
fn integrity_tag(key: &[u8], info: &ObjectInfo) -> ServiceResult<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| {
        ServiceError::KeyManagement(murmur_keys::KeyError::InvalidKey(format!(
            "integrity key: {e}"
        )))
    })?;
    let message = format!(
        "murmur-object-v1\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}",
        info.object_id,
        info.bucket,
        info.user_id,
        info.size,
        info.content_hash.to_hex(),
        info.hash_algorithm.as_str(),
        info.encrypted,
        info.compression.as_str(),
    );
    mac.update(message.as_bytes());
    Ok(mac)
}

fn check_digest(
    object_id: ObjectId,
    expected_size: u64,
    expected: &ContentHash,
    hasher: ContentHasher,
) -> ServiceResult<()> {
    let size = hasher.len();
    let actual = hasher.finalize();
    if size != expected_size || actual != *expected {
        return Err(ServiceError::HashVerification(format!(
            "object {object_id}: expected {expected} ({expected_size} bytes), read {actual} ({size} bytes)"
        )));
    }
    Ok(())
}

/// Count plaintext bytes and fail once `max` is exceeded.
fn limit_stream<S>(
    input: S,
    max: u64,
    counter: Arc<AtomicU64>,
) -> impl Stream<Item = ServiceResult<Bytes>> + Send + 'static
where
    S: Stream<Item = io::Result<Bytes>> + Send + 'static,
{
    try_stream! {
        futures::pin_mut!(input);
        let mut total = 0u64;
        while let Some(chunk) = input.next().await {
            let chunk = chunk?;
            total += chunk.len() as u64;
            counter.store(total, Ordering::Relaxed);
            if total > max {
                Err::<(), _>(ServiceError::Validation(format!(
                    "object exceeds maximum size of {max} bytes"
                )))?;
            }
            yield chunk;
        }
    }
}

/// Regroup a stream into `chunk_size` pieces; the last may be shorter.
fn rechunk<S>(input: S, chunk_size: usize) -> impl Stream<Item = ServiceResult<Bytes>> + Send + 'static
where
    S: Stream<Item = ServiceResult<Bytes>> + Send + 'static,
{
    try_stream! {
        futures::pin_mut!(input);
        let mut buffer = BytesMut::new();
        while let Some(chunk) = input.next().await {
            buffer.extend_from_slice(&chunk?);
            while buffer.len() >= chunk_size {
                yield buffer.split_to(chunk_size).freeze();
            }
        }
        if !buffer.is_empty() {
            yield buffer.freeze();
        }
    }
}

/// Pass stored bytes through while hashing them; ends with an error item if
/// they do not match the recorded digest.
fn verify_stream<S>(
    input: S,
    object_id: ObjectId,
    expected_size: u64,
    expected: ContentHash,
) -> impl Stream<Item = ServiceResult<Bytes>> + Send + 'static
where
    S: Stream<Item = ServiceResult<Bytes>> + Send + 'static,
{
    try_stream! {
        futures::pin_mut!(input);
        let mut hasher = ContentHasher::new();
        while let Some(chunk) = input.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            if hasher.len() > expected_size {
                Err::<(), _>(ServiceError::HashVerification(format!(
                    "object {object_id} is longer than its recorded {expected_size} bytes"
                )))?;
            }
            yield chunk;
        }
        check_digest(object_id, expected_size, &expected, hasher)?;
    }
}
