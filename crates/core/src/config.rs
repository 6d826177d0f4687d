//! Configuration types shared across crates.

use crate::object::Compression;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Blob backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for blobs.
        path: PathBuf,
    },
    /// S3-compatible storage.
    S3 {
        bucket: String,
        /// Optional endpoint URL (MinIO, Ceph, ...).
        endpoint: Option<String>,
        region: Option<String>,
        /// Optional key prefix inside the bucket.
        prefix: Option<String>,
        /// Falls back to AWS_ACCESS_KEY_ID when unset.
        access_key_id: Option<String>,
        /// Falls back to AWS_SECRET_ACCESS_KEY when unset.
        secret_access_key: Option<String>,
        /// Path-style addressing, required by MinIO.
        #[serde(default)]
        force_path_style: bool,
        /// Per-request timeout in seconds.
        #[serde(default = "default_s3_timeout_secs")]
        request_timeout_secs: u64,
    },
}

fn default_s3_timeout_secs() -> u64 {
    60
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/blobs"),
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                access_key_id,
                secret_access_key,
                request_timeout_secs,
                ..
            } => {
                if *request_timeout_secs == 0 {
                    return Err("storage.request_timeout_secs must be at least 1".to_string());
                }
                match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                    (Some(_), Some(_)) | (None, None) => Ok(()),
                    _ => Err(
                        "s3 config requires both access_key_id and secret_access_key when either is set"
                            .to_string(),
                    ),
                }
            }
            StorageConfig::Filesystem { .. } => Ok(()),
        }
    }
}

/// PostgreSQL SSL mode configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    Disable,
    #[default]
    Prefer,
    Require,
}

/// Relational store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database. Suited to tests and single-host deployments.
    Sqlite {
        path: PathBuf,
        /// Busy timeout in milliseconds while waiting on the write lock.
        #[serde(default = "default_sqlite_busy_timeout_ms")]
        busy_timeout_ms: u64,
    },
    /// PostgreSQL database.
    Postgres {
        /// Connection URL. Takes precedence over the individual fields.
        url: Option<String>,
        host: Option<String>,
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        username: Option<String>,
        /// Prefer MURMUR_METADATA__PASSWORD over storing this in a file.
        password: Option<String>,
        database: Option<String>,
        ssl_mode: Option<PgSslMode>,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Server-side statement timeout in milliseconds.
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
}

fn default_sqlite_busy_timeout_ms() -> u64 {
    5_000
}

fn default_max_connections() -> u32 {
    10
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(30_000)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/murmur.db"),
            busy_timeout_ms: default_sqlite_busy_timeout_ms(),
        }
    }
}

impl MetadataConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { .. } => Ok(()),
            MetadataConfig::Postgres {
                url,
                host,
                database,
                max_connections,
                ..
            } => {
                if *max_connections == 0 {
                    return Err("metadata.max_connections must be at least 1".to_string());
                }
                match (url.as_ref(), host.as_ref(), database.as_ref()) {
                    (Some(_), _, _) | (None, Some(_), Some(_)) => Ok(()),
                    (None, None, _) => Err(
                        "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                    ),
                    (None, Some(_), None) => Err(
                        "postgres config requires 'database' when using individual fields"
                            .to_string(),
                    ),
                }
            }
        }
    }
}

/// Content store limits and defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContentConfig {
    /// Size of the chunks written to the blob backend.
    #[serde(default = "default_chunk_size")]
    pub default_chunk_size: u64,
    /// Largest object accepted, measured on the incoming plaintext.
    #[serde(default = "default_max_object_size")]
    pub max_object_size: u64,
    /// Accepted MIME types. Empty accepts anything. Entries ending in `/*`
    /// match a whole top-level type.
    #[serde(default)]
    pub allowed_content_types: Vec<String>,
    /// Encrypt objects whose store request does not say otherwise.
    #[serde(default = "default_true")]
    pub encrypt_by_default: bool,
    /// Compression applied when a store request asks for compression.
    #[serde(default = "default_compression")]
    pub compression: Compression,
    /// Hash the full stored blob before yielding any byte on retrieve.
    #[serde(default = "default_true")]
    pub verify_before_stream: bool,
}

fn default_chunk_size() -> u64 {
    crate::DEFAULT_CHUNK_SIZE
}

fn default_max_object_size() -> u64 {
    4 * 1024 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_compression() -> Compression {
    Compression::Zstd
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: default_chunk_size(),
            max_object_size: default_max_object_size(),
            allowed_content_types: Vec::new(),
            encrypt_by_default: true,
            compression: default_compression(),
            verify_before_stream: true,
        }
    }
}

impl ContentConfig {
    pub fn validate(&self) -> Result<(), String> {
        crate::validate_chunk_size(self.default_chunk_size).map_err(|e| e.to_string())?;
        if self.max_object_size == 0 {
            return Err("content.max_object_size must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Whether a declared MIME type is accepted.
    pub fn allows_content_type(&self, content_type: Option<&str>) -> bool {
        if self.allowed_content_types.is_empty() {
            return true;
        }
        let Some(content_type) = content_type else {
            return false;
        };
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        self.allowed_content_types.iter().any(|allowed| {
            let allowed = allowed.to_ascii_lowercase();
            match allowed.strip_suffix("/*") {
                Some(top) => essence
                    .split_once('/')
                    .is_some_and(|(t, _)| t == top),
                None => allowed == essence,
            }
        })
    }
}

/// Job ledger timing and retry policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobConfig {
    /// How long a claim stays valid without completion.
    #[serde(default = "default_lease_duration_secs")]
    pub lease_duration_secs: u64,
    /// Upper bound on how long a job may stay in processing, regardless of lease.
    #[serde(default = "default_max_lease_minutes")]
    pub max_lease_minutes: u64,
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Attempts for claim/release when the database reports a transient error.
    #[serde(default = "default_db_retry_attempts")]
    pub db_retry_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub db_retry_backoff_ms: u64,
}

fn default_lease_duration_secs() -> u64 {
    300
}

fn default_max_lease_minutes() -> u64 {
    60
}

fn default_reaper_interval_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_db_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    100
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            lease_duration_secs: default_lease_duration_secs(),
            max_lease_minutes: default_max_lease_minutes(),
            reaper_interval_secs: default_reaper_interval_secs(),
            default_max_retries: default_max_retries(),
            db_retry_attempts: default_db_retry_attempts(),
            db_retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl JobConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn db_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.db_retry_backoff_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.lease_duration_secs == 0 {
            return Err("jobs.lease_duration_secs must be at least 1".to_string());
        }
        if self.lease_duration_secs > i64::MAX as u64 {
            return Err(format!(
                "jobs.lease_duration_secs {} exceeds maximum value {}",
                self.lease_duration_secs,
                i64::MAX
            ));
        }
        // tokio::time::interval panics on a zero period
        if self.reaper_interval_secs == 0 {
            return Err("jobs.reaper_interval_secs must be at least 1".to_string());
        }
        if self.max_lease_minutes == 0 {
            return Err("jobs.max_lease_minutes must be at least 1".to_string());
        }
        if self.db_retry_attempts == 0 {
            return Err("jobs.db_retry_attempts must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Secret vault backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum VaultConfig {
    /// In-process vault. Keys are lost on restart.
    Memory,
    /// Versioned key files under a directory.
    File { path: PathBuf },
    /// HashiCorp Vault KV version 2 engine.
    Http {
        /// Base address, e.g. "https://vault.internal:8200".
        address: String,
        /// KV mount point.
        #[serde(default = "default_vault_mount")]
        mount: String,
        /// Token value. Prefer `token_env`.
        token: Option<String>,
        /// Environment variable holding the token.
        #[serde(default = "default_vault_token_env")]
        token_env: String,
        namespace: Option<String>,
        #[serde(default = "default_vault_timeout_secs")]
        request_timeout_secs: u64,
    },
}

fn default_vault_mount() -> String {
    "secret".to_string()
}

fn default_vault_token_env() -> String {
    "VAULT_TOKEN".to_string()
}

fn default_vault_timeout_secs() -> u64 {
    10
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self::File {
            path: PathBuf::from("./data/keys"),
        }
    }
}

/// Key lifecycle configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyConfig {
    #[serde(default)]
    pub vault: VaultConfig,
    /// Key-encryption key that wraps per-object data keys.
    #[serde(default = "default_master_key_name")]
    pub master_key_name: String,
    /// Key used to authenticate object metadata records.
    #[serde(default = "default_integrity_key_name")]
    pub integrity_key_name: String,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Attempts for vault calls that fail transiently.
    #[serde(default = "default_key_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_master_key_name() -> String {
    "master".to_string()
}

fn default_integrity_key_name() -> String {
    "metadata-integrity".to_string()
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_key_retry_attempts() -> u32 {
    3
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            vault: VaultConfig::default(),
            master_key_name: default_master_key_name(),
            integrity_key_name: default_integrity_key_name(),
            cache_ttl_secs: default_cache_ttl_secs(),
            retry_attempts: default_key_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl KeyConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.master_key_name.is_empty() || self.integrity_key_name.is_empty() {
            return Err("keys.master_key_name and keys.integrity_key_name must be set".to_string());
        }
        if self.master_key_name == self.integrity_key_name {
            return Err("keys.master_key_name and keys.integrity_key_name must differ".to_string());
        }
        if self.retry_attempts == 0 {
            return Err("keys.retry_attempts must be at least 1".to_string());
        }
        if let VaultConfig::Http {
            address,
            request_timeout_secs,
            ..
        } = &self.vault
        {
            if !(address.starts_with("http://") || address.starts_with("https://")) {
                return Err(format!("keys.vault.address must be an http(s) URL: {address}"));
            }
            if *request_timeout_secs == 0 {
                return Err("keys.vault.request_timeout_secs must be at least 1".to_string());
            }
        }
        Ok(())
    }
}

/// Worker pool configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Lease owner id. Generated per process when unset.
    #[serde(default)]
    pub worker_id: Option<String>,
    /// Claim loops run concurrently in one process.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Sleep between claims when the ledger is empty.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How often a running job's row is checked for cancellation.
    #[serde(default = "default_cancel_poll_interval_ms")]
    pub cancel_poll_interval_ms: u64,
    /// Job types this worker claims. Empty claims any type.
    #[serde(default)]
    pub job_types: Vec<String>,
}

fn default_concurrency() -> usize {
    1
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_cancel_poll_interval_ms() -> u64 {
    2_000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            cancel_poll_interval_ms: default_cancel_poll_interval_ms(),
            job_types: Vec::new(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cancel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_interval_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.concurrency == 0 {
            return Err("worker.concurrency must be at least 1".to_string());
        }
        if self.poll_interval_ms == 0 || self.cancel_poll_interval_ms == 0 {
            return Err("worker poll intervals must be at least 1ms".to_string());
        }
        Ok(())
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub content: ContentConfig,
    #[serde(default)]
    pub jobs: JobConfig,
    #[serde(default)]
    pub keys: KeyConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl AppConfig {
    /// Create a configuration rooted in `dir`.
    ///
    /// **For testing only.** Uses filesystem storage, SQLite metadata and an
    /// in-memory vault.
    pub fn for_testing(dir: &std::path::Path) -> Self {
        Self {
            storage: StorageConfig::Filesystem {
                path: dir.join("blobs"),
            },
            metadata: MetadataConfig::Sqlite {
                path: dir.join("murmur.db"),
                busy_timeout_ms: default_sqlite_busy_timeout_ms(),
            },
            content: ContentConfig {
                default_chunk_size: crate::MIN_CHUNK_SIZE,
                ..ContentConfig::default()
            },
            jobs: JobConfig::default(),
            keys: KeyConfig {
                vault: VaultConfig::Memory,
                ..KeyConfig::default()
            },
            worker: WorkerConfig {
                poll_interval_ms: 20,
                cancel_poll_interval_ms: 20,
                ..WorkerConfig::default()
            },
        }
    }

    /// Validate every section, reporting the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        self.storage.validate()?;
        self.metadata.validate()?;
        self.content.validate()?;
        self.jobs.validate()?;
        self.keys.validate()?;
        self.worker.validate()
    }
}
