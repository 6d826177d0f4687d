//! Job ledger domain types.

use crate::object::ObjectId;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// Unique identifier for a job.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidId(format!("invalid job ID: {e}")))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job lifecycle state.
///
/// `Processing` is the only state that carries a lease.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Completed and cancelled jobs never move again. Failed jobs may be retried.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a job in this state may be cancelled.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }

    /// Whether the ledger permits moving from `self` to `next`.
    ///
    /// Staying in the same state is allowed so progress-only updates pass.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Pending)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Failed, Pending)
        )
    }

    /// Entering one of these states drops any lease unconditionally.
    pub fn clears_lease(&self) -> bool {
        !matches!(self, Self::Processing)
    }
}

impl FromStr for JobStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(crate::Error::InvalidStatus(other.to_string())),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Claim priority. Higher values are claimed first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
}

impl JobPriority {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    pub fn from_i32(value: i32) -> crate::Result<Self> {
        match value {
            0 => Ok(Self::Low),
            1 => Ok(Self::Normal),
            2 => Ok(Self::High),
            other => Err(crate::Error::InvalidPriority(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

impl FromStr for JobPriority {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            other => Err(crate::Error::InvalidPriority(other.to_string())),
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a job operates on. References other entities by id only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Job kind, e.g. "transcription".
    pub job_type: String,
    pub user_id: String,
    pub object_id: Option<ObjectId>,
    /// Handler-specific parameters.
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
}

impl JobPayload {
    pub fn new(job_type: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            user_id: user_id.into(),
            object_id: None,
            parameters: None,
        }
    }

    pub fn with_object(mut self, object_id: ObjectId) -> Self {
        self.object_id = Some(object_id);
        self
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = Some(parameters);
        self
    }
}

/// A unit of asynchronous work tracked by the job ledger.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub priority: JobPriority,
    /// Percentage in 0..=100, never decreasing.
    pub progress: u8,
    pub retry_count: u32,
    pub max_retries: u32,
    pub owner_lease_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub lease_expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
}

impl Job {
    /// Whether another retry is permitted.
    pub fn can_retry(&self) -> bool {
        self.status == JobStatus::Failed && self.retry_count < self.max_retries
    }

    /// Whether the job currently holds a live lease.
    pub fn holds_lease_at(&self, now: OffsetDateTime) -> bool {
        self.status == JobStatus::Processing
            && self.owner_lease_id.is_some()
            && self.lease_expires_at.is_some_and(|expires| expires > now)
    }

    /// Cursor pointing just past this job in a listing.
    pub fn cursor(&self) -> JobCursor {
        JobCursor {
            created_at: self.created_at,
            job_id: self.id,
        }
    }
}

/// Keyset pagination position over `(created_at, job_id)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobCursor {
    pub created_at: OffsetDateTime,
    pub job_id: JobId,
}

impl JobCursor {
    /// Encode as an opaque URL-safe token.
    pub fn encode(&self) -> String {
        let raw = format!("{}|{}", self.created_at.unix_timestamp_nanos(), self.job_id);
        URL_SAFE_NO_PAD.encode(raw)
    }

    pub fn decode(token: &str) -> crate::Result<Self> {
        let raw = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| crate::Error::InvalidCursor(e.to_string()))?;
        let raw = String::from_utf8(raw).map_err(|e| crate::Error::InvalidCursor(e.to_string()))?;
        let (nanos, id) = raw
            .split_once('|')
            .ok_or_else(|| crate::Error::InvalidCursor("missing separator".to_string()))?;
        let nanos: i128 = nanos
            .parse()
            .map_err(|_| crate::Error::InvalidCursor(format!("bad timestamp: {nanos}")))?;
        let created_at = OffsetDateTime::from_unix_timestamp_nanos(nanos)
            .map_err(|e| crate::Error::InvalidCursor(e.to_string()))?;
        let job_id = JobId::parse(id).map_err(|e| crate::Error::InvalidCursor(e.to_string()))?;
        Ok(Self { created_at, job_id })
    }
}
