//! Core domain types and shared logic for the murmur media pipeline.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Job identifiers, statuses, priorities and list cursors
//! - Stored object identifiers, buckets and descriptive metadata
//! - Content hashing
//! - Configuration for every subsystem

pub mod config;
pub mod error;
pub mod hash;
pub mod job;
pub mod object;

pub use error::{Error, Result};
pub use hash::{ContentHash, ContentHasher, HashAlgorithm};
pub use job::{Job, JobCursor, JobId, JobPayload, JobPriority, JobStatus};
pub use object::{Bucket, Compression, ObjectId, ObjectInfo};

/// Default streaming chunk size: 8 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Maximum streaming chunk size: 64 MiB
pub const MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Minimum streaming chunk size: 64 KiB
pub const MIN_CHUNK_SIZE: u64 = 64 * 1024;

/// Validate a requested chunk size against the supported range.
pub fn validate_chunk_size(size: u64) -> Result<u64> {
    if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&size) {
        return Err(Error::InvalidChunkSize {
            size,
            min: MIN_CHUNK_SIZE,
            max: MAX_CHUNK_SIZE,
        });
    }
    Ok(size)
}
