//! Services of the murmur media pipeline.
//!
//! This crate ties the storage, metadata and key crates together:
//! - Content store with streaming compression, encryption and verification
//! - File key sharing and re-wrapping after key rotation
//! - Job ledger with leased claims and a stale-lease reaper
//! - Worker pool running typed job handlers

pub mod compression;
pub mod content;
pub mod error;
pub mod file_keys;
pub mod handlers;
pub mod ledger;
pub mod reaper;
pub mod state;
pub mod worker;

pub use content::{ContentStore, ContentStream, StoreProgress, StoreRequest, SweepOutcome};
pub use error::{ServiceError, ServiceResult};
pub use file_keys::{FileKeyService, RewrapOutcome};
pub use ledger::{JobChange, JobLedger, JobPage, JobQuery, ReleaseOutcome};
pub use reaper::Reaper;
pub use state::AppContext;
pub use worker::{JobContext, JobError, JobHandler, WorkerPool};
