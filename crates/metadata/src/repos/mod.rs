//! Repository traits for metadata operations.

pub mod file_keys;
pub mod jobs;
pub mod objects;

pub use file_keys::FileKeyRepo;
pub use jobs::{JobFilter, JobRepo, JobUpdate};
pub use objects::ObjectRepo;
