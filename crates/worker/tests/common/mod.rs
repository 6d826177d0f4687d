//! Common test utilities and fixtures.

pub mod context;
pub mod fixtures;

#[allow(unused_imports)]
pub use context::*;
#[allow(unused_imports)]
pub use fixtures::*;
