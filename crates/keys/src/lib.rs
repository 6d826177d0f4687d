//! Key lifecycle management and streaming encryption for murmur.
//!
//! This crate provides:
//! - Versioned secret vault backends (memory, directory, HashiCorp Vault KV v2)
//! - A cached, retrying [`KeyManager`] over a vault
//! - Block-wise XChaCha20-Poly1305 stream encryption and data-key wrapping

pub mod cipher;
pub mod error;
pub mod manager;
pub mod vault;

pub use cipher::{DataKey, StreamDecryptor, StreamEncryptor, decrypt_stream, encrypt_stream};
pub use error::{KeyError, KeyResult};
pub use manager::{KeyManager, KeyMaterial};
pub use vault::{SecretVault, VaultSecret};
