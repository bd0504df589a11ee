//! Cryptography module for cryptmirror
//!
//! Provides AES-256-GCM encryption with Argon2id key derivation, and the
//! stream adapter the transform pipeline runs file contents through.

mod adapter;
mod encryption;
mod kdf;
mod keys;

pub use adapter::{AeadStreamAdapter, CryptoAdapter, Direction, ENVELOPE_MAGIC, ENVELOPE_OVERHEAD};
pub use encryption::{decrypt, encrypt, EncryptedData};
pub use kdf::{derive_key, generate_salt, DerivedKey};
pub use keys::{ContentKey, MasterKey};

/// Size of AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of GCM nonce in bytes
pub const NONCE_SIZE: usize = 12;

/// Size of GCM authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Size of salt for key derivation
pub const SALT_SIZE: usize = 32;
