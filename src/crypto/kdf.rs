//! Passphrase stretching with Argon2id

use crate::config::EncryptionConfig;
use crate::crypto::{KEY_SIZE, SALT_SIZE};
use crate::error::{Error, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use zeroize::Zeroizing;

/// Key material stretched from a passphrase
pub struct DerivedKey {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl DerivedKey {
    /// Get the key bytes
    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey(<redacted>)")
    }
}

/// Stretch a passphrase into a key using Argon2id.
///
/// The salt is mandatory: the same passphrase must yield the same key on
/// every mount, so the caller persists the salt alongside the config.
pub fn derive_key(passphrase: &[u8], salt: &[u8], config: &EncryptionConfig) -> Result<DerivedKey> {
    if passphrase.is_empty() {
        return Err(Error::KeyDerivation("Passphrase must not be empty".to_string()));
    }

    if salt.len() != SALT_SIZE {
        return Err(Error::KeyDerivation(format!(
            "Salt has {} bytes, need {}",
            salt.len(),
            SALT_SIZE
        )));
    }

    let params = Params::new(
        config.argon2_memory_kib,
        config.argon2_iterations,
        config.argon2_parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| Error::KeyDerivation(format!("Invalid Argon2 parameters: {}", e)))?;

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password_into(passphrase, salt, &mut key[..])
        .map_err(|e| Error::KeyDerivation(format!("Key derivation failed: {}", e)))?;

    Ok(DerivedKey { key })
}

/// Generate a random salt
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}
