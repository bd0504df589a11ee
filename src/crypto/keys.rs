//! Key hierarchy: passphrase -> master key -> content key

use crate::config::EncryptionConfig;
use crate::crypto::{derive_key, KEY_SIZE};
use crate::error::{Error, Result};
use ring::hkdf::{Salt, HKDF_SHA256};
use zeroize::Zeroizing;

/// HKDF purpose for the key that seals file contents
const CONTENT_PURPOSE: &[u8] = b"cryptmirror-content-v1";

struct HkdfKeyType;

impl ring::hkdf::KeyType for HkdfKeyType {
    fn len(&self) -> usize {
        KEY_SIZE
    }
}

/// Root key stretched from the user's passphrase
pub struct MasterKey {
    key: Zeroizing<[u8; KEY_SIZE]>,
    salt: Vec<u8>,
}

impl MasterKey {
    /// Derive the master key from a passphrase and the configured salt
    pub fn from_password(password: &[u8], config: &EncryptionConfig) -> Result<Self> {
        let derived = derive_key(password, &config.salt, config)?;

        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        key.copy_from_slice(derived.key());

        Ok(Self {
            key,
            salt: config.salt.clone(),
        })
    }

    /// Derive the content key used by the stream adapter
    pub fn content_key(&self) -> Result<ContentKey> {
        let prk = Salt::new(HKDF_SHA256, &self.salt).extract(&self.key[..]);

        let mut output = Zeroizing::new([0u8; KEY_SIZE]);
        prk.expand(&[CONTENT_PURPOSE], HkdfKeyType)
            .map_err(|_| Error::KeyDerivation("HKDF expansion failed".to_string()))?
            .fill(&mut output[..])
            .map_err(|_| Error::KeyDerivation("HKDF fill failed".to_string()))?;

        Ok(ContentKey(output))
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

/// Key sealing every encrypted file of a mount (zeroized on drop)
#[derive(Clone)]
pub struct ContentKey(Zeroizing<[u8; KEY_SIZE]>);

impl ContentKey {
    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        ContentKey(Zeroizing::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ContentKey(<redacted>)")
    }
}
