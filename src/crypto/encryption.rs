//! AES-256-GCM sealing of whole buffers

use crate::crypto::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};
use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};

/// Nonce plus ciphertext (the GCM tag is appended to the ciphertext)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedData {
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

impl EncryptedData {
    /// Serialize as `nonce || ciphertext || tag`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NONCE_SIZE + self.ciphertext.len());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parse the layout produced by [`EncryptedData::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < NONCE_SIZE + TAG_SIZE {
            return Err(Error::Crypto(format!(
                "Ciphertext truncated: {} bytes, need at least {}",
                bytes.len(),
                NONCE_SIZE + TAG_SIZE
            )));
        }

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[..NONCE_SIZE]);

        Ok(EncryptedData {
            nonce,
            ciphertext: bytes[NONCE_SIZE..].to_vec(),
        })
    }
}

fn sealing_key(key: &[u8; KEY_SIZE]) -> Result<LessSafeKey> {
    let unbound = UnboundKey::new(&AES_256_GCM, key)
        .map_err(|_| Error::Crypto("Invalid AES-256 key".to_string()))?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypt `plaintext` under a fresh random nonce
pub fn encrypt(key: &[u8; KEY_SIZE], plaintext: &[u8], aad: &[u8]) -> Result<EncryptedData> {
    let key = sealing_key(key)?;

    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);

    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce),
        Aad::from(aad),
        &mut in_out,
    )
    .map_err(|_| Error::Crypto("Encryption failed".to_string()))?;

    Ok(EncryptedData {
        nonce,
        ciphertext: in_out,
    })
}

/// Decrypt and authenticate
pub fn decrypt(key: &[u8; KEY_SIZE], data: &EncryptedData, aad: &[u8]) -> Result<Vec<u8>> {
    let key = sealing_key(key)?;

    let mut in_out = data.ciphertext.clone();
    let plaintext_len = key
        .open_in_place(
            Nonce::assume_unique_for_key(data.nonce),
            Aad::from(aad),
            &mut in_out,
        )
        .map_err(|_| Error::Crypto("Authentication failed (wrong key or corrupted file)".to_string()))?
        .len();

    in_out.truncate(plaintext_len);
    Ok(in_out)
}
