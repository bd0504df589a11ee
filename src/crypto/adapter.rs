//! Stream adapter between real files and plaintext buffers

use crate::crypto::{decrypt, encrypt, ContentKey, EncryptedData, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};
use std::io::{Read, Write};

/// Leading bytes of every encrypted file; also bound in as AAD
pub const ENVELOPE_MAGIC: &[u8; 4] = b"CMF1";

/// Bytes an envelope adds on top of the plaintext
pub const ENVELOPE_OVERHEAD: u64 = (ENVELOPE_MAGIC.len() + NONCE_SIZE + TAG_SIZE) as u64;

/// Which way a stream is transformed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

/// Transforms everything readable from `source` into `dest`.
///
/// Both streams are left positioned at their end. Cipher failures surface as
/// [`Error::Crypto`], stream failures as [`Error::Io`].
pub trait CryptoAdapter: Send + Sync {
    fn transform(
        &self,
        source: &mut dyn Read,
        dest: &mut dyn Write,
        direction: Direction,
        key: &ContentKey,
    ) -> Result<()>;

    /// Plaintext length for a ciphertext of the given size, when the
    /// envelope makes it computable without decrypting.
    fn plaintext_len(&self, _ciphertext_len: u64) -> Option<u64> {
        None
    }
}

/// Whole-stream AES-256-GCM envelope: `magic || nonce || ciphertext || tag`
#[derive(Debug, Default, Clone, Copy)]
pub struct AeadStreamAdapter;

impl AeadStreamAdapter {
    pub fn new() -> Self {
        AeadStreamAdapter
    }

    fn seal(&self, plaintext: &[u8], key: &ContentKey) -> Result<Vec<u8>> {
        let sealed = encrypt(key.as_bytes(), plaintext, ENVELOPE_MAGIC)?;

        let mut out = Vec::with_capacity(plaintext.len() + ENVELOPE_OVERHEAD as usize);
        out.extend_from_slice(ENVELOPE_MAGIC);
        out.extend_from_slice(&sealed.to_bytes());
        Ok(out)
    }

    fn open(&self, envelope: &[u8], key: &ContentKey) -> Result<Vec<u8>> {
        // A zero-byte file has never been sealed; it holds the empty plaintext.
        if envelope.is_empty() {
            return Ok(Vec::new());
        }

        let body = envelope
            .strip_prefix(ENVELOPE_MAGIC.as_slice())
            .ok_or_else(|| Error::Crypto("Missing envelope header".to_string()))?;

        let data = EncryptedData::from_bytes(body)?;
        decrypt(key.as_bytes(), &data, ENVELOPE_MAGIC)
    }
}

impl CryptoAdapter for AeadStreamAdapter {
    fn transform(
        &self,
        source: &mut dyn Read,
        dest: &mut dyn Write,
        direction: Direction,
        key: &ContentKey,
    ) -> Result<()> {
        let mut input = Vec::new();
        source.read_to_end(&mut input)?;

        let output = match direction {
            Direction::Encrypt => self.seal(&input, key)?,
            Direction::Decrypt => self.open(&input, key)?,
        };

        dest.write_all(&output)?;
        dest.flush()?;
        Ok(())
    }

    fn plaintext_len(&self, ciphertext_len: u64) -> Option<u64> {
        if ciphertext_len == 0 {
            return Some(0);
        }
        ciphertext_len.checked_sub(ENVELOPE_OVERHEAD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KEY_SIZE;
    use std::io::Cursor;

    fn key() -> ContentKey {
        ContentKey::from_bytes([0x11; KEY_SIZE])
    }

    fn run(adapter: &AeadStreamAdapter, input: &[u8], direction: Direction) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        adapter.transform(&mut Cursor::new(input), &mut out, direction, &key())?;
        Ok(out)
    }

    #[test]
    fn test_stream_round_trip() {
        let adapter = AeadStreamAdapter::new();
        let sealed = run(&adapter, b"hello mirror", Direction::Encrypt).unwrap();

        assert!(sealed.starts_with(ENVELOPE_MAGIC));
        assert_eq!(sealed.len() as u64, 12 + ENVELOPE_OVERHEAD);
        assert_eq!(adapter.plaintext_len(sealed.len() as u64), Some(12));

        let opened = run(&adapter, &sealed, Direction::Decrypt).unwrap();
        assert_eq!(opened, b"hello mirror");
    }

    #[test]
    fn test_empty_plaintext_has_envelope() {
        let adapter = AeadStreamAdapter::new();
        let sealed = run(&adapter, b"", Direction::Encrypt).unwrap();
        assert_eq!(sealed.len() as u64, ENVELOPE_OVERHEAD);
        assert!(run(&adapter, &sealed, Direction::Decrypt).unwrap().is_empty());
    }

    #[test]
    fn test_zero_byte_source_decrypts_empty() {
        let adapter = AeadStreamAdapter::new();
        assert!(run(&adapter, b"", Direction::Decrypt).unwrap().is_empty());
        assert_eq!(adapter.plaintext_len(0), Some(0));
    }

    #[test]
    fn test_plaintext_source_is_crypto_failure() {
        let adapter = AeadStreamAdapter::new();
        let err = run(&adapter, b"just some plain text here, not sealed", Direction::Decrypt)
            .unwrap_err();
        assert!(matches!(err, Error::Crypto(_)));
        assert_eq!(err.to_errno(), libc::EIO);
    }

    #[test]
    fn test_short_envelope_len() {
        let adapter = AeadStreamAdapter::new();
        assert_eq!(adapter.plaintext_len(ENVELOPE_OVERHEAD - 1), None);
    }
}
