//! Content transform pipeline
//!
//! Encrypted files are handled whole: every read decrypts the full file into
//! memory and projects the requested range; every write decrypts, overlays
//! the new bytes and re-encrypts the full buffer over the real file. Files
//! the policy reports as plaintext get direct positional I/O.
//!
//! Whole-file buffering is confined to [`WholeFilePipeline`]; the dispatch
//! layer only sees [`ContentPipeline`].

use crate::crypto::{AeadStreamAdapter, CryptoAdapter, Direction};
use crate::error::{Error, Result};
use crate::session::MountSession;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::fs::{File, Metadata, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Content operations on virtual paths
pub trait ContentPipeline: Send + Sync {
    /// Read up to `size` plaintext bytes at `offset`
    fn read(&self, session: &MountSession, path: &Path, offset: u64, size: u32) -> Result<Vec<u8>>;

    /// Write `data` at `offset`, returning the number of bytes applied
    fn write(&self, session: &MountSession, path: &Path, data: &[u8], offset: u64) -> Result<usize>;

    /// Create (or truncate) a regular file holding the empty plaintext
    fn create(&self, session: &MountSession, path: &Path, mode: u32) -> Result<()>;

    /// Set the plaintext length, zero-filling on growth
    fn truncate(&self, session: &MountSession, path: &Path, size: u64) -> Result<()>;

    /// Plaintext size of a real file as reported to the kernel
    fn logical_size(&self, session: &MountSession, real_path: &Path, meta: &Metadata)
        -> Result<u64>;
}

/// One reader/writer lock per real path.
///
/// Entries exist only while some operation holds or waits on them.
#[derive(Default)]
pub struct PathLocks {
    locks: DashMap<PathBuf, Arc<RwLock<()>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, path: &Path) -> Arc<RwLock<()>> {
        self.locks.entry(path.to_path_buf()).or_default().clone()
    }

    fn evict(&self, path: &Path) {
        // Holding the shard lock, a count of 1 means only the map refers to it.
        self.locks.remove_if(path, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Run `f` while holding the shared lock for `path`
    pub fn shared<R>(&self, path: &Path, f: impl FnOnce() -> R) -> R {
        let lock = self.handle(path);
        let result = {
            let _guard = lock.read();
            f()
        };
        drop(lock);
        self.evict(path);
        result
    }

    /// Run `f` while holding the exclusive lock for `path`
    pub fn exclusive<R>(&self, path: &Path, f: impl FnOnce() -> R) -> R {
        let lock = self.handle(path);
        let result = {
            let _guard = lock.write();
            f()
        };
        drop(lock);
        self.evict(path);
        result
    }

    /// Number of paths currently locked or awaited
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Pipeline buffering the whole plaintext of a file per call
pub struct WholeFilePipeline<A: CryptoAdapter = AeadStreamAdapter> {
    adapter: A,
    locks: PathLocks,
}

impl WholeFilePipeline<AeadStreamAdapter> {
    /// Pipeline over the AES-256-GCM envelope
    pub fn aead() -> Self {
        Self::new(AeadStreamAdapter::new())
    }
}

impl<A: CryptoAdapter> WholeFilePipeline<A> {
    pub fn new(adapter: A) -> Self {
        Self {
            adapter,
            locks: PathLocks::new(),
        }
    }

    pub fn locks(&self) -> &PathLocks {
        &self.locks
    }

    fn decrypt_file(&self, session: &MountSession, real: &Path) -> Result<Vec<u8>> {
        let mut source = File::open(real)?;
        let mut plaintext = Vec::new();
        self.adapter
            .transform(&mut source, &mut plaintext, Direction::Decrypt, session.key())?;
        Ok(plaintext)
    }

    /// Truncate the real file and write the sealed `plaintext` from offset 0
    fn encrypt_into(&self, session: &MountSession, real: &Path, plaintext: &[u8]) -> Result<()> {
        let mut dest = OpenOptions::new().write(true).truncate(true).open(real)?;
        let mut source: &[u8] = plaintext;
        self.adapter
            .transform(&mut source, &mut dest, Direction::Encrypt, session.key())
    }

    fn read_plain(real: &Path, offset: u64, size: u32) -> Result<Vec<u8>> {
        let file = File::open(real)?;
        let mut buffer = vec![0u8; size as usize];
        let mut filled = 0;

        while filled < buffer.len() {
            match file.read_at(&mut buffer[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        buffer.truncate(filled);
        Ok(buffer)
    }

    fn write_plain(real: &Path, data: &[u8], offset: u64) -> Result<usize> {
        let file = OpenOptions::new().write(true).open(real)?;
        file.write_all_at(data, offset)?;
        Ok(data.len())
    }
}

/// Byte range `[offset, offset + size)` of `buffer`, clipped to its length
fn project(buffer: &[u8], offset: u64, size: u32) -> &[u8] {
    let len = buffer.len() as u64;
    let start = offset.min(len) as usize;
    let end = offset.saturating_add(size as u64).min(len) as usize;
    &buffer[start..end]
}

/// Copy `data` into `buffer` at `offset`, zero-filling any gap past the end
fn overlay(buffer: &mut Vec<u8>, data: &[u8], offset: u64) -> Result<()> {
    let too_large = || Error::Io(std::io::Error::from_raw_os_error(libc::EFBIG));

    let start = usize::try_from(offset).map_err(|_| too_large())?;
    let end = start.checked_add(data.len()).ok_or_else(too_large)?;

    if end > buffer.len() {
        buffer.resize(end, 0);
    }
    buffer[start..end].copy_from_slice(data);
    Ok(())
}

impl<A: CryptoAdapter> ContentPipeline for WholeFilePipeline<A> {
    fn read(&self, session: &MountSession, path: &Path, offset: u64, size: u32) -> Result<Vec<u8>> {
        let real = session.resolve(path)?;
        debug!("read({:?}, offset={}, size={})", path, offset, size);

        self.locks.shared(&real, || {
            if !session.policy().is_encrypted(&real)? {
                return Self::read_plain(&real, offset, size);
            }

            let plaintext = self.decrypt_file(session, &real)?;
            Ok(project(&plaintext, offset, size).to_vec())
        })
    }

    fn write(&self, session: &MountSession, path: &Path, data: &[u8], offset: u64) -> Result<usize> {
        let real = session.resolve(path)?;
        debug!("write({:?}, offset={}, len={})", path, offset, data.len());

        self.locks.exclusive(&real, || {
            if !session.policy().is_encrypted(&real)? {
                return Self::write_plain(&real, data, offset);
            }

            let mut plaintext = self.decrypt_file(session, &real)?;
            overlay(&mut plaintext, data, offset)?;
            self.encrypt_into(session, &real, &plaintext)?;
            Ok(data.len())
        })
    }

    fn create(&self, session: &MountSession, path: &Path, mode: u32) -> Result<()> {
        let real = session.resolve(path)?;
        debug!("create({:?}, mode={:o})", path, mode);

        self.locks.exclusive(&real, || {
            let mut dest = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(mode)
                .open(&real)?;

            let mut empty: &[u8] = &[];
            self.adapter
                .transform(&mut empty, &mut dest, Direction::Encrypt, session.key())?;
            drop(dest);

            if let Err(e) = session.policy().mark_encrypted(&real) {
                warn!("Failed to tag {:?} as encrypted: {}", real, e);
                // Without the tag the envelope would be served as plaintext bytes.
                let rollback = OpenOptions::new()
                    .write(true)
                    .open(&real)
                    .and_then(|file| file.set_len(0));
                if let Err(rollback_err) = rollback {
                    warn!(
                        "Failed to empty untagged {:?}, its envelope will read as plaintext: {}",
                        real, rollback_err
                    );
                }
                return Err(e);
            }

            Ok(())
        })
    }

    fn truncate(&self, session: &MountSession, path: &Path, size: u64) -> Result<()> {
        let real = session.resolve(path)?;
        debug!("truncate({:?}, size={})", path, size);

        self.locks.exclusive(&real, || {
            if !session.policy().is_encrypted(&real)? {
                let file = OpenOptions::new().write(true).open(&real)?;
                file.set_len(size)?;
                return Ok(());
            }

            let size = usize::try_from(size)
                .map_err(|_| Error::Io(std::io::Error::from_raw_os_error(libc::EFBIG)))?;

            let mut plaintext = self.decrypt_file(session, &real)?;
            plaintext.resize(size, 0);
            self.encrypt_into(session, &real, &plaintext)
        })
    }

    fn logical_size(
        &self,
        session: &MountSession,
        real_path: &Path,
        meta: &Metadata,
    ) -> Result<u64> {
        if !meta.is_file() || !session.policy().is_encrypted(real_path)? {
            return Ok(meta.len());
        }

        if let Some(len) = self.adapter.plaintext_len(meta.len()) {
            return Ok(len);
        }

        // Unreadable envelope: still report something so the entry can be removed
        match self.locks.shared(real_path, || self.decrypt_file(session, real_path)) {
            Ok(plaintext) => Ok(plaintext.len() as u64),
            Err(e) => {
                let shown = crate::path::to_virtual(session.mirror_root(), real_path)
                    .unwrap_or_else(|| real_path.to_path_buf());
                warn!("Cannot size {:?}, reporting ciphertext length: {}", shown, e);
                Ok(meta.len())
            }
        }
    }
}
