//! Encryption state resolution
//!
//! Decides whether a real file's content is ciphertext. Two strategies are
//! selected at mount time: every regular file (uniform) or only files that
//! carry a marker extended attribute (tagged).

use crate::config::EncryptionMode;
use crate::error::{Error, Result};
use std::fmt::Debug;
use std::io;
use std::path::Path;
use std::sync::Once;
use tracing::{debug, warn};

/// Value written into the tag attribute
pub const TAG_VALUE: &[u8] = b"true";

/// Strategy deciding which real files hold ciphertext
pub trait EncryptionPolicy: Send + Sync + Debug {
    /// Whether the content at `real_path` is ciphertext.
    ///
    /// An error means the state could not be determined; callers must not
    /// fall back to plaintext I/O on it.
    fn is_encrypted(&self, real_path: &Path) -> Result<bool>;

    /// Record that a freshly sealed file is ciphertext
    fn mark_encrypted(&self, real_path: &Path) -> Result<()>;

    fn mode(&self) -> EncryptionMode;
}

/// Build the strategy for a mode
pub fn policy_for(mode: EncryptionMode, tag_attribute: &str) -> Box<dyn EncryptionPolicy> {
    match mode {
        EncryptionMode::Uniform => Box::new(UniformPolicy),
        EncryptionMode::Tagged => Box::new(TaggedPolicy::new(tag_attribute)),
    }
}

/// Every regular file is ciphertext
#[derive(Debug, Default, Clone, Copy)]
pub struct UniformPolicy;

impl EncryptionPolicy for UniformPolicy {
    fn is_encrypted(&self, real_path: &Path) -> Result<bool> {
        // Unreadable or missing paths count as encrypted so the open that
        // follows reports the real error.
        Ok(std::fs::symlink_metadata(real_path)
            .map(|meta| meta.file_type().is_file())
            .unwrap_or(true))
    }

    fn mark_encrypted(&self, _real_path: &Path) -> Result<()> {
        Ok(())
    }

    fn mode(&self) -> EncryptionMode {
        EncryptionMode::Uniform
    }
}

/// Files are ciphertext iff the tag attribute is present and non-empty
#[derive(Debug, Clone)]
pub struct TaggedPolicy {
    attribute: String,
}

impl TaggedPolicy {
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
        }
    }

    pub fn attribute(&self) -> &str {
        &self.attribute
    }
}

impl EncryptionPolicy for TaggedPolicy {
    fn is_encrypted(&self, real_path: &Path) -> Result<bool> {
        tag_state(xattr::get(real_path, &self.attribute), real_path)
    }

    fn mark_encrypted(&self, real_path: &Path) -> Result<()> {
        xattr::set(real_path, &self.attribute, TAG_VALUE)
            .map_err(|e| classify_xattr_error(e, real_path))
    }

    fn mode(&self) -> EncryptionMode {
        EncryptionMode::Tagged
    }
}

static UNSUPPORTED_WARNING: Once = Once::new();

/// Interpret the result of reading the tag attribute.
///
/// Only two failures have a defined answer: a filesystem without xattr
/// support and a missing file both read as plaintext (the latter so the
/// following open reports ENOENT). Anything else is propagated.
pub fn tag_state(lookup: io::Result<Option<Vec<u8>>>, real_path: &Path) -> Result<bool> {
    match lookup {
        Ok(Some(value)) => Ok(!value.is_empty()),
        Ok(None) => Ok(false),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => match classify_xattr_error(e, real_path) {
            Error::AttributeUnsupported(msg) => {
                UNSUPPORTED_WARNING.call_once(|| {
                    warn!("No extended attribute support, treating untagged files as plaintext: {}", msg);
                });
                debug!("Treating {:?} as plaintext: no xattr support", real_path);
                Ok(false)
            }
            other => Err(other),
        },
    }
}

/// Separate "no xattr support here" from ordinary I/O failures
pub fn classify_xattr_error(e: std::io::Error, path: &Path) -> Error {
    match e.raw_os_error() {
        Some(code) if code == libc::ENOTSUP || code == libc::EOPNOTSUPP => {
            Error::AttributeUnsupported(path.display().to_string())
        }
        _ => Error::Io(e),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::tempdir;

    /// Probe whether the temp filesystem accepts user xattrs
    pub(crate) fn xattrs_supported(dir: &Path) -> bool {
        let probe = dir.join(".xattr-probe");
        if std::fs::write(&probe, b"").is_err() {
            return false;
        }
        let supported = xattr::set(&probe, "user.probe", b"1").is_ok();
        let _ = std::fs::remove_file(&probe);
        supported
    }

    #[test]
    fn test_uniform_classification() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();

        let policy = UniformPolicy;
        assert!(policy.is_encrypted(&file).unwrap());
        assert!(!policy.is_encrypted(dir.path()).unwrap());
        assert!(policy.is_encrypted(&dir.path().join("missing")).unwrap());
        assert!(policy.mark_encrypted(&file).is_ok());
        assert_eq!(policy.mode(), EncryptionMode::Uniform);
    }

    #[test]
    fn test_tagged_classification() {
        let dir = tempdir().unwrap();
        if !xattrs_supported(dir.path()) {
            eprintln!("skipping: no user xattr support on temp dir");
            return;
        }

        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();

        let policy = TaggedPolicy::new("user.enc");
        assert!(!policy.is_encrypted(&file).unwrap());

        policy.mark_encrypted(&file).unwrap();
        assert!(policy.is_encrypted(&file).unwrap());
        assert_eq!(xattr::get(&file, "user.enc").unwrap().unwrap(), TAG_VALUE);
    }

    #[test]
    fn test_tagged_empty_value_is_plaintext() {
        let dir = tempdir().unwrap();
        if !xattrs_supported(dir.path()) {
            return;
        }

        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        xattr::set(&file, "user.enc", b"").unwrap();

        assert!(!TaggedPolicy::new("user.enc").is_encrypted(&file).unwrap());
    }

    #[test]
    fn test_tagged_missing_file_is_plaintext() {
        let dir = tempdir().unwrap();
        let policy = TaggedPolicy::new("user.enc");
        assert!(!policy.is_encrypted(&dir.path().join("nope")).unwrap());
    }

    #[test]
    fn test_policy_for_mode() {
        assert_eq!(policy_for(EncryptionMode::Uniform, "user.enc").mode(), EncryptionMode::Uniform);
        assert_eq!(policy_for(EncryptionMode::Tagged, "user.enc").mode(), EncryptionMode::Tagged);
    }

    #[test]
    fn test_classify_unsupported() {
        let err = classify_xattr_error(
            std::io::Error::from_raw_os_error(libc::ENOTSUP),
            Path::new("/x"),
        );
        assert!(matches!(err, Error::AttributeUnsupported(_)));

        let err = classify_xattr_error(
            std::io::Error::from_raw_os_error(libc::EACCES),
            Path::new("/x"),
        );
        assert_eq!(err.to_errno(), libc::EACCES);
    }

    #[test]
    fn test_tag_state_values() {
        let path = Path::new("/m/f");
        assert!(tag_state(Ok(Some(TAG_VALUE.to_vec())), path).unwrap());
        assert!(!tag_state(Ok(Some(Vec::new())), path).unwrap());
        assert!(!tag_state(Ok(None), path).unwrap());
    }

    #[test]
    fn test_tag_state_unsupported_degrades_to_plaintext() {
        let path = Path::new("/m/f");
        for code in [libc::ENOTSUP, libc::EOPNOTSUPP] {
            let lookup = Err(std::io::Error::from_raw_os_error(code));
            assert!(!tag_state(lookup, path).unwrap());
        }

        let missing = Err(std::io::Error::from_raw_os_error(libc::ENOENT));
        assert!(!tag_state(missing, path).unwrap());
    }

    #[test]
    fn test_tag_state_other_errors_propagate() {
        let path = Path::new("/m/f");
        for code in [libc::EACCES, libc::EIO, libc::ENAMETOOLONG] {
            let lookup = Err(std::io::Error::from_raw_os_error(code));
            let err = tag_state(lookup, path).unwrap_err();
            assert_eq!(err.to_errno(), code);
        }
    }
}
