//! Mount session: immutable state established once at mount time

use crate::config::MirrorConfig;
use crate::crypto::ContentKey;
use crate::error::{Error, Result};
use crate::fs::{policy_for, EncryptionPolicy};
use crate::path;
use std::path::{Path, PathBuf};

/// Mirror root, content key and encryption policy for one mount.
///
/// Never mutated after construction, so concurrent operations share it by
/// reference without synchronization.
#[derive(Debug)]
pub struct MountSession {
    mirror_root: PathBuf,
    key: ContentKey,
    policy: Box<dyn EncryptionPolicy>,
}

impl MountSession {
    /// Create a session; the mirror root is canonicalized and must be a directory
    pub fn new(
        mirror_root: impl AsRef<Path>,
        key: ContentKey,
        policy: Box<dyn EncryptionPolicy>,
    ) -> Result<Self> {
        let root = std::fs::canonicalize(mirror_root.as_ref()).map_err(|e| {
            Error::Config(format!(
                "Cannot resolve mirror directory {:?}: {}",
                mirror_root.as_ref(),
                e
            ))
        })?;

        if !root.is_dir() {
            return Err(Error::InvalidConfig(format!(
                "Mirror root {:?} is not a directory",
                root
            )));
        }

        Ok(Self {
            mirror_root: root,
            key,
            policy,
        })
    }

    /// Create a session from the mirror section of the config
    pub fn from_config(config: &MirrorConfig, key: ContentKey) -> Result<Self> {
        Self::new(
            &config.root,
            key,
            policy_for(config.mode, &config.tag_attribute),
        )
    }

    pub fn mirror_root(&self) -> &Path {
        &self.mirror_root
    }

    pub fn key(&self) -> &ContentKey {
        &self.key
    }

    pub fn policy(&self) -> &dyn EncryptionPolicy {
        self.policy.as_ref()
    }

    /// Resolve a virtual path under this session's mirror root
    pub fn resolve(&self, virtual_path: &Path) -> Result<PathBuf> {
        path::resolve(&self.mirror_root, virtual_path)
    }
}
