//! cryptmirror - transparent encrypting mirror filesystem
//!
//! This library provides a FUSE filesystem that mirrors a directory tree,
//! storing regular-file contents sealed with AES-256-GCM and exposing them
//! as plaintext at the mount point.

pub mod config;
pub mod crypto;
pub mod error;
pub mod fs;
pub mod path;
pub mod session;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, EncryptionMode};
    pub use crate::error::{Error, Result};
    pub use crate::fs::{ContentPipeline, EncFs, EncryptionPolicy, WholeFilePipeline};
    pub use crate::session::MountSession;
}
