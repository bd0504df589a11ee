//! Error types for cryptmirror
//!
//! Every failure is eventually reported to the kernel as an errno, so each
//! variant knows its OS error code (see [`Error::to_errno`]).

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the filesystem layer
#[derive(Error, Debug)]
pub enum Error {
    /// A native filesystem call failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Resolved real path exceeds PATH_MAX
    #[error("Path too long: {0}")]
    PathTooLong(String),

    /// Virtual path would resolve outside the mirror root
    #[error("Path escapes mirror root: {0}")]
    PathEscape(String),

    /// The cipher rejected the stream (bad envelope or authentication failure)
    #[error("Crypto failure: {0}")]
    Crypto(String),

    /// The backing filesystem has no extended attribute support
    #[error("Extended attributes not supported: {0}")]
    AttributeUnsupported(String),

    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Translate into the errno handed back to the kernel
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Error::Io(e) => io_errno(e),
            Error::PathTooLong(_) => libc::ENAMETOOLONG,
            Error::PathEscape(_) => libc::EACCES,
            Error::Crypto(_) => libc::EIO,
            Error::AttributeUnsupported(_) => libc::ENOTSUP,
            _ => libc::EIO,
        }
    }

    /// Check whether this is a "no such file or directory" error
    pub fn is_not_found(&self) -> bool {
        self.to_errno() == libc::ENOENT
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Error::Io(std::io::Error::from(errno))
    }
}

fn io_errno(e: &std::io::Error) -> libc::c_int {
    if let Some(code) = e.raw_os_error() {
        return code;
    }
    match e.kind() {
        std::io::ErrorKind::NotFound => libc::ENOENT,
        std::io::ErrorKind::PermissionDenied => libc::EACCES,
        std::io::ErrorKind::AlreadyExists => libc::EEXIST,
        std::io::ErrorKind::InvalidInput => libc::EINVAL,
        std::io::ErrorKind::UnexpectedEof => libc::EIO,
        _ => libc::EIO,
    }
}
