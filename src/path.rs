//! Virtual-to-real path resolution
//!
//! A virtual path is what the kernel sees below the mount point; the real
//! path is the same file under the mirror root. Resolution is lexical: `..`
//! is folded before any filesystem call and may never climb above the root.

use crate::error::{Error, Result};
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

/// Longest real path accepted, including the trailing NUL
pub const MAX_PATH_LEN: usize = libc::PATH_MAX as usize;

/// Map `virtual_path` to a strict descendant of `root` (or `root` itself)
pub fn resolve(root: &Path, virtual_path: &Path) -> Result<PathBuf> {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();

    for component in virtual_path.components() {
        match component {
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(Error::PathEscape(virtual_path.display().to_string()));
                }
            }
            Component::Normal(name) => parts.push(name),
        }
    }

    let mut real = root.to_path_buf();
    for part in parts {
        real.push(part);
    }

    if real.as_os_str().as_bytes().len() + 1 > MAX_PATH_LEN {
        return Err(Error::PathTooLong(format!(
            "{} bytes under {}",
            real.as_os_str().len(),
            root.display()
        )));
    }

    Ok(real)
}

/// Convert a real path back to its virtual form (`/` rooted)
pub fn to_virtual(root: &Path, real_path: &Path) -> Option<PathBuf> {
    real_path
        .strip_prefix(root)
        .ok()
        .map(|p| PathBuf::from("/").join(p))
}
