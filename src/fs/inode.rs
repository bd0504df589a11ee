//! Inode bookkeeping for the FUSE adapter
//!
//! The kernel addresses files by inode number; every other layer of the
//! filesystem works on virtual paths. The table hands out inode numbers per
//! virtual path and follows renames.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::Metadata;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Inode number of the mount root
pub const ROOT_INO: u64 = fuser::FUSE_ROOT_ID;

/// Bidirectional inode number <-> virtual path map
pub struct InodeTable {
    next_ino: AtomicU64,
    paths: RwLock<HashMap<u64, PathBuf>>,
    inos: RwLock<HashMap<PathBuf, u64>>,
}

impl InodeTable {
    pub fn new() -> Self {
        let table = Self {
            next_ino: AtomicU64::new(ROOT_INO + 1),
            paths: RwLock::new(HashMap::new()),
            inos: RwLock::new(HashMap::new()),
        };

        let root = PathBuf::from("/");
        table.paths.write().insert(ROOT_INO, root.clone());
        table.inos.write().insert(root, ROOT_INO);

        table
    }

    /// Virtual path of an inode
    pub fn path(&self, ino: u64) -> Option<PathBuf> {
        self.paths.read().get(&ino).cloned()
    }

    /// Virtual path of `name` inside directory `parent`
    pub fn child_path(&self, parent: u64, name: &std::ffi::OsStr) -> Option<PathBuf> {
        self.path(parent).map(|p| p.join(name))
    }

    /// Inode for a path, allocating one on first sight
    pub fn ino_for(&self, path: &Path) -> u64 {
        if let Some(&ino) = self.inos.read().get(path) {
            return ino;
        }

        let mut inos = self.inos.write();
        // Another caller may have registered it between the two locks
        if let Some(&ino) = inos.get(path) {
            return ino;
        }

        let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
        inos.insert(path.to_path_buf(), ino);
        self.paths.write().insert(ino, path.to_path_buf());
        ino
    }

    /// Forget a path (after unlink/rmdir)
    pub fn remove(&self, path: &Path) {
        if let Some(ino) = self.inos.write().remove(path) {
            self.paths.write().remove(&ino);
        }
    }

    /// Move `from` and everything below it to `to`, keeping inode numbers
    pub fn rename(&self, from: &Path, to: &Path) {
        let mut inos = self.inos.write();
        let mut paths = self.paths.write();

        // The destination is replaced by the rename
        if let Some(old) = inos.remove(to) {
            paths.remove(&old);
        }

        let moved: Vec<(PathBuf, u64)> = inos
            .iter()
            .filter(|(path, _)| path.starts_with(from))
            .map(|(path, &ino)| (path.clone(), ino))
            .collect();

        for (old_path, ino) in moved {
            let new_path = match old_path.strip_prefix(from) {
                Ok(rest) if rest.as_os_str().is_empty() => to.to_path_buf(),
                Ok(rest) => to.join(rest),
                Err(_) => continue,
            };
            inos.remove(&old_path);
            inos.insert(new_path.clone(), ino);
            paths.insert(ino, new_path);
        }
    }

    pub fn len(&self) -> usize {
        self.paths.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.read().is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a native file type to the FUSE one
pub fn fuser_file_type(ft: std::fs::FileType) -> fuser::FileType {
    if ft.is_dir() {
        fuser::FileType::Directory
    } else if ft.is_symlink() {
        fuser::FileType::Symlink
    } else if ft.is_fifo() {
        fuser::FileType::NamedPipe
    } else if ft.is_socket() {
        fuser::FileType::Socket
    } else if ft.is_block_device() {
        fuser::FileType::BlockDevice
    } else if ft.is_char_device() {
        fuser::FileType::CharDevice
    } else {
        fuser::FileType::RegularFile
    }
}

fn timestamp(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + Duration::from_nanos(nsecs as u64)
    }
}

/// Build FUSE attributes from real metadata, reporting `size` as the length
pub fn file_attr(ino: u64, meta: &Metadata, size: u64) -> fuser::FileAttr {
    fuser::FileAttr {
        ino,
        size,
        blocks: meta.blocks(),
        atime: timestamp(meta.atime(), meta.atime_nsec()),
        mtime: timestamp(meta.mtime(), meta.mtime_nsec()),
        ctime: timestamp(meta.ctime(), meta.ctime_nsec()),
        crtime: meta.created().unwrap_or(UNIX_EPOCH),
        kind: fuser_file_type(meta.file_type()),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        flags: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;
    use tempfile::tempdir;

    #[test]
    fn test_root_registered() {
        let table = InodeTable::new();
        assert_eq!(table.path(ROOT_INO), Some(PathBuf::from("/")));
        assert_eq!(table.ino_for(Path::new("/")), ROOT_INO);
        assert_eq!(
            table.child_path(ROOT_INO, OsStr::new("a")),
            Some(PathBuf::from("/a"))
        );
    }

    #[test]
    fn test_stable_allocation() {
        let table = InodeTable::new();
        let a = table.ino_for(Path::new("/a"));
        let b = table.ino_for(Path::new("/b"));
        assert_ne!(a, b);
        assert_eq!(table.ino_for(Path::new("/a")), a);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_remove() {
        let table = InodeTable::new();
        let a = table.ino_for(Path::new("/a"));
        table.remove(Path::new("/a"));
        assert_eq!(table.path(a), None);
        assert_ne!(table.ino_for(Path::new("/a")), a);
    }

    #[test]
    fn test_rename_moves_subtree() {
        let table = InodeTable::new();
        let dir = table.ino_for(Path::new("/d"));
        let child = table.ino_for(Path::new("/d/f"));
        let sibling = table.ino_for(Path::new("/dd"));
        let target = table.ino_for(Path::new("/e"));

        table.rename(Path::new("/d"), Path::new("/e"));

        assert_eq!(table.path(dir), Some(PathBuf::from("/e")));
        assert_eq!(table.path(child), Some(PathBuf::from("/e/f")));
        assert_eq!(table.path(sibling), Some(PathBuf::from("/dd")));
        assert_eq!(table.path(target), None);
        assert_eq!(table.ino_for(Path::new("/e/f")), child);
    }

    #[test]
    fn test_file_attr_from_metadata() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"12345678").unwrap();
        let meta = std::fs::metadata(&file).unwrap();

        let attr = file_attr(42, &meta, 3);
        assert_eq!(attr.ino, 42);
        assert_eq!(attr.size, 3);
        assert_eq!(attr.kind, fuser::FileType::RegularFile);
        assert_eq!(attr.uid, meta.uid());
        assert_eq!(attr.mtime, meta.modified().unwrap());

        let dir_attr = file_attr(7, &std::fs::metadata(dir.path()).unwrap(), 0);
        assert_eq!(dir_attr.kind, fuser::FileType::Directory);
    }
}
