//! FUSE filesystem implementation
//!
//! Translates inode-addressed kernel requests into path-addressed
//! pass-through and pipeline operations.

use fuser::{
    FileAttr, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use libc::ENOENT;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info};

use super::{
    inode::{file_attr, fuser_file_type, InodeTable},
    passthrough::{self, SetTime},
    pipeline::ContentPipeline,
};
use crate::error::Error;
use crate::session::MountSession;

/// Encrypting mirror filesystem
pub struct EncFs {
    session: MountSession,
    pipeline: Box<dyn ContentPipeline>,
    inodes: InodeTable,
    ttl: Duration,
}

fn set_time(time: Option<TimeOrNow>) -> Option<SetTime> {
    time.map(|t| match t {
        TimeOrNow::Now => SetTime::Now,
        TimeOrNow::SpecificTime(at) => SetTime::At(at),
    })
}

/// Log a failed callback; ENOENT is routine and stays at debug level
fn log_failure(op: &str, path: &Path, e: &Error) {
    if e.is_not_found() {
        debug!("{}({:?}): {}", op, path, e);
    } else {
        error!("{}({:?}) failed: {}", op, path, e);
    }
}

impl EncFs {
    pub fn new(session: MountSession, pipeline: Box<dyn ContentPipeline>, ttl: Duration) -> Self {
        Self {
            session,
            pipeline,
            inodes: InodeTable::new(),
            ttl,
        }
    }

    pub fn session(&self) -> &MountSession {
        &self.session
    }

    /// Attributes for a virtual path, with plaintext size for sealed files
    fn attr_for(&self, path: &Path) -> crate::error::Result<FileAttr> {
        let meta = passthrough::getattr(&self.session, path)?;
        let real = self.session.resolve(path)?;
        let size = self.pipeline.logical_size(&self.session, &real, &meta)?;
        Ok(file_attr(self.inodes.ino_for(path), &meta, size))
    }

    fn reply_entry(&self, op: &str, path: &Path, reply: ReplyEntry) {
        match self.attr_for(path) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => {
                log_failure(op, path, &e);
                reply.error(e.to_errno());
            }
        }
    }

    fn reply_empty(&self, op: &str, path: &Path, result: crate::error::Result<()>, reply: ReplyEmpty) {
        match result {
            Ok(()) => reply.ok(),
            Err(e) => {
                log_failure(op, path, &e);
                reply.error(e.to_errno());
            }
        }
    }
}

macro_rules! path_or_enoent {
    ($opt:expr, $reply:expr) => {
        match $opt {
            Some(path) => path,
            None => {
                $reply.error(ENOENT);
                return;
            }
        }
    };
}

/// Reply to a getxattr/listxattr size probe or data request
fn reply_xattr(data: &[u8], size: u32, reply: ReplyXattr) {
    if size == 0 {
        reply.size(data.len() as u32);
    } else if data.len() <= size as usize {
        reply.data(data);
    } else {
        reply.error(libc::ERANGE);
    }
}

impl Filesystem for EncFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        info!(
            "Mounted mirror {:?} ({} mode)",
            self.session.mirror_root(),
            self.session.policy().mode()
        );
        Ok(())
    }

    fn destroy(&mut self) {
        info!("Unmounted mirror {:?}", self.session.mirror_root());
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);
        let path = path_or_enoent!(self.inodes.child_path(parent, name), reply);
        self.reply_entry("lookup", &path, reply);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);
        let path = path_or_enoent!(self.inodes.path(ino), reply);

        match self.attr_for(&path) {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(e) => {
                log_failure("getattr", &path, &e);
                reply.error(e.to_errno());
            }
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!(
            "setattr(ino={}, mode={:?}, uid={:?}, gid={:?}, size={:?})",
            ino, mode, uid, gid, size
        );
        let path = path_or_enoent!(self.inodes.path(ino), reply);

        let result = (|| {
            if let Some(mode) = mode {
                passthrough::chmod(&self.session, &path, mode)?;
            }
            if uid.is_some() || gid.is_some() {
                passthrough::chown(&self.session, &path, uid, gid)?;
            }
            if let Some(size) = size {
                passthrough::truncate(&self.session, self.pipeline.as_ref(), &path, size)?;
            }
            if atime.is_some() || mtime.is_some() {
                passthrough::utimens(&self.session, &path, set_time(atime), set_time(mtime))?;
            }
            self.attr_for(&path)
        })();

        match result {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(e) => {
                log_failure("setattr", &path, &e);
                reply.error(e.to_errno());
            }
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        debug!("readlink(ino={})", ino);
        let path = path_or_enoent!(self.inodes.path(ino), reply);

        match passthrough::readlink(&self.session, &path) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => {
                log_failure("readlink", &path, &e);
                reply.error(e.to_errno());
            }
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        debug!("mknod(parent={}, name={:?}, mode={:o})", parent, name, mode);
        let path = path_or_enoent!(self.inodes.child_path(parent, name), reply);

        match passthrough::mknod(&self.session, self.pipeline.as_ref(), &path, mode, rdev) {
            Ok(()) => self.reply_entry("mknod", &path, reply),
            Err(e) => {
                log_failure("mknod", &path, &e);
                reply.error(e.to_errno());
            }
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent={}, name={:?}, mode={:o})", parent, name, mode);
        let path = path_or_enoent!(self.inodes.child_path(parent, name), reply);

        match passthrough::mkdir(&self.session, &path, mode) {
            Ok(()) => self.reply_entry("mkdir", &path, reply),
            Err(e) => {
                log_failure("mkdir", &path, &e);
                reply.error(e.to_errno());
            }
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent={}, name={:?})", parent, name);
        let path = path_or_enoent!(self.inodes.child_path(parent, name), reply);

        let result = passthrough::unlink(&self.session, &path);
        if result.is_ok() {
            self.inodes.remove(&path);
        }
        self.reply_empty("unlink", &path, result, reply);
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={}, name={:?})", parent, name);
        let path = path_or_enoent!(self.inodes.child_path(parent, name), reply);

        let result = passthrough::rmdir(&self.session, &path);
        if result.is_ok() {
            self.inodes.remove(&path);
        }
        self.reply_empty("rmdir", &path, result, reply);
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        debug!("symlink(parent={}, name={:?}, target={:?})", parent, link_name, target);
        let path = path_or_enoent!(self.inodes.child_path(parent, link_name), reply);

        match passthrough::symlink(&self.session, target, &path) {
            Ok(()) => self.reply_entry("symlink", &path, reply),
            Err(e) => {
                log_failure("symlink", &path, &e);
                reply.error(e.to_errno());
            }
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?})",
            parent, name, newparent, newname
        );
        let from = path_or_enoent!(self.inodes.child_path(parent, name), reply);
        let to = path_or_enoent!(self.inodes.child_path(newparent, newname), reply);

        let result = passthrough::rename(&self.session, &from, &to);
        if result.is_ok() {
            self.inodes.rename(&from, &to);
        }
        self.reply_empty("rename", &from, result, reply);
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        debug!("link(ino={}, newparent={}, newname={:?})", ino, newparent, newname);
        let from = path_or_enoent!(self.inodes.path(ino), reply);
        let to = path_or_enoent!(self.inodes.child_path(newparent, newname), reply);

        match passthrough::link(&self.session, &from, &to) {
            Ok(()) => self.reply_entry("link", &to, reply),
            Err(e) => {
                log_failure("link", &from, &e);
                reply.error(e.to_errno());
            }
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={:#x})", ino, flags);
        let path = path_or_enoent!(self.inodes.path(ino), reply);

        // Stateless: no handle is kept between open and release
        match passthrough::open(&self.session, &path, flags) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => {
                log_failure("open", &path, &e);
                reply.error(e.to_errno());
            }
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);
        let path = path_or_enoent!(self.inodes.path(ino), reply);

        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }

        match self.pipeline.read(&self.session, &path, offset as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => {
                log_failure("read", &path, &e);
                reply.error(e.to_errno());
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write(ino={}, fh={}, offset={}, len={})", ino, fh, offset, data.len());
        let path = path_or_enoent!(self.inodes.path(ino), reply);

        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }

        match self.pipeline.write(&self.session, &path, data, offset as u64) {
            Ok(written) => reply.written(written as u32),
            Err(e) => {
                log_failure("write", &path, &e);
                reply.error(e.to_errno());
            }
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!("flush(ino={}, fh={})", ino, fh);
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release(ino={}, fh={})", ino, fh);
        let path = self.inodes.path(ino).unwrap_or_else(|| PathBuf::from("/"));
        let result = passthrough::release(&self.session, &path);
        self.reply_empty("release", &path, result, reply);
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        debug!("fsync(ino={}, fh={}, datasync={})", ino, fh, datasync);
        let path = path_or_enoent!(self.inodes.path(ino), reply);
        let result = passthrough::fsync(&self.session, &path, datasync);
        self.reply_empty("fsync", &path, result, reply);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, offset={})", ino, offset);
        let path = path_or_enoent!(self.inodes.path(ino), reply);

        let listing = match passthrough::readdir(&self.session, &path) {
            Ok(listing) => listing,
            Err(e) => {
                log_failure("readdir", &path, &e);
                reply.error(e.to_errno());
                return;
            }
        };

        let parent_ino = path
            .parent()
            .map(|p| self.inodes.ino_for(p))
            .unwrap_or(ino);

        let mut entries = vec![
            (ino, fuser::FileType::Directory, ".".into()),
            (parent_ino, fuser::FileType::Directory, "..".into()),
        ];
        for entry in listing {
            let child_ino = self.inodes.ino_for(&path.join(&entry.name));
            entries.push((child_ino, fuser_file_type(entry.file_type), entry.name));
        }

        for (i, (child_ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(*child_ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }

        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        debug!("statfs(ino={})", ino);
        let path = self.inodes.path(ino).unwrap_or_else(|| PathBuf::from("/"));

        match passthrough::statfs(&self.session, &path) {
            Ok(st) => reply.statfs(
                st.blocks,
                st.blocks_free,
                st.blocks_available,
                st.files,
                st.files_free,
                st.block_size,
                st.name_max,
                st.fragment_size,
            ),
            Err(e) => {
                log_failure("statfs", &path, &e);
                reply.error(e.to_errno());
            }
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        debug!("setxattr(ino={}, name={:?})", ino, name);
        let path = path_or_enoent!(self.inodes.path(ino), reply);
        let result = passthrough::setxattr(&self.session, &path, name, value, flags);
        self.reply_empty("setxattr", &path, result, reply);
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        debug!("getxattr(ino={}, name={:?}, size={})", ino, name, size);
        let path = path_or_enoent!(self.inodes.path(ino), reply);

        match passthrough::getxattr(&self.session, &path, name) {
            Ok(value) => reply_xattr(&value, size, reply),
            Err(e) => {
                // ENODATA is the normal "no such attribute" answer
                debug!("getxattr({:?}, {:?}): {}", path, name, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        debug!("listxattr(ino={}, size={})", ino, size);
        let path = path_or_enoent!(self.inodes.path(ino), reply);

        match passthrough::listxattr(&self.session, &path) {
            Ok(list) => reply_xattr(&list, size, reply),
            Err(e) => {
                log_failure("listxattr", &path, &e);
                reply.error(e.to_errno());
            }
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("removexattr(ino={}, name={:?})", ino, name);
        let path = path_or_enoent!(self.inodes.path(ino), reply);
        let result = passthrough::removexattr(&self.session, &path, name);
        self.reply_empty("removexattr", &path, result, reply);
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        debug!("access(ino={}, mask={})", ino, mask);
        let path = path_or_enoent!(self.inodes.path(ino), reply);
        let result = passthrough::access(&self.session, &path, mask);
        self.reply_empty("access", &path, result, reply);
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create(parent={}, name={:?}, mode={:o}, flags={:#x})", parent, name, mode, flags);
        let path = path_or_enoent!(self.inodes.child_path(parent, name), reply);

        let result = self
            .pipeline
            .create(&self.session, &path, mode & 0o7777)
            .and_then(|()| self.attr_for(&path));

        match result {
            Ok(attr) => reply.created(&self.ttl, &attr, 0, 0, 0),
            Err(e) => {
                log_failure("create", &path, &e);
                reply.error(e.to_errno());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{ContentKey, KEY_SIZE};
    use crate::fs::{UniformPolicy, WholeFilePipeline};
    use crate::fs::inode::ROOT_INO;
    use tempfile::tempdir;

    fn encfs(root: &Path) -> EncFs {
        let session = MountSession::new(
            root,
            ContentKey::from_bytes([9; KEY_SIZE]),
            Box::new(UniformPolicy),
        )
        .unwrap();
        EncFs::new(session, Box::new(WholeFilePipeline::aead()), Duration::from_secs(1))
    }

    #[test]
    fn test_attr_reports_plaintext_size() {
        let dir = tempdir().unwrap();
        let fs = encfs(dir.path());
        let pipeline = WholeFilePipeline::aead();
        pipeline.create(fs.session(), Path::new("/f"), 0o640).unwrap();
        pipeline
            .write(fs.session(), Path::new("/f"), b"hello world", 0)
            .unwrap();

        let attr = fs.attr_for(Path::new("/f")).unwrap();
        assert_eq!(attr.size, 11);
        assert_eq!(attr.perm, 0o640);
        assert_eq!(attr.kind, fuser::FileType::RegularFile);
        assert!(std::fs::metadata(dir.path().join("f")).unwrap().len() > 11);

        // Same path, same inode
        assert_eq!(fs.attr_for(Path::new("/f")).unwrap().ino, attr.ino);
    }

    #[test]
    fn test_root_attr() {
        let dir = tempdir().unwrap();
        let fs = encfs(dir.path());
        let attr = fs.attr_for(Path::new("/")).unwrap();
        assert_eq!(attr.ino, ROOT_INO);
        assert_eq!(attr.kind, fuser::FileType::Directory);
    }

    #[test]
    fn test_attr_missing_is_enoent() {
        let dir = tempdir().unwrap();
        let fs = encfs(dir.path());
        let err = fs.attr_for(Path::new("/absent")).unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOENT);
    }

    #[test]
    fn test_set_time_conversion() {
        let at = SystemTime::UNIX_EPOCH + Duration::from_secs(5);
        assert_eq!(set_time(None), None);
        assert_eq!(set_time(Some(TimeOrNow::Now)), Some(SetTime::Now));
        assert_eq!(
            set_time(Some(TimeOrNow::SpecificTime(at))),
            Some(SetTime::At(at))
        );
    }
}
