//! Metadata pass-through to the mirror
//!
//! Each operation resolves its virtual path(s) and forwards to the matching
//! native call. Content is never touched here, with two exceptions routed
//! through the [`ContentPipeline`]: truncation and regular-file `mknod`.

use crate::error::{Error, Result};
use crate::fs::pipeline::ContentPipeline;
use crate::fs::policy::classify_xattr_error;
use crate::session::MountSession;
use nix::sys::stat::{Mode, SFlag};
use nix::unistd::AccessFlags;
use std::ffi::{CString, OsStr, OsString};
use std::fs::{self, Metadata, OpenOptions, Permissions};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Directory entry in the mirror
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: OsString,
    pub file_type: fs::FileType,
}

/// Filesystem statistics of the mirror's backing filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    pub block_size: u32,
    pub name_max: u32,
    pub fragment_size: u32,
}

/// Timestamp requested by `utimens`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetTime {
    Now,
    At(SystemTime),
}

fn errno(code: libc::c_int) -> Error {
    Error::Io(std::io::Error::from_raw_os_error(code))
}

fn c_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| errno(libc::EINVAL))
}

/// `lstat` of the real path
pub fn getattr(session: &MountSession, path: &Path) -> Result<Metadata> {
    let real = session.resolve(path)?;
    Ok(fs::symlink_metadata(&real)?)
}

pub fn access(session: &MountSession, path: &Path, mask: i32) -> Result<()> {
    let real = session.resolve(path)?;
    nix::unistd::access(&real, AccessFlags::from_bits_truncate(mask))?;
    Ok(())
}

pub fn readlink(session: &MountSession, path: &Path) -> Result<PathBuf> {
    let real = session.resolve(path)?;
    Ok(fs::read_link(&real)?)
}

/// List a directory; `.` and `..` are left to the caller
pub fn readdir(session: &MountSession, path: &Path) -> Result<Vec<DirEntry>> {
    let real = session.resolve(path)?;
    let mut entries = Vec::new();

    for entry in fs::read_dir(&real)? {
        let entry = entry?;
        entries.push(DirEntry {
            name: entry.file_name(),
            file_type: entry.file_type()?,
        });
    }

    Ok(entries)
}

/// Create a node; regular files go through the pipeline so they are sealed
pub fn mknod(
    session: &MountSession,
    pipeline: &dyn ContentPipeline,
    path: &Path,
    mode: u32,
    rdev: u32,
) -> Result<()> {
    let real = session.resolve(path)?;
    let kind = mode & libc::S_IFMT;
    let perm = Mode::from_bits_truncate(mode & 0o7777);

    if kind == libc::S_IFREG || kind == 0 {
        if fs::symlink_metadata(&real).is_ok() {
            return Err(errno(libc::EEXIST));
        }
        return pipeline.create(session, path, mode & 0o7777);
    }

    if kind == libc::S_IFIFO {
        nix::unistd::mkfifo(&real, perm)?;
    } else {
        nix::sys::stat::mknod(
            &real,
            SFlag::from_bits_truncate(kind),
            perm,
            rdev as libc::dev_t,
        )?;
    }
    Ok(())
}

pub fn mkdir(session: &MountSession, path: &Path, mode: u32) -> Result<()> {
    let real = session.resolve(path)?;
    fs::DirBuilder::new().mode(mode & 0o7777).create(&real)?;
    Ok(())
}

pub fn unlink(session: &MountSession, path: &Path) -> Result<()> {
    let real = session.resolve(path)?;
    fs::remove_file(&real)?;
    Ok(())
}

pub fn rmdir(session: &MountSession, path: &Path) -> Result<()> {
    let real = session.resolve(path)?;
    fs::remove_dir(&real)?;
    Ok(())
}

/// Create `link` pointing at `target`; the target is stored verbatim
pub fn symlink(session: &MountSession, target: &Path, link: &Path) -> Result<()> {
    let real_link = session.resolve(link)?;
    std::os::unix::fs::symlink(target, &real_link)?;
    Ok(())
}

pub fn rename(session: &MountSession, from: &Path, to: &Path) -> Result<()> {
    let real_from = session.resolve(from)?;
    let real_to = session.resolve(to)?;
    fs::rename(&real_from, &real_to)?;
    Ok(())
}

pub fn link(session: &MountSession, from: &Path, to: &Path) -> Result<()> {
    let real_from = session.resolve(from)?;
    let real_to = session.resolve(to)?;
    fs::hard_link(&real_from, &real_to)?;
    Ok(())
}

pub fn chmod(session: &MountSession, path: &Path, mode: u32) -> Result<()> {
    let real = session.resolve(path)?;
    fs::set_permissions(&real, Permissions::from_mode(mode & 0o7777))?;
    Ok(())
}

/// `lchown`; `None` leaves that id unchanged
pub fn chown(session: &MountSession, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
    let real = session.resolve(path)?;
    std::os::unix::fs::lchown(&real, uid, gid)?;
    Ok(())
}

/// Truncate the plaintext (never the ciphertext directly)
pub fn truncate(
    session: &MountSession,
    pipeline: &dyn ContentPipeline,
    path: &Path,
    size: u64,
) -> Result<()> {
    pipeline.truncate(session, path, size)
}

/// Set timestamps without following symlinks; `None` leaves one unchanged
pub fn utimens(
    session: &MountSession,
    path: &Path,
    atime: Option<SetTime>,
    mtime: Option<SetTime>,
) -> Result<()> {
    let real = session.resolve(path)?;
    let c_real = c_path(&real)?;
    let times = [to_timespec(atime), to_timespec(mtime)];

    let res = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c_real.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if res == -1 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

fn to_timespec(time: Option<SetTime>) -> libc::timespec {
    match time {
        None => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
        Some(SetTime::Now) => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_NOW,
        },
        Some(SetTime::At(t)) => {
            let (secs, nanos) = match t.duration_since(UNIX_EPOCH) {
                Ok(d) => (d.as_secs() as i64, d.subsec_nanos() as i64),
                Err(e) => {
                    // Before the epoch: borrow a second so nanos stay positive
                    let d = e.duration();
                    let nanos = d.subsec_nanos() as i64;
                    if nanos == 0 {
                        (-(d.as_secs() as i64), 0)
                    } else {
                        (-(d.as_secs() as i64) - 1, 1_000_000_000 - nanos)
                    }
                }
            };
            libc::timespec {
                tv_sec: secs as libc::time_t,
                tv_nsec: nanos as _,
            }
        }
    }
}

/// Validate that the real file opens with `flags`, then close it again
pub fn open(session: &MountSession, path: &Path, flags: i32) -> Result<()> {
    let real = session.resolve(path)?;

    let accmode = flags & libc::O_ACCMODE;
    let passthrough_flags =
        flags & !(libc::O_ACCMODE | libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC);

    OpenOptions::new()
        .read(accmode == libc::O_RDONLY || accmode == libc::O_RDWR)
        .write(accmode == libc::O_WRONLY || accmode == libc::O_RDWR)
        .custom_flags(passthrough_flags)
        .open(&real)?;
    Ok(())
}

/// Nothing is held open between calls
pub fn release(_session: &MountSession, _path: &Path) -> Result<()> {
    Ok(())
}

pub fn fsync(session: &MountSession, path: &Path, datasync: bool) -> Result<()> {
    let real = session.resolve(path)?;
    let file = fs::File::open(&real)?;
    if datasync {
        file.sync_data()?;
    } else {
        file.sync_all()?;
    }
    Ok(())
}

pub fn statfs(session: &MountSession, path: &Path) -> Result<FsStats> {
    let real = session.resolve(path)?;
    let st = nix::sys::statvfs::statvfs(&real)?;

    Ok(FsStats {
        blocks: st.blocks() as u64,
        blocks_free: st.blocks_free() as u64,
        blocks_available: st.blocks_available() as u64,
        files: st.files() as u64,
        files_free: st.files_free() as u64,
        block_size: st.block_size() as u32,
        name_max: st.name_max() as u32,
        fragment_size: st.fragment_size() as u32,
    })
}

/// Set an attribute, honouring `XATTR_CREATE` and `XATTR_REPLACE`
pub fn setxattr(
    session: &MountSession,
    path: &Path,
    name: &OsStr,
    value: &[u8],
    flags: i32,
) -> Result<()> {
    let real = session.resolve(path)?;

    if flags & (libc::XATTR_CREATE | libc::XATTR_REPLACE) != 0 {
        let exists = xattr::get(&real, name)
            .map_err(|e| classify_xattr_error(e, &real))?
            .is_some();
        if flags & libc::XATTR_CREATE != 0 && exists {
            return Err(errno(libc::EEXIST));
        }
        if flags & libc::XATTR_REPLACE != 0 && !exists {
            return Err(errno(libc::ENODATA));
        }
    }

    xattr::set(&real, name, value).map_err(|e| classify_xattr_error(e, &real))
}

pub fn getxattr(session: &MountSession, path: &Path, name: &OsStr) -> Result<Vec<u8>> {
    let real = session.resolve(path)?;
    match xattr::get(&real, name).map_err(|e| classify_xattr_error(e, &real))? {
        Some(value) => Ok(value),
        None => Err(errno(libc::ENODATA)),
    }
}

/// Attribute names as a NUL-separated list
pub fn listxattr(session: &MountSession, path: &Path) -> Result<Vec<u8>> {
    let real = session.resolve(path)?;
    let mut list = Vec::new();

    for name in xattr::list(&real).map_err(|e| classify_xattr_error(e, &real))? {
        list.extend_from_slice(name.as_bytes());
        list.push(0);
    }

    Ok(list)
}

pub fn removexattr(session: &MountSession, path: &Path, name: &OsStr) -> Result<()> {
    let real = session.resolve(path)?;
    xattr::remove(&real, name).map_err(|e| classify_xattr_error(e, &real))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{ContentKey, KEY_SIZE};
    use crate::fs::policy::tests::xattrs_supported;
    use crate::fs::{UniformPolicy, WholeFilePipeline};
    use std::os::unix::fs::MetadataExt;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    fn session(dir: &TempDir) -> MountSession {
        MountSession::new(
            dir.path(),
            ContentKey::from_bytes([3; KEY_SIZE]),
            Box::new(UniformPolicy),
        )
        .unwrap()
    }

    #[test]
    fn test_getattr_stable_across_reads() {
        let dir = tempdir().unwrap();
        let session = session(&dir);
        let pipeline = WholeFilePipeline::aead();
        pipeline.create(&session, Path::new("/f"), 0o644).unwrap();
        pipeline.write(&session, Path::new("/f"), b"data", 0).unwrap();

        let before = getattr(&session, Path::new("/f")).unwrap();
        for _ in 0..3 {
            pipeline.read(&session, Path::new("/f"), 0, 4).unwrap();
        }
        let after = getattr(&session, Path::new("/f")).unwrap();

        assert_eq!(before.ino(), after.ino());
        assert_eq!(before.size(), after.size());
        assert_eq!(before.mode(), after.mode());
        assert_eq!(before.mtime(), after.mtime());
        assert_eq!(before.mtime_nsec(), after.mtime_nsec());
    }

    #[test]
    fn test_getattr_missing() {
        let dir = tempdir().unwrap();
        let err = getattr(&session(&dir), Path::new("/nope")).unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOENT);
    }

    #[test]
    fn test_directory_ops() {
        let dir = tempdir().unwrap();
        let session = session(&dir);

        mkdir(&session, Path::new("/sub"), 0o750).unwrap();
        assert!(dir.path().join("sub").is_dir());
        assert_eq!(
            getattr(&session, Path::new("/sub")).unwrap().mode() & 0o777,
            0o750
        );

        fs::write(dir.path().join("sub/x"), b"").unwrap();
        let names: Vec<_> = readdir(&session, Path::new("/sub"))
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec![OsString::from("x")]);

        assert_eq!(
            rmdir(&session, Path::new("/sub")).unwrap_err().to_errno(),
            libc::ENOTEMPTY
        );
        unlink(&session, Path::new("/sub/x")).unwrap();
        rmdir(&session, Path::new("/sub")).unwrap();
        assert!(!dir.path().join("sub").exists());
    }

    #[test]
    fn test_rename_and_link_resolve_both_paths() {
        let dir = tempdir().unwrap();
        let session = session(&dir);
        fs::write(dir.path().join("a"), b"1").unwrap();

        rename(&session, Path::new("/a"), Path::new("/b")).unwrap();
        assert!(!dir.path().join("a").exists());
        assert!(dir.path().join("b").exists());

        link(&session, Path::new("/b"), Path::new("/c")).unwrap();
        assert_eq!(getattr(&session, Path::new("/c")).unwrap().nlink(), 2);

        assert!(rename(&session, Path::new("/b"), Path::new("/../b")).is_err());
    }

    #[test]
    fn test_symlink_stores_target_verbatim() {
        let dir = tempdir().unwrap();
        let session = session(&dir);

        symlink(&session, Path::new("../elsewhere"), Path::new("/ln")).unwrap();
        assert_eq!(
            readlink(&session, Path::new("/ln")).unwrap(),
            PathBuf::from("../elsewhere")
        );
        assert!(getattr(&session, Path::new("/ln")).unwrap().file_type().is_symlink());
    }

    #[test]
    fn test_chmod_and_utimens() {
        let dir = tempdir().unwrap();
        let session = session(&dir);
        fs::write(dir.path().join("f"), b"").unwrap();

        chmod(&session, Path::new("/f"), 0o600).unwrap();
        assert_eq!(getattr(&session, Path::new("/f")).unwrap().mode() & 0o777, 0o600);

        let stamp = UNIX_EPOCH + Duration::new(1_000_000, 500);
        utimens(&session, Path::new("/f"), None, Some(SetTime::At(stamp))).unwrap();
        let meta = getattr(&session, Path::new("/f")).unwrap();
        assert_eq!(meta.mtime(), 1_000_000);
        assert_eq!(meta.mtime_nsec(), 500);
    }

    #[test]
    fn test_chown_to_self() {
        let dir = tempdir().unwrap();
        let session = session(&dir);
        fs::write(dir.path().join("f"), b"").unwrap();

        let meta = getattr(&session, Path::new("/f")).unwrap();
        chown(&session, Path::new("/f"), Some(meta.uid()), Some(meta.gid())).unwrap();
        chown(&session, Path::new("/f"), None, None).unwrap();
    }

    #[test]
    fn test_mknod_regular_is_sealed() {
        let dir = tempdir().unwrap();
        let session = session(&dir);
        let pipeline = WholeFilePipeline::aead();

        mknod(&session, &pipeline, Path::new("/n"), libc::S_IFREG | 0o644, 0).unwrap();
        assert!(pipeline.read(&session, Path::new("/n"), 0, 16).unwrap().is_empty());
        assert!(fs::metadata(dir.path().join("n")).unwrap().len() > 0);

        let err = mknod(&session, &pipeline, Path::new("/n"), libc::S_IFREG | 0o644, 0)
            .unwrap_err();
        assert_eq!(err.to_errno(), libc::EEXIST);
    }

    #[test]
    fn test_mknod_fifo() {
        use std::os::unix::fs::FileTypeExt;

        let dir = tempdir().unwrap();
        let session = session(&dir);
        let pipeline = WholeFilePipeline::aead();

        mknod(&session, &pipeline, Path::new("/p"), libc::S_IFIFO | 0o600, 0).unwrap();
        assert!(getattr(&session, Path::new("/p")).unwrap().file_type().is_fifo());
    }

    #[test]
    fn test_truncate_goes_through_pipeline() {
        let dir = tempdir().unwrap();
        let session = session(&dir);
        let pipeline = WholeFilePipeline::aead();
        pipeline.create(&session, Path::new("/f"), 0o644).unwrap();
        pipeline.write(&session, Path::new("/f"), b"abcdef", 0).unwrap();

        truncate(&session, &pipeline, Path::new("/f"), 2).unwrap();
        assert_eq!(pipeline.read(&session, Path::new("/f"), 0, 100).unwrap(), b"ab");
    }

    #[test]
    fn test_open_checks_access() {
        let dir = tempdir().unwrap();
        let session = session(&dir);
        fs::write(dir.path().join("f"), b"").unwrap();

        open(&session, Path::new("/f"), libc::O_RDWR).unwrap();
        open(&session, Path::new("/f"), libc::O_RDONLY | libc::O_TRUNC).unwrap();
        assert_eq!(
            open(&session, Path::new("/missing"), libc::O_RDONLY)
                .unwrap_err()
                .to_errno(),
            libc::ENOENT
        );
        release(&session, Path::new("/f")).unwrap();
        fsync(&session, Path::new("/f"), true).unwrap();
    }

    #[test]
    fn test_statfs() {
        let dir = tempdir().unwrap();
        let stats = statfs(&session(&dir), Path::new("/")).unwrap();
        assert!(stats.block_size > 0);
        assert!(stats.name_max > 0);
    }

    #[test]
    fn test_xattr_passthrough() {
        let dir = tempdir().unwrap();
        if !xattrs_supported(dir.path()) {
            eprintln!("skipping: no user xattr support on temp dir");
            return;
        }
        let session = session(&dir);
        fs::write(dir.path().join("f"), b"").unwrap();
        let f = Path::new("/f");
        let name = OsStr::new("user.color");

        assert_eq!(getxattr(&session, f, name).unwrap_err().to_errno(), libc::ENODATA);
        assert_eq!(
            setxattr(&session, f, name, b"red", libc::XATTR_REPLACE)
                .unwrap_err()
                .to_errno(),
            libc::ENODATA
        );

        setxattr(&session, f, name, b"red", libc::XATTR_CREATE).unwrap();
        assert_eq!(getxattr(&session, f, name).unwrap(), b"red");
        assert_eq!(
            setxattr(&session, f, name, b"blue", libc::XATTR_CREATE)
                .unwrap_err()
                .to_errno(),
            libc::EEXIST
        );
        setxattr(&session, f, name, b"blue", libc::XATTR_REPLACE).unwrap();
        assert_eq!(getxattr(&session, f, name).unwrap(), b"blue");

        let list = listxattr(&session, f).unwrap();
        assert!(list
            .split(|b| *b == 0)
            .any(|n| n == b"user.color"));

        removexattr(&session, f, name).unwrap();
        assert!(getxattr(&session, f, name).is_err());
    }

    #[test]
    fn test_timespec_conversion() {
        assert_eq!(to_timespec(None).tv_nsec, libc::UTIME_OMIT);
        assert_eq!(to_timespec(Some(SetTime::Now)).tv_nsec, libc::UTIME_NOW);

        let ts = to_timespec(Some(SetTime::At(UNIX_EPOCH + Duration::new(5, 7))));
        assert_eq!((ts.tv_sec, ts.tv_nsec), (5, 7));

        let ts = to_timespec(Some(SetTime::At(UNIX_EPOCH - Duration::new(1, 250))));
        assert_eq!((ts.tv_sec, ts.tv_nsec), (-2, 999_999_750));
    }
}
