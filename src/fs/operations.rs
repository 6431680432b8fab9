//! Operation dispatcher
//!
//! Path-addressed filesystem operations. Structural operations go straight
//! to the backing store; content operations go through the staging engine;
//! `release` and `fsync` succeed without doing anything.
//!
//! Every failure is reported as a positive errno, ready for the FUSE reply.

use crate::crypto::plaintext_len;
use crate::error::Error;
use crate::fs::attr::{DirEntry, FileAttributes, FileKind, FsStats, TimeUpdate};
use crate::fs::backing::BackingStore;
use crate::fs::{marker, staging};
use crate::session::MountSession;
use std::ffi::{OsStr, OsString};
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Result of a dispatched operation; the error is a positive errno
pub type FsResult<T> = std::result::Result<T, libc::c_int>;

/// Filesystem operations on virtual paths.
///
/// Virtual paths are absolute and rooted at the mount point (`/` is the
/// mount root).
pub trait Operations: Send + Sync {
    fn getattr(&self, path: &Path) -> FsResult<FileAttributes>;
    fn access(&self, path: &Path, mask: i32) -> FsResult<()>;
    fn readlink(&self, path: &Path) -> FsResult<PathBuf>;
    fn readdir(&self, path: &Path) -> FsResult<Vec<DirEntry>>;
    fn mknod(&self, path: &Path, mode: u32, rdev: u64) -> FsResult<()>;
    fn mkdir(&self, path: &Path, mode: u32) -> FsResult<()>;
    fn unlink(&self, path: &Path) -> FsResult<()>;
    fn rmdir(&self, path: &Path) -> FsResult<()>;
    fn symlink(&self, target: &Path, link: &Path) -> FsResult<()>;
    fn rename(&self, from: &Path, to: &Path) -> FsResult<()>;
    fn link(&self, from: &Path, to: &Path) -> FsResult<()>;
    fn chmod(&self, path: &Path, mode: u32) -> FsResult<()>;
    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> FsResult<()>;
    fn truncate(&self, path: &Path, size: u64) -> FsResult<()>;
    fn utimens(
        &self,
        path: &Path,
        atime: Option<TimeUpdate>,
        mtime: Option<TimeUpdate>,
    ) -> FsResult<()>;
    fn open(&self, path: &Path, flags: i32) -> FsResult<()>;
    fn read(&self, path: &Path, offset: u64, size: u32) -> FsResult<Vec<u8>>;
    fn write(&self, path: &Path, offset: u64, data: &[u8]) -> FsResult<u32>;
    fn statfs(&self, path: &Path) -> FsResult<FsStats>;
    fn create(&self, path: &Path, mode: u32) -> FsResult<()>;

    fn release(&self, _path: &Path) -> FsResult<()> {
        Ok(())
    }

    fn fsync(&self, _path: &Path, _datasync: bool) -> FsResult<()> {
        Ok(())
    }

    fn setxattr(&self, path: &Path, name: &OsStr, value: &[u8], flags: i32) -> FsResult<()>;
    fn getxattr(&self, path: &Path, name: &OsStr) -> FsResult<Vec<u8>>;
    fn listxattr(&self, path: &Path) -> FsResult<Vec<OsString>>;
    fn removexattr(&self, path: &Path, name: &OsStr) -> FsResult<()>;
}

/// The encrypting overlay
pub struct SealFs {
    session: Arc<MountSession>,
    backing: BackingStore,
}

impl SealFs {
    pub fn new(session: Arc<MountSession>) -> Self {
        let backing = BackingStore::new(session.backing_dir().to_path_buf());
        Self { session, backing }
    }

    pub fn session(&self) -> &MountSession {
        &self.session
    }

    pub fn backing(&self) -> &BackingStore {
        &self.backing
    }

    fn enter(&self, op: &str, path: &Path) {
        if self.session.debug() {
            debug!("{}({:?})", op, path);
        }
    }

    /// Log a failed operation and turn it into an errno
    fn fail(&self, op: &str, path: &Path, err: Error) -> libc::c_int {
        let errno = err.errno();
        if err.is_crypto() {
            error!("{} {:?}: {}", op, path, err);
        } else if errno == libc::ENOENT || errno == libc::ENODATA {
            debug!("{} {:?}: {}", op, path, err);
        } else {
            warn!("{} {:?}: {}", op, path, err);
        }
        errno
    }
}

impl Operations for SealFs {
    fn getattr(&self, path: &Path) -> FsResult<FileAttributes> {
        self.enter("getattr", path);
        let meta = self
            .backing
            .metadata(path)
            .map_err(|e| self.fail("getattr", path, e))?;
        let mut attrs = FileAttributes::from_metadata(&meta);

        if attrs.kind == FileKind::RegularFile && marker::is_encrypted(&self.backing.resolve(path))
        {
            match plaintext_len(attrs.size) {
                Some(len) => attrs.size = len,
                None => warn!("getattr {:?}: malformed sealed file, reporting raw size", path),
            }
        }
        Ok(attrs)
    }

    fn access(&self, path: &Path, mask: i32) -> FsResult<()> {
        self.enter("access", path);
        self.backing
            .access(path, mask)
            .map_err(|e| self.fail("access", path, e))
    }

    fn readlink(&self, path: &Path) -> FsResult<PathBuf> {
        self.enter("readlink", path);
        self.backing
            .readlink(path)
            .map_err(|e| self.fail("readlink", path, e))
    }

    fn readdir(&self, path: &Path) -> FsResult<Vec<DirEntry>> {
        self.enter("readdir", path);
        self.backing
            .readdir(path)
            .map_err(|e| self.fail("readdir", path, e))
    }

    fn mknod(&self, path: &Path, mode: u32, rdev: u64) -> FsResult<()> {
        self.enter("mknod", path);
        self.backing
            .mknod(path, mode, rdev)
            .map_err(|e| self.fail("mknod", path, e))
    }

    fn mkdir(&self, path: &Path, mode: u32) -> FsResult<()> {
        self.enter("mkdir", path);
        self.backing
            .mkdir(path, mode)
            .map_err(|e| self.fail("mkdir", path, e))
    }

    fn unlink(&self, path: &Path) -> FsResult<()> {
        self.enter("unlink", path);
        self.backing
            .unlink(path)
            .map_err(|e| self.fail("unlink", path, e))
    }

    fn rmdir(&self, path: &Path) -> FsResult<()> {
        self.enter("rmdir", path);
        self.backing
            .rmdir(path)
            .map_err(|e| self.fail("rmdir", path, e))
    }

    fn symlink(&self, target: &Path, link: &Path) -> FsResult<()> {
        self.enter("symlink", link);
        self.backing
            .symlink(target, link)
            .map_err(|e| self.fail("symlink", link, e))
    }

    fn rename(&self, from: &Path, to: &Path) -> FsResult<()> {
        self.enter("rename", from);
        self.backing
            .rename(from, to)
            .map_err(|e| self.fail("rename", from, e))
    }

    fn link(&self, from: &Path, to: &Path) -> FsResult<()> {
        self.enter("link", from);
        self.backing
            .link(from, to)
            .map_err(|e| self.fail("link", from, e))
    }

    fn chmod(&self, path: &Path, mode: u32) -> FsResult<()> {
        self.enter("chmod", path);
        self.backing
            .chmod(path, mode)
            .map_err(|e| self.fail("chmod", path, e))
    }

    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> FsResult<()> {
        self.enter("chown", path);
        self.backing
            .chown(path, uid, gid)
            .map_err(|e| self.fail("chown", path, e))
    }

    /// Plain truncate for unmarked files; sealed files are resized through
    /// their plaintext so they stay valid sealed streams.
    fn truncate(&self, path: &Path, size: u64) -> FsResult<()> {
        self.enter("truncate", path);
        let resolved = self.backing.resolve(path);
        let result = if marker::is_encrypted(&resolved) {
            staging::truncate(&resolved, size, self.session.key())
        } else {
            self.backing.truncate(path, size)
        };
        result.map_err(|e| self.fail("truncate", path, e))
    }

    fn utimens(
        &self,
        path: &Path,
        atime: Option<TimeUpdate>,
        mtime: Option<TimeUpdate>,
    ) -> FsResult<()> {
        self.enter("utimens", path);
        self.backing
            .utimens(path, atime, mtime)
            .map_err(|e| self.fail("utimens", path, e))
    }

    /// Check that the file can be opened with `flags`.
    ///
    /// No handle is kept: content calls reopen by path. Creation and
    /// truncation flags are dropped here since creation goes through
    /// `create` and truncation through `truncate`.
    fn open(&self, path: &Path, flags: i32) -> FsResult<()> {
        self.enter("open", path);
        let accmode = flags & libc::O_ACCMODE;
        let custom = flags & !(libc::O_ACCMODE | libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC);

        OpenOptions::new()
            .read(accmode == libc::O_RDONLY || accmode == libc::O_RDWR)
            .write(accmode == libc::O_WRONLY || accmode == libc::O_RDWR)
            .custom_flags(custom)
            .open(self.backing.resolve(path))
            .map(drop)
            .map_err(|e| self.fail("open", path, e.into()))
    }

    fn read(&self, path: &Path, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        self.enter("read", path);
        staging::read(
            &self.backing.resolve(path),
            offset,
            size as usize,
            self.session.key(),
        )
        .map_err(|e| self.fail("read", path, e))
    }

    fn write(&self, path: &Path, offset: u64, data: &[u8]) -> FsResult<u32> {
        self.enter("write", path);
        let written = staging::write(&self.backing.resolve(path), offset, data, self.session.key())
            .map_err(|e| self.fail("write", path, e))?;
        u32::try_from(written).map_err(|_| libc::EFBIG)
    }

    fn statfs(&self, path: &Path) -> FsResult<FsStats> {
        self.enter("statfs", path);
        self.backing
            .statfs(path)
            .map_err(|e| self.fail("statfs", path, e))
    }

    fn create(&self, path: &Path, mode: u32) -> FsResult<()> {
        self.enter("create", path);
        staging::create(&self.backing.resolve(path), mode, self.session.key())
            .map_err(|e| self.fail("create", path, e))
    }

    fn setxattr(&self, path: &Path, name: &OsStr, value: &[u8], flags: i32) -> FsResult<()> {
        self.enter("setxattr", path);
        self.backing
            .setxattr(path, name, value, flags)
            .map_err(|e| self.fail("setxattr", path, e))
    }

    fn getxattr(&self, path: &Path, name: &OsStr) -> FsResult<Vec<u8>> {
        self.enter("getxattr", path);
        self.backing
            .getxattr(path, name)
            .map_err(|e| self.fail("getxattr", path, e))
    }

    fn listxattr(&self, path: &Path) -> FsResult<Vec<OsString>> {
        self.enter("listxattr", path);
        self.backing
            .listxattr(path)
            .map_err(|e| self.fail("listxattr", path, e))
    }

    fn removexattr(&self, path: &Path, name: &OsStr) -> FsResult<()> {
        self.enter("removexattr", path);
        self.backing
            .removexattr(path, name)
            .map_err(|e| self.fail("removexattr", path, e))
    }
}
