//! Backing store pass-through interface
//!
//! Resolves virtual paths against the backing directory and performs the
//! structural system calls on the result. Nothing in here knows about
//! encryption.

use crate::error::{Error, Result};
use nix::sys::stat::{Mode, SFlag};
use nix::unistd::AccessFlags;
use std::ffi::{CString, OsStr};
use std::fs::{self, Metadata, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use super::attr::{DirEntry, FileKind, FsStats, TimeUpdate};

/// Pass-through interface to the backing directory.
///
/// Every method takes a virtual path and resolves it first.
#[derive(Debug, Clone)]
pub struct BackingStore {
    /// Absolute backing directory
    root: PathBuf,
}

impl BackingStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Get the root path
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a virtual path to its backing path.
    ///
    /// This is a plain join: `..` components are not collapsed or rejected,
    /// so a virtual path can name entries outside the backing directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        let relative = path.strip_prefix("/").unwrap_or(path);
        if relative.as_os_str().is_empty() {
            return self.root.clone();
        }
        self.root.join(relative)
    }

    /// lstat the backing path
    pub fn metadata(&self, path: &Path) -> Result<Metadata> {
        let path = self.resolve(path);
        Ok(fs::symlink_metadata(&path)?)
    }

    pub fn access(&self, path: &Path, mask: i32) -> Result<()> {
        let path = self.resolve(path);
        nix::unistd::access(path.as_path(), AccessFlags::from_bits_truncate(mask))
            .map_err(nix_error)
    }

    pub fn readlink(&self, path: &Path) -> Result<PathBuf> {
        let path = self.resolve(path);
        Ok(fs::read_link(&path)?)
    }

    /// Read directory entries, `.` and `..` excluded
    pub fn readdir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        use std::os::unix::fs::DirEntryExt;

        let path = self.resolve(path);
        let mut entries = Vec::new();
        for entry in fs::read_dir(&path)? {
            let entry = entry?;
            let kind = entry
                .file_type()
                .map(FileKind::from)
                .unwrap_or(FileKind::RegularFile);
            entries.push(DirEntry {
                name: entry.file_name(),
                ino: entry.ino(),
                kind,
            });
        }
        Ok(entries)
    }

    /// Create a filesystem node.
    ///
    /// Regular files go through `open(O_CREAT | O_EXCL)` and FIFOs through
    /// `mkfifo`; everything else is a real `mknod`.
    pub fn mknod(&self, path: &Path, mode: u32, rdev: u64) -> Result<()> {
        let path = self.resolve(path);
        let file_type = mode & libc::S_IFMT as u32;
        let perm = Mode::from_bits_truncate((mode & 0o7777) as libc::mode_t);

        if file_type == libc::S_IFREG as u32 || file_type == 0 {
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(mode & 0o7777)
                .open(&path)?;
            Ok(())
        } else if file_type == libc::S_IFIFO as u32 {
            nix::unistd::mkfifo(path.as_path(), perm).map_err(nix_error)
        } else {
            let kind = SFlag::from_bits_truncate(file_type as libc::mode_t);
            nix::sys::stat::mknod(path.as_path(), kind, perm, rdev as libc::dev_t)
                .map_err(nix_error)
        }
    }

    pub fn mkdir(&self, path: &Path, mode: u32) -> Result<()> {
        let path = self.resolve(path);
        fs::DirBuilder::new().mode(mode & 0o7777).create(&path)?;
        Ok(())
    }

    pub fn unlink(&self, path: &Path) -> Result<()> {
        let path = self.resolve(path);
        Ok(fs::remove_file(&path)?)
    }

    pub fn rmdir(&self, path: &Path) -> Result<()> {
        let path = self.resolve(path);
        Ok(fs::remove_dir(&path)?)
    }

    /// Create `link` pointing at `target`; the target is stored verbatim
    pub fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        Ok(std::os::unix::fs::symlink(target, self.resolve(link))?)
    }

    pub fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        Ok(fs::rename(self.resolve(from), self.resolve(to))?)
    }

    pub fn link(&self, from: &Path, to: &Path) -> Result<()> {
        Ok(fs::hard_link(self.resolve(from), self.resolve(to))?)
    }

    pub fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        let path = self.resolve(path);
        Ok(fs::set_permissions(&path, fs::Permissions::from_mode(mode & 0o7777))?)
    }

    /// lchown; `None` leaves that id unchanged
    pub fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let path = self.resolve(path);
        Ok(std::os::unix::fs::lchown(&path, uid, gid)?)
    }

    pub fn truncate(&self, path: &Path, size: u64) -> Result<()> {
        let path = self.resolve(path);
        let size = libc::off_t::try_from(size)
            .map_err(|_| Error::Io(io::Error::from_raw_os_error(libc::EFBIG)))?;
        nix::unistd::truncate(path.as_path(), size).map_err(nix_error)
    }

    /// Set timestamps with nanosecond precision without following symlinks.
    /// `None` leaves the timestamp untouched.
    pub fn utimens(
        &self,
        path: &Path,
        atime: Option<TimeUpdate>,
        mtime: Option<TimeUpdate>,
    ) -> Result<()> {
        let path = self.resolve(path);
        let cpath = cstring(&path)?;
        let times = [to_timespec(atime)?, to_timespec(mtime)?];

        // SAFETY: cpath is a valid NUL-terminated string and times holds two
        // initialized timespec values, as utimensat requires.
        let res = unsafe {
            libc::utimensat(
                libc::AT_FDCWD,
                cpath.as_ptr(),
                times.as_ptr(),
                libc::AT_SYMLINK_NOFOLLOW,
            )
        };
        if res == -1 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn statfs(&self, path: &Path) -> Result<FsStats> {
        let path = self.resolve(path);
        let st = nix::sys::statvfs::statvfs(path.as_path()).map_err(nix_error)?;
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

    /// Set an extended attribute, honouring XATTR_CREATE / XATTR_REPLACE
    pub fn setxattr(&self, path: &Path, name: &OsStr, value: &[u8], flags: i32) -> Result<()> {
        let path = self.resolve(path);
        if flags & (libc::XATTR_CREATE | libc::XATTR_REPLACE) != 0 {
            let exists = xattr::get(&path, name)?.is_some();
            if flags & libc::XATTR_CREATE != 0 && exists {
                return Err(Error::Io(io::Error::from_raw_os_error(libc::EEXIST)));
            }
            if flags & libc::XATTR_REPLACE != 0 && !exists {
                return Err(Error::Io(io::Error::from_raw_os_error(libc::ENODATA)));
            }
        }
        Ok(xattr::set(&path, name, value)?)
    }

    pub fn getxattr(&self, path: &Path, name: &OsStr) -> Result<Vec<u8>> {
        let path = self.resolve(path);
        xattr::get(&path, name)?
            .ok_or_else(|| Error::Io(io::Error::from_raw_os_error(libc::ENODATA)))
    }

    pub fn listxattr(&self, path: &Path) -> Result<Vec<std::ffi::OsString>> {
        let path = self.resolve(path);
        Ok(xattr::list(&path)?.collect())
    }

    pub fn removexattr(&self, path: &Path, name: &OsStr) -> Result<()> {
        let path = self.resolve(path);
        Ok(xattr::remove(&path, name)?)
    }
}

fn nix_error(errno: nix::errno::Errno) -> Error {
    Error::Io(io::Error::from(errno))
}

fn cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::InvalidPath(format!("{} contains a NUL byte", path.display())))
}

fn to_timespec(time: Option<TimeUpdate>) -> Result<libc::timespec> {
    let (tv_sec, tv_nsec) = match time {
        None => (0, libc::UTIME_OMIT),
        Some(TimeUpdate::Now) => (0, libc::UTIME_NOW),
        Some(TimeUpdate::At(at)) => {
            let since = at
                .duration_since(UNIX_EPOCH)
                .map_err(|_| Error::Io(io::Error::from_raw_os_error(libc::EINVAL)))?;
            (since.as_secs() as libc::time_t, since.subsec_nanos() as _)
        }
    };
    Ok(libc::timespec { tv_sec, tv_nsec })
}
