//! FUSE adapter
//!
//! Translates the kernel's inode-addressed requests into path-addressed
//! calls on an [`Operations`] implementation.

use fuser::{
    FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use libc::{EINVAL, ENOENT, ERANGE};
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

use super::attr::TimeUpdate;
use super::inode::InodeTable;
use super::operations::{FsResult, Operations};
use crate::config::MountConfig;
use crate::error::{Error, Result};

const TTL: Duration = Duration::from_secs(1);

/// `fuser` front end for a path-based filesystem
pub struct FuseAdapter<O: Operations> {
    ops: O,
    inodes: InodeTable,
}

impl<O: Operations> FuseAdapter<O> {
    pub fn new(ops: O) -> Self {
        Self {
            ops,
            inodes: InodeTable::new(),
        }
    }

    pub fn operations(&self) -> &O {
        &self.ops
    }

    /// Virtual path of `ino`
    fn path(&self, ino: u64) -> FsResult<PathBuf> {
        self.inodes.path(ino).ok_or(ENOENT)
    }

    /// Virtual path of `name` inside directory `parent`
    fn child_path(&self, parent: u64, name: &OsStr) -> FsResult<PathBuf> {
        Ok(self.path(parent)?.join(name))
    }

    /// Stat a freshly created or looked-up path and count the lookup
    fn entry(&self, path: &Path) -> FsResult<fuser::FileAttr> {
        let attrs = self.ops.getattr(path)?;
        let ino = self.inodes.lookup(path);
        Ok(attrs.to_fuser_attr(ino))
    }

    fn reply_entry(&self, path: FsResult<PathBuf>, reply: ReplyEntry) {
        match path.and_then(|p| self.entry(&p)) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_setattr(
        &self,
        ino: u64,
        path: &Path,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
    ) -> FsResult<fuser::FileAttr> {
        if let Some(mode) = mode {
            self.ops.chmod(path, mode)?;
        }
        if uid.is_some() || gid.is_some() {
            self.ops.chown(path, uid, gid)?;
        }
        if let Some(size) = size {
            self.ops.truncate(path, size)?;
        }
        if atime.is_some() || mtime.is_some() {
            self.ops.utimens(
                path,
                atime.map(TimeUpdate::from),
                mtime.map(TimeUpdate::from),
            )?;
        }
        let attrs = self.ops.getattr(path)?;
        Ok(attrs.to_fuser_attr(ino))
    }

    /// Listing of directory `ino` including `.` and `..`.
    ///
    /// Entries the kernel has not looked up keep their backing inode number
    /// so that listing does not grow the table.
    fn dir_entries(&self, ino: u64) -> FsResult<Vec<(u64, FileType, OsString)>> {
        let dir = self.path(ino)?;
        let listing = self.ops.readdir(&dir)?;

        let parent_ino = dir
            .parent()
            .and_then(|parent| self.inodes.existing(parent))
            .unwrap_or(ino);
        let mut entries = Vec::with_capacity(listing.len() + 2);
        entries.push((ino, FileType::Directory, OsString::from(".")));
        entries.push((parent_ino, FileType::Directory, OsString::from("..")));
        for entry in listing {
            let child_ino = self
                .inodes
                .existing(&dir.join(&entry.name))
                .unwrap_or(entry.ino);
            entries.push((child_ino, entry.kind.to_fuser_type(), entry.name));
        }
        Ok(entries)
    }
}

fn to_offset(offset: i64) -> FsResult<u64> {
    u64::try_from(offset).map_err(|_| EINVAL)
}

fn result_empty(result: FsResult<()>, reply: ReplyEmpty) {
    match result {
        Ok(()) => reply.ok(),
        Err(e) => reply.error(e),
    }
}

/// Answer a size query, or the data if it fits the caller's buffer
fn reply_xattr(data: Vec<u8>, size: u32, reply: ReplyXattr) {
    if size == 0 {
        reply.size(data.len() as u32);
    } else if data.len() <= size as usize {
        reply.data(&data);
    } else {
        reply.error(ERANGE);
    }
}

impl<O: Operations> Filesystem for FuseAdapter<O> {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);
        self.reply_entry(self.child_path(parent, name), reply);
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);
        match self.path(ino).and_then(|p| self.ops.getattr(&p)) {
            Ok(attrs) => reply.attr(&TTL, &attrs.to_fuser_attr(ino)),
            Err(e) => reply.error(e),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
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
        debug!("setattr(ino={}, mode={:?}, size={:?})", ino, mode, size);
        let result = self
            .path(ino)
            .and_then(|p| self.apply_setattr(ino, &p, mode, uid, gid, size, atime, mtime));
        match result {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        debug!("readlink(ino={})", ino);
        match self.path(ino).and_then(|p| self.ops.readlink(&p)) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(e),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        debug!("mknod(parent={}, name={:?}, mode={:o})", parent, name, mode);
        let path = self.child_path(parent, name).and_then(|p| {
            self.ops.mknod(&p, mode & !(umask & 0o777), rdev as u64)?;
            Ok(p)
        });
        self.reply_entry(path, reply);
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent={}, name={:?})", parent, name);
        let path = self.child_path(parent, name).and_then(|p| {
            self.ops.mkdir(&p, mode & !umask)?;
            Ok(p)
        });
        self.reply_entry(path, reply);
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent={}, name={:?})", parent, name);
        let result = self.child_path(parent, name).and_then(|p| {
            self.ops.unlink(&p)?;
            self.inodes.unlink(&p);
            Ok(())
        });
        result_empty(result, reply);
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={}, name={:?})", parent, name);
        let result = self.child_path(parent, name).and_then(|p| {
            self.ops.rmdir(&p)?;
            self.inodes.unlink(&p);
            Ok(())
        });
        result_empty(result, reply);
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        debug!("symlink(parent={}, name={:?}, target={:?})", parent, link_name, target);
        let path = self.child_path(parent, link_name).and_then(|p| {
            self.ops.symlink(target, &p)?;
            Ok(p)
        });
        self.reply_entry(path, reply);
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!("rename(parent={}, name={:?}, newname={:?})", parent, name, newname);
        // RENAME_NOREPLACE / RENAME_EXCHANGE are not supported
        if flags != 0 {
            reply.error(EINVAL);
            return;
        }
        let result = self.child_path(parent, name).and_then(|from| {
            let to = self.child_path(newparent, newname)?;
            self.ops.rename(&from, &to)?;
            self.inodes.rename(&from, &to);
            Ok(())
        });
        result_empty(result, reply);
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        debug!("link(ino={}, newparent={}, newname={:?})", ino, newparent, newname);
        let path = self.path(ino).and_then(|from| {
            let to = self.child_path(newparent, newname)?;
            self.ops.link(&from, &to)?;
            Ok(to)
        });
        self.reply_entry(path, reply);
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={:#x})", ino, flags);
        match self.path(ino).and_then(|p| self.ops.open(&p, flags)) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(e),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, offset={}, size={})", ino, offset, size);
        let result = self
            .path(ino)
            .and_then(|p| self.ops.read(&p, to_offset(offset)?, size));
        match result {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write(ino={}, offset={}, len={})", ino, offset, data.len());
        let result = self
            .path(ino)
            .and_then(|p| self.ops.write(&p, to_offset(offset)?, data));
        match result {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e),
        }
    }

    fn flush(&mut self, _req: &Request, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release(ino={})", ino);
        result_empty(self.path(ino).and_then(|p| self.ops.release(&p)), reply);
    }

    fn fsync(&mut self, _req: &Request, ino: u64, _fh: u64, datasync: bool, reply: ReplyEmpty) {
        debug!("fsync(ino={}, datasync={})", ino, datasync);
        result_empty(
            self.path(ino).and_then(|p| self.ops.fsync(&p, datasync)),
            reply,
        );
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, offset={})", ino, offset);
        let entries = match self.dir_entries(ino) {
            Ok(entries) => entries,
            Err(e) => return reply.error(e),
        };

        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, ino: u64, reply: ReplyStatfs) {
        debug!("statfs(ino={})", ino);
        match self.path(ino).and_then(|p| self.ops.statfs(&p)) {
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
            Err(e) => reply.error(e),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        debug!("setxattr(ino={}, name={:?})", ino, name);
        result_empty(
            self.path(ino)
                .and_then(|p| self.ops.setxattr(&p, name, value, flags)),
            reply,
        );
    }

    fn getxattr(&mut self, _req: &Request, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        debug!("getxattr(ino={}, name={:?})", ino, name);
        match self.path(ino).and_then(|p| self.ops.getxattr(&p, name)) {
            Ok(value) => reply_xattr(value, size, reply),
            Err(e) => reply.error(e),
        }
    }

    fn listxattr(&mut self, _req: &Request, ino: u64, size: u32, reply: ReplyXattr) {
        debug!("listxattr(ino={})", ino);
        match self.path(ino).and_then(|p| self.ops.listxattr(&p)) {
            Ok(names) => {
                let mut data = Vec::new();
                for name in names {
                    data.extend_from_slice(name.as_bytes());
                    data.push(0);
                }
                reply_xattr(data, size, reply);
            }
            Err(e) => reply.error(e),
        }
    }

    fn removexattr(&mut self, _req: &Request, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("removexattr(ino={}, name={:?})", ino, name);
        result_empty(
            self.path(ino).and_then(|p| self.ops.removexattr(&p, name)),
            reply,
        );
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        debug!("access(ino={}, mask={})", ino, mask);
        result_empty(self.path(ino).and_then(|p| self.ops.access(&p, mask)), reply);
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create(parent={}, name={:?}, mode={:o}, flags={:#x})", parent, name, mode, flags);
        let result = self.child_path(parent, name).and_then(|p| {
            self.ops.create(&p, mode & !umask)?;
            self.entry(&p)
        });
        match result {
            Ok(attr) => reply.created(&TTL, &attr, 0, 0, 0),
            Err(e) => reply.error(e),
        }
    }
}

/// Build the `fuser` mount options for a mount configuration
pub fn mount_options(config: &MountConfig) -> Vec<MountOption> {
    let mut options = vec![MountOption::FSName(config.fsname.clone())];

    if config.auto_unmount {
        options.push(MountOption::AutoUnmount);
    }
    if config.allow_other {
        options.push(MountOption::AllowOther);
    }
    if config.allow_root {
        options.push(MountOption::AllowRoot);
    }
    for option in &config.options {
        options.push(MountOption::CUSTOM(option.clone()));
    }
    options
}

/// Mount `ops` at `mount_point` and serve requests until unmounted
pub fn mount<O: Operations + 'static>(
    ops: O,
    mount_point: &Path,
    config: &MountConfig,
) -> Result<()> {
    let options = mount_options(config);
    info!("Mounting at {:?}", mount_point);
    fuser::mount2(FuseAdapter::new(ops), mount_point, &options)
        .map_err(|e| Error::Internal(format!("mount failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{MasterKey, KEY_SIZE};
    use crate::fs::inode::ROOT_INO;
    use crate::fs::SealFs;
    use crate::session::MountSession;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};
    use zeroize::Zeroizing;

    fn adapter() -> (TempDir, FuseAdapter<SealFs>) {
        let dir = tempdir().unwrap();
        let key = MasterKey::from_bytes(Zeroizing::new([7; KEY_SIZE]));
        let root = dir.path().canonicalize().unwrap();
        let session = MountSession::with_key(root, key, false);
        (dir, FuseAdapter::new(SealFs::new(Arc::new(session))))
    }

    #[test]
    fn test_default_mount_options() {
        let options = mount_options(&MountConfig::default());
        assert!(options.contains(&MountOption::FSName("sealfs".to_string())));
        assert!(options.contains(&MountOption::AutoUnmount));
        assert!(!options.contains(&MountOption::AllowOther));
    }

    #[test]
    fn test_custom_mount_options() {
        let config = MountConfig {
            allow_other: true,
            auto_unmount: false,
            options: vec!["noatime".to_string()],
            ..MountConfig::default()
        };
        let options = mount_options(&config);
        assert!(options.contains(&MountOption::AllowOther));
        assert!(!options.contains(&MountOption::AutoUnmount));
        assert!(options.contains(&MountOption::CUSTOM("noatime".to_string())));
    }

    #[test]
    fn test_offset_rejects_negative() {
        assert_eq!(to_offset(-1), Err(EINVAL));
        assert_eq!(to_offset(4096), Ok(4096));
    }

    #[test]
    fn test_listing_does_not_grow_inode_table() {
        let (dir, adapter) = adapter();
        for i in 0..2000 {
            std::fs::write(dir.path().join(format!("f{}", i)), b"x").unwrap();
        }

        for _ in 0..3 {
            let entries = adapter.dir_entries(ROOT_INO).unwrap();
            assert_eq!(entries.len(), 2002);
        }
        assert_eq!(adapter.inodes.len(), 1);
    }

    #[test]
    fn test_listing_reuses_looked_up_numbers() {
        let (dir, adapter) = adapter();
        std::fs::write(dir.path().join("seen"), b"x").unwrap();
        std::fs::write(dir.path().join("unseen"), b"y").unwrap();
        let seen = adapter.entry(Path::new("/seen")).unwrap().ino;

        let entries = adapter.dir_entries(ROOT_INO).unwrap();
        assert_eq!(entries[0], (ROOT_INO, FileType::Directory, OsString::from(".")));
        assert_eq!(entries[1], (ROOT_INO, FileType::Directory, OsString::from("..")));
        let ino_of = |name: &str| {
            entries
                .iter()
                .find(|(_, _, n)| n == name)
                .map(|(ino, _, _)| *ino)
                .unwrap()
        };
        assert_eq!(ino_of("seen"), seen);
        let unseen = std::os::unix::fs::MetadataExt::ino(
            &std::fs::metadata(dir.path().join("unseen")).unwrap(),
        );
        assert_eq!(ino_of("unseen"), unseen);
        assert_eq!(adapter.inodes.len(), 2);
    }

    #[test]
    fn test_setattr_keeps_callers_inode() {
        let (dir, adapter) = adapter();
        std::fs::write(dir.path().join("f"), b"hello").unwrap();

        let attr = adapter
            .apply_setattr(42, Path::new("/f"), Some(0o600), None, None, None, None, None)
            .unwrap();
        assert_eq!(attr.ino, 42);
        assert_eq!(attr.perm, 0o600);
        assert_eq!(adapter.inodes.len(), 1);
    }
}
