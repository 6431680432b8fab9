//! Inode table
//!
//! The kernel addresses entries by inode number while the dispatcher works
//! on virtual paths. This table hands out inode numbers for paths and keeps
//! both directions of the mapping.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Inode number of the mount root
pub const ROOT_INO: u64 = 1;

#[derive(Debug, Clone)]
struct InodeEntry {
    path: PathBuf,
    /// Kernel lookup count
    lookups: u64,
}

/// Path <-> inode number mapping
pub struct InodeTable {
    /// Next inode number
    next_ino: AtomicU64,
    /// ino -> entry
    inodes: RwLock<HashMap<u64, InodeEntry>>,
    /// Path -> ino
    path_to_ino: RwLock<HashMap<PathBuf, u64>>,
}

impl InodeTable {
    pub fn new() -> Self {
        let table = Self {
            next_ino: AtomicU64::new(ROOT_INO + 1),
            inodes: RwLock::new(HashMap::new()),
            path_to_ino: RwLock::new(HashMap::new()),
        };

        table.inodes.write().insert(
            ROOT_INO,
            InodeEntry {
                path: PathBuf::from("/"),
                lookups: 1,
            },
        );
        table.path_to_ino.write().insert(PathBuf::from("/"), ROOT_INO);
        table
    }

    /// Virtual path of an inode
    pub fn path(&self, ino: u64) -> Option<PathBuf> {
        self.inodes.read().get(&ino).map(|e| e.path.clone())
    }

    /// Inode number already assigned to `path`, without allocating
    pub fn existing(&self, path: &Path) -> Option<u64> {
        self.path_to_ino.read().get(path).copied()
    }

    /// Inode number for `path`, allocating one if needed
    pub fn ino_for(&self, path: &Path) -> u64 {
        if let Some(ino) = self.path_to_ino.read().get(path) {
            return *ino;
        }

        // Lock order: inodes, then path_to_ino
        let mut inodes = self.inodes.write();
        let mut path_to_ino = self.path_to_ino.write();
        // Raced with another allocation for the same path
        if let Some(ino) = path_to_ino.get(path) {
            return *ino;
        }
        let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
        path_to_ino.insert(path.to_path_buf(), ino);
        inodes.insert(
            ino,
            InodeEntry {
                path: path.to_path_buf(),
                lookups: 0,
            },
        );
        ino
    }

    /// Inode number for `path`, counting one kernel lookup
    pub fn lookup(&self, path: &Path) -> u64 {
        let ino = self.ino_for(path);
        if let Some(entry) = self.inodes.write().get_mut(&ino) {
            entry.lookups += 1;
        }
        ino
    }

    /// Drop `nlookup` kernel references; the entry goes away at zero
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let mut inodes = self.inodes.write();
        let Some(entry) = inodes.get_mut(&ino) else {
            return;
        };
        entry.lookups = entry.lookups.saturating_sub(nlookup);
        if entry.lookups == 0 {
            let path = entry.path.clone();
            inodes.remove(&ino);
            let mut path_to_ino = self.path_to_ino.write();
            if path_to_ino.get(&path) == Some(&ino) {
                path_to_ino.remove(&path);
            }
        }
    }

    /// Forget the path mapping of a removed entry.
    ///
    /// The inode itself stays until the kernel forgets it.
    pub fn unlink(&self, path: &Path) {
        self.path_to_ino.write().remove(path);
    }

    /// Move `from` and everything below it to `to`
    pub fn rename(&self, from: &Path, to: &Path) {
        let mut inodes = self.inodes.write();
        let mut path_to_ino = self.path_to_ino.write();

        path_to_ino.remove(to);
        let moved: Vec<(PathBuf, u64)> = path_to_ino
            .iter()
            .filter(|(path, _)| path.starts_with(from))
            .map(|(path, ino)| (path.clone(), *ino))
            .collect();

        for (old, ino) in moved {
            let suffix = old.strip_prefix(from).unwrap_or(Path::new(""));
            let new = if suffix.as_os_str().is_empty() {
                to.to_path_buf()
            } else {
                to.join(suffix)
            };
            path_to_ino.remove(&old);
            path_to_ino.insert(new.clone(), ino);
            if let Some(entry) = inodes.get_mut(&ino) {
                entry.path = new;
            }
        }
    }

    /// Number of live inodes
    pub fn len(&self) -> usize {
        self.inodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inodes.read().is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
