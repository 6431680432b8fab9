//! Mount session
//!
//! The process-wide state of one mount: where the backing store lives and
//! which key seals it. Built once before mounting and shared read-only with
//! every operation handler.

use crate::config::Config;
use crate::crypto::MasterKey;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::info;

/// Immutable per-mount state
#[derive(Debug)]
pub struct MountSession {
    backing_dir: PathBuf,
    key: MasterKey,
    debug: bool,
}

impl MountSession {
    /// Resolve the backing directory and derive the master key
    pub fn new(backing_dir: &Path, passphrase: &str, config: &Config) -> Result<Self> {
        let backing_dir = canonical_dir(backing_dir)?;
        let key = MasterKey::derive(passphrase.as_bytes(), &config.encryption)?;
        info!(
            "Session ready: backing={:?} key_id={}",
            backing_dir,
            hex::encode(key.key_id())
        );
        Ok(Self::with_key(backing_dir, key, config.debug))
    }

    /// Build a session from an already derived key.
    ///
    /// `backing_dir` is taken as is; callers are expected to pass an
    /// absolute path.
    pub fn with_key(backing_dir: PathBuf, key: MasterKey, debug: bool) -> Self {
        Self {
            backing_dir,
            key,
            debug,
        }
    }

    pub fn backing_dir(&self) -> &Path {
        &self.backing_dir
    }

    pub fn key(&self) -> &MasterKey {
        &self.key
    }

    pub fn debug(&self) -> bool {
        self.debug
    }
}

/// Canonicalize a directory given on the command line
pub fn canonical_dir(path: &Path) -> Result<PathBuf> {
    let resolved = std::fs::canonicalize(path)
        .map_err(|_| Error::PathNotFound(path.to_string_lossy().to_string()))?;
    if !resolved.is_dir() {
        return Err(Error::InvalidPath(format!(
            "{} is not a directory",
            resolved.display()
        )));
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::kdf::tests::test_config;
    use tempfile::tempdir;

    fn test_app_config() -> Config {
        Config {
            encryption: test_config(),
            ..Config::default()
        }
    }

    #[test]
    fn test_session_resolves_backing_dir() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("store");
        std::fs::create_dir(&nested).unwrap();

        let relative = nested.join("..").join("store");
        let session = MountSession::new(&relative, "hunter2", &test_app_config()).unwrap();
        assert_eq!(session.backing_dir(), nested.canonicalize().unwrap());
        assert!(!session.debug());
    }

    #[test]
    fn test_missing_backing_dir_is_fatal() {
        let dir = tempdir().unwrap();
        let err = MountSession::new(&dir.path().join("nope"), "hunter2", &test_app_config())
            .unwrap_err();
        assert!(matches!(err, Error::PathNotFound(_)));
    }

    #[test]
    fn test_file_as_backing_dir_rejected() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, b"x").unwrap();

        let err = MountSession::new(&file, "hunter2", &test_app_config()).unwrap_err();
        assert!(matches!(err, Error::InvalidPath(_)));
    }

    #[test]
    fn test_same_passphrase_same_key() {
        let dir = tempdir().unwrap();
        let config = test_app_config();
        let a = MountSession::new(dir.path(), "hunter2", &config).unwrap();
        let b = MountSession::new(dir.path(), "hunter2", &config).unwrap();
        assert_eq!(a.key().key_id(), b.key().key_id());
    }
}
