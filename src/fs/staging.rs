//! Staged content access
//!
//! The cipher works on whole streams while clients read and write byte
//! ranges, so every content call materializes the full plaintext of the
//! backing file into an anonymous temporary file, works on that, and for
//! mutations reseals the result. Nothing is cached between calls.
//!
//! A mutation reseals into a second staging file first and only then
//! overwrites the backing file, so a cipher failure never leaves the
//! backing file half transformed.

use crate::crypto::{transform, Action, MasterKey};
use crate::error::Result;
use crate::fs::marker;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use tracing::debug;

/// Action that turns the backing bytes at `path` into plaintext
pub fn action_for(path: &Path) -> Action {
    if marker::is_encrypted(path) {
        Action::Decrypt
    } else {
        Action::PassThrough
    }
}

/// Read up to `size` plaintext bytes starting at `offset`
pub fn read(path: &Path, offset: u64, size: usize, key: &MasterKey) -> Result<Vec<u8>> {
    let mut backing = File::open(path)?;
    let action = action_for(path);

    let mut staging = materialize(&mut backing, action, key)?;
    staging.seek(SeekFrom::Start(offset))?;

    let mut buf = Vec::with_capacity(size);
    staging.take(size as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

/// Write `data` at `offset`, resealing the whole file.
///
/// Writing past the end zero-fills the gap.
pub fn write(path: &Path, offset: u64, data: &[u8], key: &MasterKey) -> Result<usize> {
    let mut backing = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    let action = action_for(path);

    let mut staging = materialize(&mut backing, action, key)?;
    staging.seek(SeekFrom::Start(offset))?;
    staging.write_all(data)?;

    reseal(&mut backing, &mut staging, action.inverse(), key)?;
    Ok(data.len())
}

/// Resize the plaintext of a sealed file to `size`, resealing it
pub fn truncate(path: &Path, size: u64, key: &MasterKey) -> Result<()> {
    let mut backing = OpenOptions::new().read(true).write(true).open(path)?;
    let action = action_for(path);

    let mut staging = materialize(&mut backing, action, key)?;
    staging.set_len(size)?;

    reseal(&mut backing, &mut staging, action.inverse(), key)
}

/// Create an empty file and seal it.
///
/// The file is marked only after sealing succeeded. If sealing fails the
/// error is returned and the file stays an unmarked empty file. If marking
/// fails the sealed bytes are dropped again so the unmarked file is a
/// consistent empty plaintext file, and the marker error is returned.
pub fn create(path: &Path, mode: u32, key: &MasterKey) -> Result<()> {
    let mut backing = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode & 0o7777)
        .open(path)?;

    let mut staging = materialize(&mut backing, Action::PassThrough, key)?;
    reseal(&mut backing, &mut staging, Action::Encrypt, key)?;

    if let Err(e) = marker::mark_encrypted(path) {
        backing.set_len(0)?;
        return Err(e);
    }
    Ok(())
}

/// Transform the whole backing stream into a fresh staging file
fn materialize(backing: &mut File, action: Action, key: &MasterKey) -> Result<File> {
    backing.seek(SeekFrom::Start(0))?;
    let mut staging = tempfile::tempfile()?;
    let produced = transform(backing, &mut staging, action, key)?;
    debug!("Materialized {} bytes ({:?})", produced, action);
    Ok(staging)
}

/// Transform `staging` into its on-disk form and commit it to `backing`
fn reseal(backing: &mut File, staging: &mut File, action: Action, key: &MasterKey) -> Result<()> {
    staging.seek(SeekFrom::Start(0))?;
    let mut sealed = tempfile::tempfile()?;
    transform(staging, &mut sealed, action, key)?;

    // Overwrite in place and cut the tail last; the old bytes stay intact
    // until the copy reaches them.
    sealed.seek(SeekFrom::Start(0))?;
    backing.seek(SeekFrom::Start(0))?;
    let written = io::copy(&mut sealed, backing)?;
    backing.set_len(written)?;
    backing.flush()?;
    debug!("Committed {} bytes ({:?})", written, action);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::stream::{HEADER_SIZE, TAG_SIZE};
    use crate::crypto::{decrypt_stream, plaintext_len, KEY_SIZE};
    use crate::error::Error;
    use std::io::Cursor;
    use tempfile::tempdir;
    use zeroize::Zeroizing;

    fn key() -> MasterKey {
        MasterKey::from_bytes(Zeroizing::new([0x11u8; KEY_SIZE]))
    }

    fn other_key() -> MasterKey {
        MasterKey::from_bytes(Zeroizing::new([0x22u8; KEY_SIZE]))
    }

    fn open_sealed(path: &Path, key: &MasterKey) -> Vec<u8> {
        let raw = std::fs::read(path).unwrap();
        let mut out = Vec::new();
        decrypt_stream(&mut Cursor::new(raw), &mut out, key).unwrap();
        out
    }

    #[test]
    fn test_plaintext_read_is_verbatim() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("b.txt");
        std::fs::write(&file, b"plain old bytes").unwrap();

        assert_eq!(read(&file, 0, 100, &key()).unwrap(), b"plain old bytes");
        assert_eq!(read(&file, 6, 3, &key()).unwrap(), b"old");
        assert!(read(&file, 100, 10, &key()).unwrap().is_empty());
    }

    #[test]
    fn test_plaintext_write_is_verbatim() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("b.txt");
        std::fs::write(&file, b"hello world").unwrap();

        assert_eq!(write(&file, 6, b"there", &key()).unwrap(), 5);
        assert_eq!(std::fs::read(&file).unwrap(), b"hello there");

        // Past the end: zero-filled gap
        write(&file, 13, b"!", &key()).unwrap();
        assert_eq!(std::fs::read(&file).unwrap(), b"hello there\0\0!");
    }

    #[test]
    fn test_create_seals_and_marks() {
        let dir = tempdir().unwrap();
        if !marker::supported_or_skip(dir.path()) {
            return;
        }
        let file = dir.path().join("a.txt");
        let key = key();

        create(&file, 0o644, &key).unwrap();
        assert!(marker::is_encrypted(&file));
        let raw = std::fs::read(&file).unwrap();
        assert_eq!(raw.len(), HEADER_SIZE + TAG_SIZE);
        assert!(open_sealed(&file, &key).is_empty());
    }

    #[test]
    fn test_sealed_write_then_read() {
        let dir = tempdir().unwrap();
        if !marker::supported_or_skip(dir.path()) {
            return;
        }
        let file = dir.path().join("a.txt");
        let key = key();
        create(&file, 0o600, &key).unwrap();

        write(&file, 0, b"hello", &key).unwrap();
        assert_eq!(read(&file, 0, 5, &key).unwrap(), b"hello");
        assert_ne!(std::fs::read(&file).unwrap(), b"hello");

        write(&file, 5, b", world", &key).unwrap();
        write(&file, 0, b"J", &key).unwrap();
        assert_eq!(read(&file, 0, 64, &key).unwrap(), b"Jello, world");
        assert_eq!(open_sealed(&file, &key), b"Jello, world");
        assert!(marker::is_encrypted(&file));

        let sealed_len = std::fs::metadata(&file).unwrap().len();
        assert_eq!(plaintext_len(sealed_len), Some(12));
    }

    #[test]
    fn test_failed_write_leaves_backing_untouched() {
        let dir = tempdir().unwrap();
        if !marker::supported_or_skip(dir.path()) {
            return;
        }
        let file = dir.path().join("a.txt");
        create(&file, 0o600, &key()).unwrap();
        write(&file, 0, b"committed", &key()).unwrap();
        let before = std::fs::read(&file).unwrap();

        let err = write(&file, 0, b"clobber", &other_key()).unwrap_err();
        assert!(err.is_crypto());
        assert_eq!(std::fs::read(&file).unwrap(), before);

        let err = read(&file, 0, 10, &other_key()).unwrap_err();
        assert_eq!(err.errno(), libc::EIO);
    }

    #[test]
    fn test_sealed_truncate() {
        let dir = tempdir().unwrap();
        if !marker::supported_or_skip(dir.path()) {
            return;
        }
        let file = dir.path().join("a.txt");
        let key = key();
        create(&file, 0o600, &key).unwrap();
        write(&file, 0, b"0123456789", &key).unwrap();

        truncate(&file, 4, &key).unwrap();
        assert_eq!(read(&file, 0, 100, &key).unwrap(), b"0123");

        truncate(&file, 6, &key).unwrap();
        assert_eq!(read(&file, 0, 100, &key).unwrap(), b"0123\0\0");

        truncate(&file, 0, &key).unwrap();
        assert!(read(&file, 0, 100, &key).unwrap().is_empty());
        assert!(marker::is_encrypted(&file));
    }

    #[test]
    fn test_shrinking_reseal_cuts_old_tail() {
        let dir = tempdir().unwrap();
        if !marker::supported_or_skip(dir.path()) {
            return;
        }
        let file = dir.path().join("a.txt");
        let key = key();
        create(&file, 0o600, &key).unwrap();
        let data = vec![0x5au8; 200_000];
        write(&file, 0, &data, &key).unwrap();
        let long_len = std::fs::metadata(&file).unwrap().len();

        truncate(&file, 3, &key).unwrap();
        let short_len = std::fs::metadata(&file).unwrap().len();
        assert!(short_len < long_len);
        assert_eq!(short_len, (HEADER_SIZE + TAG_SIZE + 3) as u64);
        assert_eq!(open_sealed(&file, &key), b"ZZZ");
    }

    #[test]
    fn test_shrinking_plaintext_truncate() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("b.txt");
        std::fs::write(&file, b"0123456789").unwrap();

        truncate(&file, 4, &key()).unwrap();
        assert_eq!(std::fs::read(&file).unwrap(), b"0123");
    }

    #[test]
    fn test_failed_commit_keeps_old_bytes() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("b.txt");
        std::fs::write(&file, b"original content").unwrap();

        let mut backing = File::open(&file).unwrap();
        let mut staging = tempfile::tempfile().unwrap();
        staging.write_all(b"new").unwrap();
        assert!(reseal(&mut backing, &mut staging, Action::PassThrough, &key()).is_err());
        assert_eq!(std::fs::read(&file).unwrap(), b"original content");
    }

    #[test]
    fn test_create_marker_failure_leaves_empty_plaintext() {
        let dir = tempdir().unwrap();
        if !marker::supported_or_skip(dir.path()) {
            return;
        }
        // User xattrs cannot be set on the link itself, but opening it
        // creates the target.
        let target = dir.path().join("target");
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let err = create(&link, 0o644, &key()).unwrap_err();
        assert!(matches!(err, Error::Attribute { .. }), "{:?}", err);
        assert_eq!(std::fs::metadata(&target).unwrap().len(), 0);
        assert!(!marker::is_encrypted(&target));
        assert_eq!(action_for(&target), Action::PassThrough);
    }

    #[test]
    fn test_large_sealed_file_round_trip() {
        let dir = tempdir().unwrap();
        if !marker::supported_or_skip(dir.path()) {
            return;
        }
        let file = dir.path().join("big.bin");
        let key = key();
        create(&file, 0o600, &key).unwrap();

        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();
        write(&file, 0, &data, &key).unwrap();

        let middle = read(&file, 131_000, 4096, &key).unwrap();
        assert_eq!(middle, &data[131_000..131_000 + 4096]);
        assert_eq!(read(&file, 0, data.len() + 10, &key).unwrap(), data);
    }

    #[test]
    fn test_read_missing_file_is_enoent() {
        let dir = tempdir().unwrap();
        let err = read(&dir.path().join("absent"), 0, 1, &key()).unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
    }
}
