//! Encryption marker
//!
//! A backing file holds ciphertext iff its `user.encfs` extended attribute
//! is exactly `"true"`. The attribute and the sealed content together are
//! the whole persisted state; there is no index file.

use crate::error::{Error, Result};
use std::path::Path;
use tracing::debug;

/// Extended attribute carrying the marker
pub const MARKER_NAME: &str = "user.encfs";

/// Marker value for encrypted files
pub const MARKER_VALUE: &[u8] = b"true";

/// Whether the backing file at `path` is marked encrypted.
///
/// Failing to read the attribute (absent, unsupported, I/O) means "not
/// encrypted".
pub fn is_encrypted(path: &Path) -> bool {
    match xattr::get(path, MARKER_NAME) {
        Ok(Some(value)) => value == MARKER_VALUE,
        Ok(None) => false,
        Err(e) => {
            debug!("Marker unreadable on {:?}, treating as plaintext: {}", path, e);
            false
        }
    }
}

/// Mark the backing file at `path` as encrypted
pub fn mark_encrypted(path: &Path) -> Result<()> {
    xattr::set(path, MARKER_NAME, MARKER_VALUE).map_err(|source| Error::Attribute {
        path: path.to_path_buf(),
        source,
    })
}

/// Check whether the filesystem holding `dir` accepts user extended
/// attributes, using a scratch file that is removed again.
pub fn supported(dir: &Path) -> bool {
    let scratch = match tempfile::Builder::new()
        .prefix(".sealfs-xattr-check")
        .tempfile_in(dir)
    {
        Ok(file) => file,
        Err(e) => {
            debug!("Cannot create xattr scratch file in {:?}: {}", dir, e);
            return false;
        }
    };
    xattr::set(scratch.path(), MARKER_NAME, MARKER_VALUE).is_ok()
}

/// [`supported`], reporting on stderr when a test is skipped
#[cfg(test)]
pub(crate) fn supported_or_skip(dir: &Path) -> bool {
    let ok = supported(dir);
    if !ok {
        eprintln!("skipping: {:?} does not accept user xattrs", dir);
    }
    ok
}
