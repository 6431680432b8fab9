//! Error types for sealfs

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using the sealfs error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the sealfs core
#[derive(Debug, Error)]
pub enum Error {
    /// Backing or staging stream I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A backing path could not be constructed
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// Sealed stream header is missing, truncated or of an unknown version
    #[error("Invalid sealed stream: {0}")]
    Format(String),

    /// The stream was sealed under a different master key
    #[error("Sealed stream key id {found} does not match mount key id {expected}")]
    KeyMismatch { expected: String, found: String },

    /// Marker attribute could not be read or written
    #[error("Attribute error on {path:?}: {source}")]
    Attribute {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map to the errno reported back through FUSE.
    ///
    /// Crypto failures have no errno of their own and surface as `EIO`.
    pub fn errno(&self) -> libc::c_int {
        match self {
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::Attribute { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
            Error::InvalidPath(_) => libc::EINVAL,
            Error::PathNotFound(_) => libc::ENOENT,
            Error::KeyDerivation(_)
            | Error::Encryption(_)
            | Error::Decryption(_)
            | Error::Format(_)
            | Error::KeyMismatch { .. } => libc::EIO,
            Error::Config(_) | Error::InvalidConfig(_) | Error::Internal(_) => libc::EIO,
        }
    }

    /// Whether this error came out of the cipher layer
    pub fn is_crypto(&self) -> bool {
        matches!(
            self,
            Error::KeyDerivation(_)
                | Error::Encryption(_)
                | Error::Decryption(_)
                | Error::Format(_)
                | Error::KeyMismatch { .. }
        )
    }
}
