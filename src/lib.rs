//! sealfs - Transparent encrypting overlay filesystem
//!
//! Mirrors a backing directory at a mount point. Files created through the
//! mount are stored sealed (AES-256-GCM, key derived from the mount
//! passphrase) and tagged with the `user.encfs` extended attribute; files
//! without the tag pass through untouched.

pub mod config;
pub mod crypto;
pub mod error;
pub mod fs;
pub mod session;

pub use config::Config;
pub use error::{Error, Result};
pub use session::MountSession;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::fs::{Operations, SealFs};
    pub use crate::session::MountSession;
}
