//! Configuration management for sealfs
//!
//! Everything here is read once at startup. The passphrase is never part of
//! the configuration; it is supplied on the command line or prompted for.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default Argon2 memory cost: 64 MiB
pub const DEFAULT_ARGON2_MEMORY_KIB: u32 = 64 * 1024;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Encryption configuration
    pub encryption: EncryptionConfig,

    /// Mount configuration
    pub mount: MountConfig,

    /// Log every operation at debug level
    pub debug: bool,
}

/// Encryption configuration
///
/// These parameters determine the master key. Mounting a backing store with
/// different values than it was populated with makes every sealed file
/// unreadable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Argon2 memory cost in KiB
    pub argon2_memory_kib: u32,

    /// Argon2 time cost (iterations)
    pub argon2_iterations: u32,

    /// Argon2 parallelism
    pub argon2_parallelism: u32,
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Filesystem name shown in the mount table
    pub fsname: String,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Allow root to access the mount
    pub allow_root: bool,

    /// Unmount automatically when the process exits
    pub auto_unmount: bool,

    /// Extra options handed verbatim to the FUSE runtime
    pub options: Vec<String>,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        EncryptionConfig {
            argon2_memory_kib: DEFAULT_ARGON2_MEMORY_KIB,
            argon2_iterations: 3,
            argon2_parallelism: 4,
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            fsname: "sealfs".to_string(),
            allow_other: false,
            allow_root: false,
            auto_unmount: true,
            options: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise start from defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            return Self::load(path);
        }

        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Default config file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sealfs")
            .join("config.json")
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Some(debug) = env_flag("SEALFS_DEBUG") {
            self.debug = debug;
        }

        if let Some(allow_other) = env_flag("SEALFS_ALLOW_OTHER") {
            self.mount.allow_other = allow_other;
        }

        if let Ok(memory) = std::env::var("SEALFS_ARGON2_MEMORY_KIB") {
            if let Ok(kib) = memory.trim().parse::<u32>() {
                self.encryption.argon2_memory_kib = kib;
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let enc = &self.encryption;
        if enc.argon2_memory_kib == 0 || enc.argon2_iterations == 0 || enc.argon2_parallelism == 0
        {
            return Err(Error::InvalidConfig(
                "Argon2 costs must be greater than 0".to_string(),
            ));
        }

        if self.mount.allow_other && self.mount.allow_root {
            return Err(Error::InvalidConfig(
                "allow_other and allow_root are mutually exclusive".to_string(),
            ));
        }

        if self.mount.fsname.is_empty() {
            return Err(Error::InvalidConfig(
                "Filesystem name must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
