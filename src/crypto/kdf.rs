//! Key derivation
//!
//! The mount passphrase is stretched once with Argon2id into a master key.
//! Each sealed stream then derives its own AES-256-GCM key from the master
//! key and the random salt carried in the stream header (HKDF-SHA256), so
//! the expensive step runs at mount time rather than on every read/write.

use crate::config::EncryptionConfig;
use crate::crypto::{KEY_ID_SIZE, KEY_SIZE, SALT_SIZE};
use crate::error::{Error, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use ring::aead::{self, LessSafeKey, UnboundKey};
use ring::{hkdf, hmac};
use zeroize::Zeroizing;

/// Argon2 salt for the mount key. There is no key file to keep a random
/// salt in, so the salt is a fixed domain separator.
const MOUNT_SALT: [u8; SALT_SIZE] = *b"sealfs.mount.v1\0";

const FILE_KEY_INFO: &[u8] = b"sealfs file key";
const KEY_ID_INFO: &[u8] = b"sealfs key id";

/// Passphrase-derived master key
#[derive(Clone)]
pub struct MasterKey {
    /// The derived key material (zeroized on drop)
    key: Zeroizing<[u8; KEY_SIZE]>,
    /// Short fingerprint written into every stream header
    key_id: [u8; KEY_ID_SIZE],
}

impl MasterKey {
    /// Derive the master key from a passphrase using Argon2id
    pub fn derive(passphrase: &[u8], config: &EncryptionConfig) -> Result<Self> {
        let params = Params::new(
            config.argon2_memory_kib,
            config.argon2_iterations,
            config.argon2_parallelism,
            Some(KEY_SIZE),
        )
        .map_err(|e| Error::KeyDerivation(format!("Invalid Argon2 parameters: {}", e)))?;

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key_bytes = Zeroizing::new([0u8; KEY_SIZE]);
        argon2
            .hash_password_into(passphrase, &MOUNT_SALT, key_bytes.as_mut())
            .map_err(|e| Error::KeyDerivation(format!("Key derivation failed: {}", e)))?;

        Ok(Self::from_bytes(key_bytes))
    }

    /// Build a master key from raw key material
    pub fn from_bytes(key: Zeroizing<[u8; KEY_SIZE]>) -> Self {
        let mac_key = hmac::Key::new(hmac::HMAC_SHA256, key.as_ref());
        let tag = hmac::sign(&mac_key, KEY_ID_INFO);
        let mut key_id = [0u8; KEY_ID_SIZE];
        key_id.copy_from_slice(&tag.as_ref()[..KEY_ID_SIZE]);

        Self { key, key_id }
    }

    /// Fingerprint identifying this key in stream headers
    pub fn key_id(&self) -> &[u8; KEY_ID_SIZE] {
        &self.key_id
    }

    /// Derive the AES-256-GCM key for one sealed stream
    pub fn file_key(&self, salt: &[u8; SALT_SIZE]) -> Result<LessSafeKey> {
        let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, salt).extract(self.key.as_ref());
        let info = [FILE_KEY_INFO];
        let okm = prk
            .expand(&info, &aead::AES_256_GCM)
            .map_err(|_| Error::KeyDerivation("HKDF expand failed".to_string()))?;
        Ok(LessSafeKey::new(UnboundKey::from(okm)))
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("key_id", &hex::encode(self.key_id))
            .finish_non_exhaustive()
    }
}

/// Generate a random per-stream salt
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_config() -> EncryptionConfig {
        EncryptionConfig {
            argon2_memory_kib: 1024, // Low for testing
            argon2_iterations: 1,
            argon2_parallelism: 1,
        }
    }

    #[test]
    fn test_derive_is_deterministic() {
        let config = test_config();
        let key1 = MasterKey::derive(b"hunter2", &config).unwrap();
        let key2 = MasterKey::derive(b"hunter2", &config).unwrap();

        assert_eq!(key1.key_id(), key2.key_id());
    }

    #[test]
    fn test_different_passphrases_different_keys() {
        let config = test_config();
        let key1 = MasterKey::derive(b"hunter2", &config).unwrap();
        let key2 = MasterKey::derive(b"hunter3", &config).unwrap();

        assert_ne!(key1.key_id(), key2.key_id());
    }

    #[test]
    fn test_argon2_params_change_key() {
        let mut config = test_config();
        let key1 = MasterKey::derive(b"hunter2", &config).unwrap();
        config.argon2_iterations = 2;
        let key2 = MasterKey::derive(b"hunter2", &config).unwrap();

        assert_ne!(key1.key_id(), key2.key_id());
    }

    #[test]
    fn test_invalid_params_rejected() {
        let mut config = test_config();
        config.argon2_iterations = 0;
        let err = MasterKey::derive(b"hunter2", &config).unwrap_err();
        assert!(matches!(err, Error::KeyDerivation(_)));
    }

    #[test]
    fn test_debug_hides_key_material() {
        let key = MasterKey::from_bytes(Zeroizing::new([7u8; KEY_SIZE]));
        let rendered = format!("{:?}", key);
        assert!(rendered.contains("key_id"));
        assert!(!rendered.contains("7, 7, 7"));
    }
}
