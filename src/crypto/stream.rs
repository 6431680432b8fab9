//! Sealed stream format
//!
//! A sealed stream is a fixed header followed by AES-256-GCM segments:
//!
//! ```text
//! magic "SEAL" | version | key_id (8) | salt (16) | nonce_prefix (7)
//! segment 0 | segment 1 | ... | final segment
//! ```
//!
//! Each segment seals up to [`SEGMENT_SIZE`] plaintext bytes and carries a
//! 16 byte tag. The nonce is `nonce_prefix || counter (u32 BE) || last`, so
//! reordering, truncation and appended garbage all fail authentication.
//! The header bytes are the associated data of every segment.

use crate::crypto::kdf::{generate_salt, MasterKey};
use crate::crypto::{KEY_ID_SIZE, SALT_SIZE};
use crate::error::{Error, Result};
use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, NONCE_LEN};
use std::io::{self, Read, Write};

/// Stream magic bytes
pub const MAGIC: [u8; 4] = *b"SEAL";

/// Current format version
pub const VERSION: u8 = 1;

/// Plaintext bytes per segment
pub const SEGMENT_SIZE: usize = 64 * 1024;

/// AES-GCM tag length
pub const TAG_SIZE: usize = 16;

const NONCE_PREFIX_SIZE: usize = NONCE_LEN - 5;

/// Header length in bytes
pub const HEADER_SIZE: usize = MAGIC.len() + 1 + KEY_ID_SIZE + SALT_SIZE + NONCE_PREFIX_SIZE;

/// Parsed stream header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    pub version: u8,
    pub key_id: [u8; KEY_ID_SIZE],
    pub salt: [u8; SALT_SIZE],
    pub nonce_prefix: [u8; NONCE_PREFIX_SIZE],
}

impl StreamHeader {
    /// Fresh header for sealing under `key`
    pub fn generate(key: &MasterKey) -> Self {
        let mut nonce_prefix = [0u8; NONCE_PREFIX_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_prefix);
        Self {
            version: VERSION,
            key_id: *key.key_id(),
            salt: generate_salt(),
            nonce_prefix,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        let mut pos = 0;
        out[pos..pos + MAGIC.len()].copy_from_slice(&MAGIC);
        pos += MAGIC.len();
        out[pos] = self.version;
        pos += 1;
        out[pos..pos + KEY_ID_SIZE].copy_from_slice(&self.key_id);
        pos += KEY_ID_SIZE;
        out[pos..pos + SALT_SIZE].copy_from_slice(&self.salt);
        pos += SALT_SIZE;
        out[pos..].copy_from_slice(&self.nonce_prefix);
        out
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Result<Self> {
        if bytes[..MAGIC.len()] != MAGIC {
            return Err(Error::Format("bad magic".to_string()));
        }
        let mut pos = MAGIC.len();
        let version = bytes[pos];
        if version != VERSION {
            return Err(Error::Format(format!("unsupported version {}", version)));
        }
        pos += 1;

        let mut key_id = [0u8; KEY_ID_SIZE];
        key_id.copy_from_slice(&bytes[pos..pos + KEY_ID_SIZE]);
        pos += KEY_ID_SIZE;
        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&bytes[pos..pos + SALT_SIZE]);
        pos += SALT_SIZE;
        let mut nonce_prefix = [0u8; NONCE_PREFIX_SIZE];
        nonce_prefix.copy_from_slice(&bytes[pos..]);

        Ok(Self {
            version,
            key_id,
            salt,
            nonce_prefix,
        })
    }

    /// Read and parse a header from the front of a stream
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut bytes = [0u8; HEADER_SIZE];
        let n = read_full(reader, &mut bytes)?;
        if n < HEADER_SIZE {
            return Err(Error::Format(format!(
                "header truncated: {} of {} bytes",
                n, HEADER_SIZE
            )));
        }
        Self::from_bytes(&bytes)
    }

    fn nonce(&self, counter: u32, last: bool) -> Nonce {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..NONCE_PREFIX_SIZE].copy_from_slice(&self.nonce_prefix);
        nonce[NONCE_PREFIX_SIZE..NONCE_LEN - 1].copy_from_slice(&counter.to_be_bytes());
        nonce[NONCE_LEN - 1] = last as u8;
        Nonce::assume_unique_for_key(nonce)
    }
}

/// Seal everything `reader` yields into `writer`.
///
/// Returns the number of plaintext bytes consumed.
pub fn encrypt_stream<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    key: &MasterKey,
) -> Result<u64> {
    let header = StreamHeader::generate(key);
    let aad = header.to_bytes();
    let file_key = key.file_key(&header.salt)?;
    writer.write_all(&aad)?;

    let mut current = vec![0u8; SEGMENT_SIZE];
    let mut next = vec![0u8; SEGMENT_SIZE];
    let mut current_len = read_full(reader, &mut current)?;
    let mut counter: u32 = 0;
    let mut total = 0u64;

    loop {
        // Read ahead so the final segment can be flagged.
        let next_len = if current_len == SEGMENT_SIZE {
            read_full(reader, &mut next)?
        } else {
            0
        };
        let last = next_len == 0;

        let mut segment = current[..current_len].to_vec();
        file_key
            .seal_in_place_append_tag(
                header.nonce(counter, last),
                Aad::from(&aad[..]),
                &mut segment,
            )
            .map_err(|_| Error::Encryption(format!("sealing segment {} failed", counter)))?;
        writer.write_all(&segment)?;
        total += current_len as u64;

        if last {
            break;
        }
        counter = counter
            .checked_add(1)
            .ok_or_else(|| Error::Encryption("segment counter overflow".to_string()))?;
        std::mem::swap(&mut current, &mut next);
        current_len = next_len;
    }

    writer.flush()?;
    Ok(total)
}

/// Open a sealed stream from `reader`, writing plaintext into `writer`.
///
/// Returns the number of plaintext bytes produced.
pub fn decrypt_stream<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    key: &MasterKey,
) -> Result<u64> {
    let header = StreamHeader::read_from(reader)?;
    if &header.key_id != key.key_id() {
        return Err(Error::KeyMismatch {
            expected: hex::encode(key.key_id()),
            found: hex::encode(header.key_id),
        });
    }
    let aad = header.to_bytes();
    let file_key = key.file_key(&header.salt)?;

    const SEALED_SEGMENT: usize = SEGMENT_SIZE + TAG_SIZE;
    let mut current = vec![0u8; SEALED_SEGMENT];
    let mut next = vec![0u8; SEALED_SEGMENT];
    let mut current_len = read_full(reader, &mut current)?;
    let mut counter: u32 = 0;
    let mut total = 0u64;

    loop {
        if current_len < TAG_SIZE {
            return Err(Error::Decryption(format!(
                "segment {} truncated to {} bytes",
                counter, current_len
            )));
        }
        let next_len = if current_len == SEALED_SEGMENT {
            read_full(reader, &mut next)?
        } else {
            0
        };
        let last = next_len == 0;

        let plaintext = open_segment(
            &file_key,
            &header,
            &aad,
            counter,
            last,
            &mut current[..current_len],
        )?;
        writer.write_all(plaintext)?;
        total += plaintext.len() as u64;

        if last {
            break;
        }
        counter = counter
            .checked_add(1)
            .ok_or_else(|| Error::Decryption("segment counter overflow".to_string()))?;
        std::mem::swap(&mut current, &mut next);
        current_len = next_len;
    }

    writer.flush()?;
    Ok(total)
}

fn open_segment<'a>(
    file_key: &LessSafeKey,
    header: &StreamHeader,
    aad: &[u8],
    counter: u32,
    last: bool,
    sealed: &'a mut [u8],
) -> Result<&'a [u8]> {
    let plaintext = file_key
        .open_in_place(header.nonce(counter, last), Aad::from(aad), sealed)
        .map_err(|_| Error::Decryption(format!("segment {} failed authentication", counter)))?;
    Ok(&*plaintext)
}

/// Plaintext length of a sealed stream of `sealed_len` bytes, or `None` if
/// no well-formed stream has that length.
pub fn plaintext_len(sealed_len: u64) -> Option<u64> {
    let body = sealed_len.checked_sub(HEADER_SIZE as u64)?;
    let sealed_segment = (SEGMENT_SIZE + TAG_SIZE) as u64;
    let full = body / sealed_segment;
    let rest = body % sealed_segment;

    if rest == 0 {
        // Only full segments; the last one is a full segment itself.
        if full == 0 {
            return None;
        }
        return Some(full * SEGMENT_SIZE as u64);
    }
    if rest < TAG_SIZE as u64 {
        return None;
    }
    Some(full * SEGMENT_SIZE as u64 + rest - TAG_SIZE as u64)
}

/// Fill `buf` as far as the reader allows, retrying on interrupts.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::kdf::tests::test_config;
    use std::io::Cursor;
    use zeroize::Zeroizing;

    fn key() -> MasterKey {
        MasterKey::from_bytes(Zeroizing::new([0x42u8; 32]))
    }

    fn seal(data: &[u8], key: &MasterKey) -> Vec<u8> {
        let mut out = Vec::new();
        encrypt_stream(&mut Cursor::new(data), &mut out, key).unwrap();
        out
    }

    fn open(data: &[u8], key: &MasterKey) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        decrypt_stream(&mut Cursor::new(data), &mut out, key)?;
        Ok(out)
    }

    #[test]
    fn test_round_trip_lengths() {
        let key = key();
        for len in [
            0,
            1,
            5,
            SEGMENT_SIZE - 1,
            SEGMENT_SIZE,
            SEGMENT_SIZE + 1,
            3 * SEGMENT_SIZE + 17,
        ] {
            let data: Vec<u8> = (0..len).map(|i| (i * 31 + 7) as u8).collect();
            let sealed = seal(&data, &key);
            assert_eq!(open(&sealed, &key).unwrap(), data, "length {}", len);
            assert_eq!(plaintext_len(sealed.len() as u64), Some(len as u64));
        }
    }

    #[test]
    fn test_empty_stream_is_header_and_tag() {
        let sealed = seal(b"", &key());
        assert_eq!(sealed.len(), HEADER_SIZE + TAG_SIZE);
        assert_eq!(&sealed[..4], b"SEAL");
    }

    #[test]
    fn test_ciphertext_differs_from_plaintext() {
        let key = key();
        let sealed = seal(b"hello", &key);
        assert!(!sealed.windows(5).any(|w| w == b"hello"));

        // Fresh salt and nonce on every seal
        assert_ne!(seal(b"hello", &key), sealed);
    }

    #[test]
    fn test_wrong_key_rejected() {
        let sealed = seal(b"secret", &key());
        let config = test_config();
        let other = MasterKey::derive(b"not the key", &config).unwrap();

        let err = open(&sealed, &other).unwrap_err();
        assert!(matches!(err, Error::KeyMismatch { .. }));
    }

    #[test]
    fn test_truncation_detected() {
        let key = key();
        let data = vec![9u8; 2 * SEGMENT_SIZE + 100];
        let sealed = seal(&data, &key);

        // Drop the final partial segment: the previous one is not flagged last.
        let cut = HEADER_SIZE + 2 * (SEGMENT_SIZE + TAG_SIZE);
        assert!(open(&sealed[..cut], &key).is_err());

        // Header only
        assert!(open(&sealed[..HEADER_SIZE], &key).is_err());

        // Short header
        let err = open(&sealed[..10], &key).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn test_tampering_detected() {
        let key = key();
        let mut sealed = seal(b"attack at dawn", &key);
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(open(&sealed, &key), Err(Error::Decryption(_))));

        let mut sealed = seal(b"attack at dawn", &key);
        sealed[MAGIC.len() + 1 + KEY_ID_SIZE] ^= 0x01; // salt byte
        assert!(open(&sealed, &key).is_err());
    }

    #[test]
    fn test_bad_magic_and_version() {
        let key = key();
        let mut sealed = seal(b"x", &key);
        sealed[0] = b'X';
        assert!(matches!(open(&sealed, &key), Err(Error::Format(_))));

        let mut sealed = seal(b"x", &key);
        sealed[MAGIC.len()] = 9;
        assert!(matches!(open(&sealed, &key), Err(Error::Format(_))));
    }

    #[test]
    fn test_header_round_trip() {
        let header = StreamHeader::generate(&key());
        let parsed = StreamHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_plaintext_len_rejects_malformed() {
        assert_eq!(plaintext_len(0), None);
        assert_eq!(plaintext_len(HEADER_SIZE as u64), None);
        assert_eq!(plaintext_len((HEADER_SIZE + TAG_SIZE - 1) as u64), None);
        assert_eq!(plaintext_len((HEADER_SIZE + TAG_SIZE) as u64), Some(0));
    }
}
