//! The password-protected master-key container
//!
//! A small JSON document at the root of the base directory:
//!
//! ```text
//! {
//!   "version": 2,
//!   "iterations": 400000,
//!   "salt": "<hex, 32 bytes>",
//!   "encrypted_key": { "IV": "<hex, 32>", "MAC": "<hex, 16>", "key": "<hex, 32>" },
//!   "block_size": 4096,        // version 2 only
//!   "iv_size": 12              // version 2 only
//! }
//! ```
//!
//! The master key is wrapped with AES-256-GCM under a key derived from the
//! password with PBKDF2-HMAC-SHA256. Version 1 containers imply block size
//! 4096 and IV size 32. Replacement is atomic: the new document is written
//! to a temp file in the same directory and renamed over the old one.

use std::fs;
use std::io::Write;
use std::path::Path;

use latchfs_core::{Error, Result};
use rand::RngCore;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use crate::gcm::GcmCipher;
use crate::kdf::{derive_wrapping_key, DEFAULT_PBKDF2_ROUNDS, SALT_SIZE};
use crate::keys::Key;
use crate::{KEY_SIZE, TAG_SIZE};

pub const CONTAINER_FILE_NAME: &str = ".securefs.json";
pub const CONTAINER_TMP_FILE_NAME: &str = ".securefs.json.tmp";

/// The container always wraps the master key with a 32-byte IV, regardless
/// of the per-block IV size of the filesystem.
const CONTAINER_IV_SIZE: usize = 32;

/// Associated data for the key wrap. Historical constant; the same string is
/// used for both format versions.
const KEY_WRAP_AAD: &[u8] = b"version=1";

pub const DEFAULT_BLOCK_SIZE: usize = 4096;
pub const DEFAULT_IV_SIZE: usize = 12;
const V1_BLOCK_SIZE: usize = 4096;
const V1_IV_SIZE: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedKey {
    #[serde(rename = "IV")]
    pub iv: String,
    #[serde(rename = "MAC")]
    pub mac: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyContainer {
    pub version: u32,
    pub iterations: u32,
    pub salt: String,
    pub encrypted_key: WrappedKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv_size: Option<u32>,
}

/// Per-filesystem stream parameters recovered from the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub block_size: usize,
    pub iv_size: usize,
}

/// Wrap `master_key` under `password` into a fresh container document.
///
/// `rounds == 0` selects the automatic setting. For version 2 the block and
/// IV sizes are recorded in the document; version 1 fixes them and ignores
/// the arguments.
pub fn generate(
    version: u32,
    master_key: &Key,
    password: &SecretString,
    rounds: u32,
    block_size: usize,
    iv_size: usize,
) -> Result<KeyContainer> {
    match version {
        1 => {}
        2 => {
            if !(12..=64).contains(&iv_size) || !GcmCipher::supported_iv_size(iv_size) {
                return Err(Error::InvalidArgument(format!("invalid IV size {iv_size}")));
            }
            if block_size == 0 {
                return Err(Error::InvalidArgument("block size must be positive".into()));
            }
        }
        v => return Err(Error::InvalidArgument(format!("unsupported format version {v}"))),
    }

    let rounds = if rounds == 0 { DEFAULT_PBKDF2_ROUNDS } else { rounds };

    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    let wrapping_key = derive_wrapping_key(password, &salt, rounds);
    let cipher = GcmCipher::new(&wrapping_key, CONTAINER_IV_SIZE)?;

    let mut iv = [0u8; CONTAINER_IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    // Holds the master key until seal() overwrites it with ciphertext.
    let mut wrapped = Zeroizing::new(master_key.as_bytes().to_vec());
    let tag = cipher.seal(&iv, KEY_WRAP_AAD, &mut wrapped)?;

    Ok(KeyContainer {
        version,
        iterations: rounds,
        salt: hex::encode(salt),
        encrypted_key: WrappedKey {
            iv: hex::encode(iv),
            mac: hex::encode(tag),
            key: hex::encode(&wrapped[..]),
        },
        block_size: (version == 2).then_some(block_size as u32),
        iv_size: (version == 2).then_some(iv_size as u32),
    })
}

/// Unwrap the master key.
///
/// Any integrity failure of the wrapped-key fields (wrong password, edited
/// hex, truncated ciphertext) comes back as [`Error::WrongPassword`]; the
/// caller cannot and should not tell them apart.
pub fn unlock(container: &KeyContainer, password: &SecretString) -> Result<(Key, StreamParams)> {
    let params = match container.version {
        1 => StreamParams { block_size: V1_BLOCK_SIZE, iv_size: V1_IV_SIZE },
        2 => StreamParams {
            block_size: require(container.block_size, "block_size")? as usize,
            iv_size: require(container.iv_size, "iv_size")? as usize,
        },
        v => return Err(Error::InvalidArgument(format!("unsupported format version {v}"))),
    };

    let salt: [u8; SALT_SIZE] = decode_exact(&container.salt)?;
    let iv: [u8; CONTAINER_IV_SIZE] = decode_exact(&container.encrypted_key.iv)?;
    let mac: [u8; TAG_SIZE] = decode_exact(&container.encrypted_key.mac)?;
    let mut key_buf: [u8; KEY_SIZE] = decode_exact(&container.encrypted_key.key)?;

    let wrapping_key = derive_wrapping_key(password, &salt, container.iterations);
    let cipher = GcmCipher::new(&wrapping_key, CONTAINER_IV_SIZE)?;

    if !cipher.open(&iv, KEY_WRAP_AAD, &mut key_buf, &mac) {
        key_buf.zeroize();
        return Err(Error::WrongPassword);
    }

    let master_key = Key::from_bytes(key_buf);
    key_buf.zeroize();
    Ok((master_key, params))
}

fn require(field: Option<u32>, name: &str) -> Result<u32> {
    field.ok_or_else(|| Error::InvalidArgument(format!("version 2 container is missing {name}")))
}

fn decode_exact<const N: usize>(hex_str: &str) -> Result<[u8; N]> {
    let bytes = hex::decode(hex_str).map_err(|_| Error::WrongPassword)?;
    bytes.try_into().map_err(|_| Error::WrongPassword)
}

/// Read and parse the container in `base_dir`.
pub fn load(base_dir: &Path) -> Result<KeyContainer> {
    let text = fs::read_to_string(base_dir.join(CONTAINER_FILE_NAME))?;
    serde_json::from_str(&text)
        .map_err(|e| Error::InvalidArgument(format!("malformed key container: {e}")))
}

/// Write a brand-new container, refusing to overwrite an existing one. A
/// half-written container is removed rather than left behind.
pub fn create_new(base_dir: &Path, container: &KeyContainer) -> Result<()> {
    let path = base_dir.join(CONTAINER_FILE_NAME);
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)?;
    if let Err(err) = file.write_all(render(container)?.as_bytes()) {
        let _ = fs::remove_file(&path);
        return Err(err.into());
    }
    Ok(())
}

/// Replace the container atomically: write the temp file, then rename it
/// over the live one.
pub fn save_atomic(base_dir: &Path, container: &KeyContainer) -> Result<()> {
    let tmp = base_dir.join(CONTAINER_TMP_FILE_NAME);
    fs::write(&tmp, render(container)?)?;
    fs::rename(&tmp, base_dir.join(CONTAINER_FILE_NAME))?;
    Ok(())
}

fn render(container: &KeyContainer) -> Result<String> {
    serde_json::to_string(container)
        .map_err(|e| Error::InvalidArgument(format!("cannot serialize key container: {e}")))
}

/// Re-wrap the master key under a new password, with a fresh salt, keeping
/// version and stream parameters, and atomically replace the container.
pub fn change_password(
    base_dir: &Path,
    old_password: &SecretString,
    new_password: &SecretString,
    rounds: u32,
) -> Result<()> {
    let doc = load(base_dir)?;
    let (master_key, params) = unlock(&doc, old_password)?;
    rewrap(base_dir, doc.version, &master_key, params, new_password, rounds)
}

/// Re-wrap an already-unlocked master key under a new password with a fresh
/// salt and atomically replace the container.
///
/// Split out of [`change_password`] so a caller that has just authenticated
/// does not pay the PBKDF2 derivation of the old password a second time.
pub fn rewrap(
    base_dir: &Path,
    version: u32,
    master_key: &Key,
    params: StreamParams,
    new_password: &SecretString,
    rounds: u32,
) -> Result<()> {
    let fresh = generate(
        version,
        master_key,
        new_password,
        rounds,
        params.block_size,
        params.iv_size,
    )?;
    save_atomic(base_dir, &fresh)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_ROUNDS: u32 = 1000;

    fn password(s: &str) -> SecretString {
        SecretString::from(s)
    }

    #[test]
    fn test_generate_unlock_roundtrip_v2() {
        let master = Key::generate();
        let doc = generate(2, &master, &password("hunter2"), TEST_ROUNDS, 4096, 12).unwrap();

        assert_eq!(doc.version, 2);
        assert_eq!(doc.iterations, TEST_ROUNDS);
        assert_eq!(doc.block_size, Some(4096));
        assert_eq!(doc.iv_size, Some(12));

        let (unlocked, params) = unlock(&doc, &password("hunter2")).unwrap();
        assert_eq!(unlocked.as_bytes(), master.as_bytes());
        assert_eq!(params, StreamParams { block_size: 4096, iv_size: 12 });
    }

    #[test]
    fn test_v1_forces_legacy_parameters() {
        let master = Key::generate();
        let doc = generate(1, &master, &password("pw"), TEST_ROUNDS, 8192, 24).unwrap();

        assert_eq!(doc.block_size, None);
        assert_eq!(doc.iv_size, None);

        let (_, params) = unlock(&doc, &password("pw")).unwrap();
        assert_eq!(params, StreamParams { block_size: 4096, iv_size: 32 });
    }

    #[test]
    fn test_wrong_password() {
        let master = Key::generate();
        let doc = generate(2, &master, &password("right"), TEST_ROUNDS, 4096, 12).unwrap();

        assert!(matches!(
            unlock(&doc, &password("wrong")),
            Err(Error::WrongPassword)
        ));
    }

    #[test]
    fn test_tampered_fields_read_as_wrong_password() {
        let master = Key::generate();
        let mut doc = generate(2, &master, &password("pw"), TEST_ROUNDS, 4096, 12).unwrap();

        // Flip one hex digit of the wrapped key.
        let mut key_hex = doc.encrypted_key.key.clone();
        let flipped = if key_hex.starts_with('0') { "1" } else { "0" };
        key_hex.replace_range(0..1, flipped);
        doc.encrypted_key.key = key_hex;
        assert!(matches!(unlock(&doc, &password("pw")), Err(Error::WrongPassword)));

        // Truncated salt is an integrity failure too, not a parse error.
        let mut doc2 = generate(2, &master, &password("pw"), TEST_ROUNDS, 4096, 12).unwrap();
        doc2.salt.truncate(10);
        assert!(matches!(unlock(&doc2, &password("pw")), Err(Error::WrongPassword)));
    }

    #[test]
    fn test_zero_rounds_selects_default() {
        let master = Key::generate();
        let doc = generate(2, &master, &password("pw"), 0, 4096, 12).unwrap();
        assert_eq!(doc.iterations, DEFAULT_PBKDF2_ROUNDS);
    }

    #[test]
    fn test_rejects_bad_version_and_iv_size() {
        let master = Key::generate();
        assert!(generate(3, &master, &password("pw"), TEST_ROUNDS, 4096, 12).is_err());
        assert!(generate(2, &master, &password("pw"), TEST_ROUNDS, 4096, 11).is_err());
        assert!(generate(2, &master, &password("pw"), TEST_ROUNDS, 4096, 65).is_err());
    }

    #[test]
    fn test_json_field_names_match_format() {
        let master = Key::generate();
        let doc = generate(2, &master, &password("pw"), TEST_ROUNDS, 4096, 12).unwrap();
        let json: serde_json::Value = serde_json::from_str(&render(&doc).unwrap()).unwrap();

        assert!(json.get("version").is_some());
        assert!(json.get("iterations").is_some());
        assert!(json.get("salt").is_some());
        let ek = json.get("encrypted_key").unwrap();
        assert!(ek.get("IV").is_some());
        assert!(ek.get("MAC").is_some());
        assert!(ek.get("key").is_some());
        assert!(json.get("block_size").is_some());
        assert!(json.get("iv_size").is_some());
    }

    #[test]
    fn test_rewrap_with_unlocked_key() {
        let dir = tempfile::TempDir::new().unwrap();
        let master = Key::generate();

        let doc = generate(2, &master, &password("old"), TEST_ROUNDS, 4096, 12).unwrap();
        create_new(dir.path(), &doc).unwrap();

        let loaded = load(dir.path()).unwrap();
        let (master_key, params) = unlock(&loaded, &password("old")).unwrap();
        rewrap(dir.path(), loaded.version, &master_key, params, &password("new"), TEST_ROUNDS)
            .unwrap();

        let reloaded = load(dir.path()).unwrap();
        let (unlocked, reparams) = unlock(&reloaded, &password("new")).unwrap();
        assert_eq!(unlocked.as_bytes(), master.as_bytes());
        assert_eq!(reparams, params, "stream parameters survive the re-wrap");
    }

    #[test]
    fn test_create_load_change_password() {
        let dir = tempfile::TempDir::new().unwrap();
        let master = Key::generate();

        let doc = generate(2, &master, &password("old"), TEST_ROUNDS, 4096, 12).unwrap();
        create_new(dir.path(), &doc).unwrap();

        // A second create must refuse to clobber the container.
        assert!(create_new(dir.path(), &doc).is_err());

        change_password(dir.path(), &password("old"), &password("new"), TEST_ROUNDS).unwrap();

        // No temp file left behind, and only the new password unlocks.
        assert!(!dir.path().join(CONTAINER_TMP_FILE_NAME).exists());
        let reloaded = load(dir.path()).unwrap();
        assert!(matches!(
            unlock(&reloaded, &password("old")),
            Err(Error::WrongPassword)
        ));
        let (unlocked, _) = unlock(&reloaded, &password("new")).unwrap();
        assert_eq!(unlocked.as_bytes(), master.as_bytes());
    }
}
