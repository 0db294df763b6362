//! latchfs-crypto: key material and the password-protected master key
//!
//! Key hierarchy:
//! ```text
//! Master Key (256-bit random, generated at filesystem creation)
//!   wrapped by: AES-256-GCM under PBKDF2-HMAC-SHA256(password, salt, rounds)
//!   stored in:  .securefs.json in the base directory
//!
//! Data key / metadata key (256-bit, supplied per stream by the file layer)
//!   └── per-block AEAD: AES-256-GCM (IV size from config, AAD = file id)
//! ```
//!
//! The AES-GCM wrapper here ([`gcm::GcmCipher`]) selects its IV size at
//! runtime, because the on-disk format fixes the IV width per filesystem
//! (32 bytes for format version 1, configurable for version 2).

pub mod container;
pub mod gcm;
pub mod kdf;
pub mod keys;

pub use container::{KeyContainer, StreamParams};
pub use gcm::GcmCipher;
pub use kdf::derive_wrapping_key;
pub use keys::Key;

/// Size of every key in bytes (256-bit).
pub const KEY_SIZE: usize = 32;

/// Size of an AES-GCM authentication tag.
pub const TAG_SIZE: usize = 16;
