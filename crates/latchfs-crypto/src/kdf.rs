//! Key derivation: PBKDF2-HMAC-SHA256 password → wrapping key

use pbkdf2::pbkdf2_hmac;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::keys::Key;
use crate::KEY_SIZE;

/// Rounds applied when the caller asks for the automatic setting (0).
pub const DEFAULT_PBKDF2_ROUNDS: u32 = 400_000;

/// Size of the container salt in bytes.
pub const SALT_SIZE: usize = 32;

/// Derive the 256-bit key-wrapping key from a password.
///
/// The salt is random per container and stored alongside the wrapped key
/// (it does not need to be secret). Rounds below the default are accepted
/// so existing containers keep unlocking with whatever they were created
/// with.
pub fn derive_wrapping_key(password: &SecretString, salt: &[u8; SALT_SIZE], rounds: u32) -> Key {
    let mut out = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(password.expose_secret().as_bytes(), salt, rounds, &mut out);
    let key = Key::from_bytes(out);
    out.zeroize();
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    // Low round counts keep the tests fast; production uses the default.
    const TEST_ROUNDS: u32 = 1000;

    #[test]
    fn test_kdf_deterministic() {
        let password = SecretString::from("test-password-123");
        let salt = [1u8; SALT_SIZE];

        let k1 = derive_wrapping_key(&password, &salt, TEST_ROUNDS);
        let k2 = derive_wrapping_key(&password, &salt, TEST_ROUNDS);

        assert_eq!(k1.as_bytes(), k2.as_bytes(), "KDF must be deterministic");
    }

    #[test]
    fn test_kdf_different_passwords() {
        let salt = [1u8; SALT_SIZE];

        let k1 = derive_wrapping_key(&SecretString::from("password-a"), &salt, TEST_ROUNDS);
        let k2 = derive_wrapping_key(&SecretString::from("password-b"), &salt, TEST_ROUNDS);

        assert_ne!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn test_kdf_different_salts() {
        let password = SecretString::from("same-password");

        let k1 = derive_wrapping_key(&password, &[1u8; SALT_SIZE], TEST_ROUNDS);
        let k2 = derive_wrapping_key(&password, &[2u8; SALT_SIZE], TEST_ROUNDS);

        assert_ne!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn test_kdf_different_rounds() {
        let password = SecretString::from("same-password");
        let salt = [3u8; SALT_SIZE];

        let k1 = derive_wrapping_key(&password, &salt, TEST_ROUNDS);
        let k2 = derive_wrapping_key(&password, &salt, TEST_ROUNDS + 1);

        assert_ne!(k1.as_bytes(), k2.as_bytes());
    }
}
