//! AES-256-GCM with a runtime-selected IV size
//!
//! The on-disk format fixes the IV width per filesystem: 32 bytes for format
//! version 1, 12 by default for version 2, and 32 always for the key
//! container. The RustCrypto cipher types carry the nonce size as a type
//! parameter, so this wrapper instantiates one variant per accepted width
//! and dispatches at runtime.

use aes_gcm::aead::generic_array::typenum::{U12, U16, U24, U32, U48, U64};
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::AeadInPlace;
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, KeyInit};
use latchfs_core::{Error, Result};

use crate::keys::Key;
use crate::TAG_SIZE;

/// IV widths this build can instantiate. The format allows 12–64; of that
/// window these are the aligned sizes, covering both widths the original
/// tooling ever writes (12 and 32).
pub const SUPPORTED_IV_SIZES: &[usize] = &[12, 16, 24, 32, 48, 64];

enum Inner {
    Iv12(AesGcm<Aes256, U12>),
    Iv16(AesGcm<Aes256, U16>),
    Iv24(AesGcm<Aes256, U24>),
    Iv32(AesGcm<Aes256, U32>),
    Iv48(AesGcm<Aes256, U48>),
    Iv64(AesGcm<Aes256, U64>),
}

macro_rules! with_cipher {
    ($inner:expr, $c:ident => $body:expr) => {
        match $inner {
            Inner::Iv12($c) => $body,
            Inner::Iv16($c) => $body,
            Inner::Iv24($c) => $body,
            Inner::Iv32($c) => $body,
            Inner::Iv48($c) => $body,
            Inner::Iv64($c) => $body,
        }
    };
}

/// An AES-256-GCM cipher bound to one key and one IV width.
pub struct GcmCipher {
    inner: Inner,
    iv_size: usize,
}

impl GcmCipher {
    pub fn new(key: &Key, iv_size: usize) -> Result<Self> {
        let key = GenericArray::from_slice(key.as_bytes());
        let inner = match iv_size {
            12 => Inner::Iv12(AesGcm::new(key)),
            16 => Inner::Iv16(AesGcm::new(key)),
            24 => Inner::Iv24(AesGcm::new(key)),
            32 => Inner::Iv32(AesGcm::new(key)),
            48 => Inner::Iv48(AesGcm::new(key)),
            64 => Inner::Iv64(AesGcm::new(key)),
            other => {
                return Err(Error::InvalidArgument(format!(
                    "unsupported IV size {other} (supported: {SUPPORTED_IV_SIZES:?})"
                )))
            }
        };
        Ok(Self { inner, iv_size })
    }

    pub fn supported_iv_size(iv_size: usize) -> bool {
        SUPPORTED_IV_SIZES.contains(&iv_size)
    }

    pub fn iv_size(&self) -> usize {
        self.iv_size
    }

    /// Encrypt `buf` in place and return the 16-byte tag.
    ///
    /// `iv` must be exactly [`Self::iv_size`] bytes; `aad` is authenticated
    /// but not encrypted.
    pub fn seal(&self, iv: &[u8], aad: &[u8], buf: &mut [u8]) -> Result<[u8; TAG_SIZE]> {
        debug_assert_eq!(iv.len(), self.iv_size);
        let tag = with_cipher!(&self.inner, c => {
            c.encrypt_in_place_detached(GenericArray::from_slice(iv), aad, buf)
        })
        .map_err(|_| Error::InvalidArgument("AES-GCM encryption failed".into()))?;
        Ok(tag.into())
    }

    /// Decrypt `buf` in place, verifying the tag. Returns whether
    /// verification succeeded; on failure the buffer contents are
    /// unspecified.
    pub fn open(&self, iv: &[u8], aad: &[u8], buf: &mut [u8], tag: &[u8; TAG_SIZE]) -> bool {
        debug_assert_eq!(iv.len(), self.iv_size);
        with_cipher!(&self.inner, c => {
            c.decrypt_in_place_detached(
                GenericArray::from_slice(iv),
                aad,
                buf,
                GenericArray::from_slice(tag),
            )
        })
        .is_ok()
    }

    /// Decrypt `buf` in place without trusting any tag.
    ///
    /// GCM is CTR underneath and the keystream is identical in both
    /// directions, so running the seal direction over ciphertext recovers the
    /// plaintext; the computed tag is discarded. Only for no-verification
    /// (forensic) reads.
    pub fn open_unauthenticated(&self, iv: &[u8], buf: &mut [u8]) {
        debug_assert_eq!(iv.len(), self.iv_size);
        let _ = with_cipher!(&self.inner, c => {
            c.encrypt_in_place_detached(GenericArray::from_slice(iv), &[], buf)
        });
    }
}
