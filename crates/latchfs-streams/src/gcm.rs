//! AES-256-GCM block-crypt stream with an encrypted per-file header
//!
//! Metadata stream layout (the stream itself is HMAC-wrapped):
//!
//! ```text
//! [0, He)                      encrypted header   IV_h ‖ TAG_h ‖ CT_h(32)
//! [He + k·R, He + (k+1)·R)     block k record     IV_k ‖ TAG_k
//!
//! He = 32 + |IV| + 16,  R = |IV| + 16
//! ```
//!
//! Every seal binds the file id as associated data, so ciphertext cannot be
//! transplanted between files. An all-zero IV record marks a sparse hole
//! (block of zeroes, no ciphertext stored); random IVs reject the all-zero
//! value so the marker is unambiguous.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use latchfs_core::{Error, FileId, Result};
use latchfs_crypto::{GcmCipher, Key, TAG_SIZE};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::base::ByteStream;
use crate::block::{BlockCrypter, CryptStream};
use crate::hmac::HmacStream;

/// Plaintext size of the per-file header.
pub const HEADER_SIZE: usize = 32;

/// Highest addressable block index.
pub const MAX_BLOCK_INDEX: u64 = 1 << 30;

/// Everything needed to open (or create) one encrypted file.
pub struct AesGcmStreamParams {
    pub data_key: Key,
    pub meta_key: Key,
    pub id: FileId,
    /// Off = no-verification (forensic) mode: HMAC and tag failures are
    /// ignored and whatever plaintext can be recovered is returned.
    pub verify: bool,
    pub block_size: usize,
    pub iv_size: usize,
}

pub struct GcmCrypter {
    meta: HmacStream,
    cipher: GcmCipher,
    id: FileId,
    block_size: usize,
    verify: bool,
}

impl GcmCrypter {
    fn record_size(&self) -> usize {
        self.cipher.iv_size() + TAG_SIZE
    }

    fn encrypted_header_size(&self) -> usize {
        HEADER_SIZE + self.record_size()
    }

    fn record_offset(&self, block: u64) -> u64 {
        self.encrypted_header_size() as u64 + block * self.record_size() as u64
    }

    fn check_block_index(&self, block: u64) -> Result<()> {
        if block > MAX_BLOCK_INDEX {
            return Err(Error::StreamTooLong {
                limit: MAX_BLOCK_INDEX * self.block_size as u64,
                requested: block * self.block_size as u64,
            });
        }
        Ok(())
    }
}

impl BlockCrypter for GcmCrypter {
    fn encrypt_block(&mut self, block: u64, data: &mut [u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.check_block_index(block)?;

        let mut record = vec![0u8; self.record_size()];
        let (iv, tag_slot) = record.split_at_mut(self.cipher.iv_size());

        // The all-zero IV is the hole marker; reroll until non-zero.
        loop {
            rand::thread_rng().fill_bytes(iv);
            if iv.iter().any(|&b| b != 0) {
                break;
            }
        }

        let tag = self.cipher.seal(iv, self.id.as_bytes(), data)?;
        tag_slot.copy_from_slice(&tag);
        self.meta.write(&record, self.record_offset(block))
    }

    fn decrypt_block(&mut self, block: u64, data: &mut [u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.check_block_index(block)?;

        let mut record = vec![0u8; self.record_size()];
        let rc = self.meta.read(&mut record, self.record_offset(block))?;
        if rc != record.len() {
            return Err(Error::CorruptedMetadata {
                id: self.id,
                reason: "per-block IV/tag record missing or short",
            });
        }

        let (iv, tag) = record.split_at(self.cipher.iv_size());
        if iv.iter().all(|&b| b == 0) {
            // Sparse hole: the plaintext is all zeroes by definition.
            data.fill(0);
            return Ok(());
        }

        let mut tag_arr = [0u8; TAG_SIZE];
        tag_arr.copy_from_slice(tag);

        if self.verify {
            if !self.cipher.open(iv, self.id.as_bytes(), data, &tag_arr) {
                return Err(Error::MessageVerification {
                    id: self.id,
                    offset: block * self.block_size as u64,
                });
            }
        } else {
            let snapshot = data.to_vec();
            if !self.cipher.open(iv, self.id.as_bytes(), data, &tag_arr) {
                data.copy_from_slice(&snapshot);
                self.cipher.open_unauthenticated(iv, data);
            }
        }
        Ok(())
    }

    fn is_sparse(&self) -> bool {
        self.meta.is_sparse()
    }

    fn flush(&mut self) -> Result<()> {
        self.meta.flush()
    }

    fn resize_records(&mut self, new_size: u64) -> Result<()> {
        // Keep exactly one record per remaining block: shrink drops stale
        // records, growth zero-extends and zero records read as holes.
        let blocks = new_size.div_ceil(self.block_size as u64);
        self.meta.resize(self.record_offset(blocks))
    }
}

/// The concrete encrypted stream every file object is built on.
pub type AesGcmCryptStream = CryptStream<GcmCrypter>;

impl AesGcmCryptStream {
    /// Wrap a data stream and its metadata companion.
    ///
    /// Verifies the metadata HMAC up front when `verify` is on; an empty
    /// metadata stream is a fresh file.
    pub fn open(
        data: Box<dyn ByteStream>,
        meta: Box<dyn ByteStream>,
        params: AesGcmStreamParams,
    ) -> Result<Self> {
        if params.block_size == 0 {
            return Err(Error::InvalidArgument("block size must be positive".into()));
        }
        if !(12..=64).contains(&params.iv_size) {
            return Err(Error::InvalidArgument(format!(
                "IV size {} out of range (12-64)",
                params.iv_size
            )));
        }
        let cipher = GcmCipher::new(&params.data_key, params.iv_size)?;
        let meta = HmacStream::new(params.meta_key, params.id, meta, params.verify)?;
        let crypter = GcmCrypter {
            meta,
            cipher,
            id: params.id,
            block_size: params.block_size,
            verify: params.verify,
        };
        Ok(CryptStream::new(data, params.block_size, crypter))
    }

    /// Split into two views: a byte-stream handle for file contents and a
    /// header handle for the directory layer's bookkeeping. Both forward to
    /// the same shared object.
    pub fn into_pair(self) -> (SharedCryptStream, HeaderHandle) {
        let shared = Arc::new(Mutex::new(self));
        (SharedCryptStream(Arc::clone(&shared)), HeaderHandle(shared))
    }

    pub fn max_header_len(&self) -> usize {
        HEADER_SIZE
    }

    /// Read up to [`HEADER_SIZE`] bytes of the decrypted header into `out`.
    /// Returns false when no header has been written yet.
    pub fn read_header(&mut self, out: &mut [u8]) -> Result<bool> {
        if out.len() > HEADER_SIZE {
            return Err(Error::InvalidArgument(format!(
                "header read of {} bytes exceeds the {HEADER_SIZE}-byte header",
                out.len()
            )));
        }
        let mut plain = Zeroizing::new([0u8; HEADER_SIZE]);
        let present = self.read_header_exact(&mut plain)?;
        let n = out.len();
        out.copy_from_slice(&plain[..n]);
        Ok(present)
    }

    fn read_header_exact(&mut self, out: &mut [u8; HEADER_SIZE]) -> Result<bool> {
        let c = &mut self.crypter;
        let mut record = vec![0u8; c.encrypted_header_size()];
        let rc = c.meta.read(&mut record, 0)?;
        if rc == 0 {
            return Ok(false);
        }
        if rc != record.len() {
            return Err(Error::CorruptedMetadata {
                id: c.id,
                reason: "encrypted header record is short",
            });
        }

        let (iv, rest) = record.split_at(c.cipher.iv_size());
        let (tag, ciphertext) = rest.split_at(TAG_SIZE);
        if iv.iter().all(|&b| b == 0) {
            // The metadata stream was grown past a never-written header
            // (resize zero-extends); report it as absent like a hole.
            out.fill(0);
            return Ok(false);
        }

        let mut tag_arr = [0u8; TAG_SIZE];
        tag_arr.copy_from_slice(tag);
        out.copy_from_slice(ciphertext);

        if !c.cipher.open(iv, c.id.as_bytes(), out, &tag_arr) {
            if c.verify {
                return Err(Error::MessageVerification { id: c.id, offset: 0 });
            }
            out.copy_from_slice(ciphertext);
            c.cipher.open_unauthenticated(iv, out);
        }
        Ok(true)
    }

    /// Encrypt and store up to [`HEADER_SIZE`] bytes as the header,
    /// zero-padded to the full 32 bytes.
    pub fn write_header(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > HEADER_SIZE {
            return Err(Error::InvalidArgument(format!(
                "header write of {} bytes exceeds the {HEADER_SIZE}-byte header",
                data.len()
            )));
        }
        let c = &mut self.crypter;
        let iv_size = c.cipher.iv_size();
        let mut record = vec![0u8; c.encrypted_header_size()];
        let (iv, rest) = record.split_at_mut(iv_size);
        let (tag_slot, ciphertext) = rest.split_at_mut(TAG_SIZE);

        loop {
            rand::thread_rng().fill_bytes(iv);
            if iv.iter().any(|&b| b != 0) {
                break;
            }
        }

        let mut plain = Zeroizing::new([0u8; HEADER_SIZE]);
        plain[..data.len()].copy_from_slice(data);
        ciphertext.copy_from_slice(&plain[..]);
        let tag = c.cipher.seal(iv, c.id.as_bytes(), ciphertext)?;
        tag_slot.copy_from_slice(&tag);

        c.meta.write(&record, 0)
    }

    /// Flush the metadata stream (and with it the header).
    pub fn flush_header(&mut self) -> Result<()> {
        self.crypter.flush()
    }
}

fn lock_shared(shared: &Arc<Mutex<AesGcmCryptStream>>) -> MutexGuard<'_, AesGcmCryptStream> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Byte-stream view of a shared [`AesGcmCryptStream`].
pub struct SharedCryptStream(Arc<Mutex<AesGcmCryptStream>>);

impl SharedCryptStream {
    /// Flush and surface any error; drop-time flushing is best-effort only.
    pub fn close(&self) -> Result<()> {
        lock_shared(&self.0).flush()
    }
}

impl ByteStream for SharedCryptStream {
    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        lock_shared(&self.0).read(buf, offset)
    }

    fn write(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        lock_shared(&self.0).write(buf, offset)
    }

    fn resize(&mut self, new_size: u64) -> Result<()> {
        lock_shared(&self.0).resize(new_size)
    }

    fn size(&self) -> Result<u64> {
        lock_shared(&self.0).size()
    }

    fn flush(&mut self) -> Result<()> {
        lock_shared(&self.0).flush()
    }

    fn is_sparse(&self) -> bool {
        lock_shared(&self.0).is_sparse()
    }
}

/// Header view of a shared [`AesGcmCryptStream`].
pub struct HeaderHandle(Arc<Mutex<AesGcmCryptStream>>);

impl HeaderHandle {
    pub fn max_header_len(&self) -> usize {
        HEADER_SIZE
    }

    pub fn read_header(&self, out: &mut [u8]) -> Result<bool> {
        lock_shared(&self.0).read_header(out)
    }

    pub fn write_header(&self, data: &[u8]) -> Result<()> {
        lock_shared(&self.0).write_header(data)
    }

    pub fn flush_header(&self) -> Result<()> {
        lock_shared(&self.0).flush_header()
    }
}
