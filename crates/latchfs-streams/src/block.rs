//! Generic random-access block cipher over a byte stream
//!
//! [`CryptStream`] splits its payload into fixed-size blocks and delegates
//! the cipher itself to a [`BlockCrypter`]. Ciphertext for block `k` lives at
//! data offset `k·B` with the same length as the plaintext, so stream size
//! equals payload size and resize/size behave exactly like a plain file.

use latchfs_core::Result;
use zeroize::Zeroizing;

use crate::base::ByteStream;

/// The per-block cipher a [`CryptStream`] is parameterized over.
///
/// Both directions work in place: `encrypt_block` turns plaintext into
/// ciphertext of the same length (recording whatever per-block state it
/// needs, IVs and tags typically), `decrypt_block` reverses it and verifies.
/// Encryption must not fail for valid block indices; decryption signals
/// authentication failures.
pub trait BlockCrypter: Send {
    fn encrypt_block(&mut self, block: u64, data: &mut [u8]) -> Result<()>;

    fn decrypt_block(&mut self, block: u64, data: &mut [u8]) -> Result<()>;

    /// Whether the crypter's own storage, if any, preserves holes.
    fn is_sparse(&self) -> bool {
        true
    }

    /// Flush the crypter's own storage, if any.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called after the data stream is resized so per-block records can be
    /// trimmed or (zero-)extended to match; a zero-extended record reads as
    /// a hole.
    fn resize_records(&mut self, _new_size: u64) -> Result<()> {
        Ok(())
    }
}

/// A block-structured crypt stream over an arbitrary backing stream.
pub struct CryptStream<C: BlockCrypter> {
    pub(crate) stream: Box<dyn ByteStream>,
    pub(crate) block_size: usize,
    pub(crate) crypter: C,
}

impl<C: BlockCrypter> std::fmt::Debug for CryptStream<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptStream")
            .field("block_size", &self.block_size)
            .finish_non_exhaustive()
    }
}

impl<C: BlockCrypter> CryptStream<C> {
    pub fn new(stream: Box<dyn ByteStream>, block_size: usize, crypter: C) -> Self {
        assert!(block_size > 0, "block size must be positive");
        Self { stream, block_size, crypter }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Flush and surface any error; drop-time flushing is best-effort only.
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }

    /// Read one full block into `out` (sized `block_size`). Returns the
    /// plaintext length, 0 when the block does not exist.
    fn read_block(&mut self, block: u64, out: &mut [u8]) -> Result<usize> {
        debug_assert_eq!(out.len(), self.block_size);
        let rc = self.stream.read(out, block * self.block_size as u64)?;
        if rc == 0 {
            return Ok(0);
        }
        self.crypter.decrypt_block(block, &mut out[..rc])?;
        Ok(rc)
    }

    /// Read the sub-range `[begin, end)` of a block into `out`.
    fn read_block_range(
        &mut self,
        block: u64,
        out: &mut [u8],
        begin: usize,
        end: usize,
    ) -> Result<usize> {
        debug_assert!(begin <= self.block_size && end <= self.block_size);

        if begin == 0 && end == self.block_size {
            return self.read_block(block, out);
        }
        if begin >= end {
            return Ok(0);
        }

        let mut buf = Zeroizing::new(vec![0u8; self.block_size]);
        let rc = self.read_block(block, &mut buf)?;
        if rc <= begin {
            return Ok(0);
        }
        let end = end.min(rc);
        out[..end - begin].copy_from_slice(&buf[begin..end]);
        Ok(end - begin)
    }

    /// Encrypt `data` (at most one block) and store it at the block's data
    /// offset.
    fn write_block(&mut self, block: u64, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() <= self.block_size);
        // The scratch holds plaintext until the crypter overwrites it.
        let mut buf = Zeroizing::new(data.to_vec());
        self.crypter.encrypt_block(block, &mut buf)?;
        self.stream.write(&buf, block * self.block_size as u64)
    }

    /// Patch `[begin, end)` of a block with `data`, preserving the rest.
    fn read_then_write_block(
        &mut self,
        block: u64,
        data: &[u8],
        begin: usize,
        end: usize,
    ) -> Result<()> {
        debug_assert!(begin <= self.block_size && end <= self.block_size);
        debug_assert_eq!(data.len(), end.saturating_sub(begin));

        if begin == 0 && end == self.block_size {
            return self.write_block(block, data);
        }
        if begin >= end {
            return Ok(());
        }

        let mut buf = Zeroizing::new(vec![0u8; self.block_size]);
        let rc = self.read_block(block, &mut buf)?;
        buf[begin..end].copy_from_slice(data);
        let len = rc.max(end);
        self.write_block(block, &buf[..len])
    }

    fn unchecked_write(&mut self, buf: &[u8], mut offset: u64) -> Result<()> {
        let bs = self.block_size as u64;
        let mut pos = 0;
        while pos < buf.len() {
            let remaining = (buf.len() - pos) as u64;
            let block = offset / bs;
            let start = block * bs;
            let begin = (offset - start) as usize;
            let end = bs.min(offset + remaining - start) as usize;
            self.read_then_write_block(block, &buf[pos..pos + (end - begin)], begin, end)?;
            pos += end - begin;
            offset += (end - begin) as u64;
        }
        Ok(())
    }

    /// Overwrite `[offset, finish)` with zero bytes, re-encrypting every
    /// touched block. Used where holes cannot (or must not) be left behind.
    fn zero_fill(&mut self, mut offset: u64, finish: u64) -> Result<()> {
        let zeros = vec![0u8; self.block_size];
        let bs = self.block_size as u64;
        while offset < finish {
            let block = offset / bs;
            let start = block * bs;
            let begin = (offset - start) as usize;
            let end = bs.min(finish - start) as usize;
            self.read_then_write_block(block, &zeros[..end - begin], begin, end)?;
            offset += (end - begin) as u64;
        }
        Ok(())
    }
}

impl<C: BlockCrypter> ByteStream for CryptStream<C> {
    fn read(&mut self, buf: &mut [u8], mut offset: u64) -> Result<usize> {
        let bs = self.block_size as u64;
        let mut total = 0;
        while total < buf.len() {
            let remaining = (buf.len() - total) as u64;
            let block = offset / bs;
            let start = block * bs;
            let begin = (offset - start) as usize;
            let end = bs.min(offset + remaining - start) as usize;
            let rc = self.read_block_range(block, &mut buf[total..total + (end - begin)], begin, end)?;
            total += rc;
            if rc < end - begin {
                break;
            }
            offset += rc as u64;
        }
        Ok(total)
    }

    fn write(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let current = self.size()?;
        if offset > current {
            // Hole-fill the gap [current, offset) first.
            self.resize(offset)?;
        }
        self.unchecked_write(buf, offset)
    }

    fn resize(&mut self, new_size: u64) -> Result<()> {
        let current = self.size()?;
        let bs = self.block_size as u64;

        if new_size < current {
            // A shrink landing mid-block re-encrypts the final partial block
            // at its new, shorter length before the ciphertext is truncated.
            let residue = (new_size % bs) as usize;
            if residue > 0 {
                let block = new_size / bs;
                let mut buf = Zeroizing::new(vec![0u8; self.block_size]);
                let _ = self.read_block(block, &mut buf)?;
                self.write_block(block, &buf[..residue])?;
            }
        } else if new_size > current {
            let old_block = current / bs;
            let new_block = new_size / bs;
            if !self.is_sparse() || old_block == new_block {
                self.zero_fill(current, new_size)?;
            } else {
                // Only the edge blocks need real ciphertext; blocks strictly
                // inside the gap stay holes.
                self.zero_fill(current, (old_block + 1) * bs)?;
                self.zero_fill(new_block * bs, new_size)?;
            }
        } else {
            return Ok(());
        }

        self.stream.resize(new_size)?;
        self.crypter.resize_records(new_size)
    }

    fn size(&self) -> Result<u64> {
        self.stream.size()
    }

    fn flush(&mut self) -> Result<()> {
        self.stream.flush()?;
        self.crypter.flush()
    }

    fn is_sparse(&self) -> bool {
        self.stream.is_sparse() && self.crypter.is_sparse()
    }
}

impl<C: BlockCrypter> Drop for CryptStream<C> {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            tracing::warn!("flush on drop failed: {err}");
        }
    }
}
