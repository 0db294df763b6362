//! HMAC-wrapped byte stream
//!
//! Reserves the first 32 bytes of the backing stream for an HMAC-SHA-256 of
//! `id ‖ payload`; caller-visible offset 0 is backing offset 32. The MAC is
//! recomputed lazily, in one pass over the payload at flush time. That stays
//! cheap because this wrapper only ever carries the per-file metadata side
//! file, bounded by one small record per block.

use hmac::{Hmac, Mac};
use latchfs_core::{Error, FileId, Result};
use latchfs_crypto::Key;
use sha2::Sha256;

use crate::base::ByteStream;

type HmacSha256 = Hmac<Sha256>;

/// Size of the MAC prefix in bytes.
pub const MAC_SIZE: usize = 32;

pub struct HmacStream {
    key: Key,
    id: FileId,
    stream: Box<dyn ByteStream>,
    dirty: bool,
}

impl std::fmt::Debug for HmacStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacStream")
            .field("id", &self.id)
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

impl HmacStream {
    /// Wrap `stream`. An empty backing stream is a fresh file; otherwise,
    /// when `verify` is on, the stored MAC prefix is recomputed over the
    /// payload and compared in constant time.
    pub fn new(key: Key, id: FileId, stream: Box<dyn ByteStream>, verify: bool) -> Result<Self> {
        let mut this = Self { key, id, stream, dirty: false };
        if verify {
            let mut stored = [0u8; MAC_SIZE];
            let rc = this.stream.read(&mut stored, 0)?;
            if rc != 0 {
                if rc != MAC_SIZE {
                    return Err(Error::InvalidFormat {
                        id: this.id,
                        reason: "MAC prefix is truncated",
                    });
                }
                this.payload_mac()?
                    .verify_slice(&stored)
                    .map_err(|_| Error::InvalidFormat { id: this.id, reason: "HMAC mismatch" })?;
            }
        }
        Ok(this)
    }

    /// One pass over `id ‖ payload` through the streaming HMAC context.
    fn payload_mac(&mut self) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.key.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(self.id.as_bytes());

        let mut buf = [0u8; 4096];
        let mut offset = MAC_SIZE as u64;
        loop {
            let rc = self.stream.read(&mut buf, offset)?;
            if rc == 0 {
                break;
            }
            mac.update(&buf[..rc]);
            offset += rc as u64;
        }
        Ok(mac)
    }

    /// Flush and surface any error; drop-time flushing is best-effort only.
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }
}

impl ByteStream for HmacStream {
    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.stream.read(buf, offset + MAC_SIZE as u64)
    }

    fn write(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        self.stream.write(buf, offset + MAC_SIZE as u64)?;
        self.dirty = true;
        Ok(())
    }

    fn resize(&mut self, new_size: u64) -> Result<()> {
        self.stream.resize(new_size + MAC_SIZE as u64)?;
        self.dirty = true;
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.stream.size()?.saturating_sub(MAC_SIZE as u64))
    }

    fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let digest = self.payload_mac()?.finalize().into_bytes();
        self.stream.write(&digest, 0)?;
        self.stream.flush()?;
        self.dirty = false;
        Ok(())
    }

    fn is_sparse(&self) -> bool {
        self.stream.is_sparse()
    }
}

impl Drop for HmacStream {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(err) = self.flush() {
                tracing::warn!(id = %self.id, "flush on drop failed: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileStream;

    fn test_key() -> Key {
        Key::from_bytes([0xFF; 32])
    }

    fn test_id() -> FileId {
        FileId::from_bytes([0xEE; 32])
    }

    fn backing(dir: &tempfile::TempDir) -> Box<dyn ByteStream> {
        Box::new(FileStream::open_or_create(&dir.path().join("meta")).unwrap())
    }

    #[test]
    fn test_roundtrip_through_reopen() {
        let dir = tempfile::TempDir::new().unwrap();

        let mut s = HmacStream::new(test_key(), test_id(), backing(&dir), true).unwrap();
        s.write(b"payload bytes", 0).unwrap();
        assert_eq!(s.size().unwrap(), 13);
        s.close().unwrap();

        let mut s = HmacStream::new(test_key(), test_id(), backing(&dir), true).unwrap();
        let mut buf = [0u8; 13];
        assert_eq!(s.read(&mut buf, 0).unwrap(), 13);
        assert_eq!(&buf, b"payload bytes");
    }

    #[test]
    fn test_drop_flushes() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let mut s = HmacStream::new(test_key(), test_id(), backing(&dir), true).unwrap();
            s.write(b"unflushed", 0).unwrap();
            // No explicit flush; drop must write the MAC.
        }
        assert!(HmacStream::new(test_key(), test_id(), backing(&dir), true).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected_on_open() {
        let dir = tempfile::TempDir::new().unwrap();

        let mut s = HmacStream::new(test_key(), test_id(), backing(&dir), true).unwrap();
        s.write(b"payload bytes", 0).unwrap();
        s.close().unwrap();

        // Flip one payload byte behind the wrapper's back.
        let mut raw = FileStream::open(&dir.path().join("meta")).unwrap();
        let mut b = [0u8; 1];
        raw.read(&mut b, MAC_SIZE as u64 + 3).unwrap();
        b[0] ^= 0x01;
        raw.write(&b, MAC_SIZE as u64 + 3).unwrap();

        let err = HmacStream::new(test_key(), test_id(), backing(&dir), true).unwrap_err();
        assert!(matches!(err, Error::InvalidFormat { .. }));
    }

    #[test]
    fn test_tampered_mac_rejected_on_open() {
        let dir = tempfile::TempDir::new().unwrap();

        let mut s = HmacStream::new(test_key(), test_id(), backing(&dir), true).unwrap();
        s.write(b"payload", 0).unwrap();
        s.close().unwrap();

        let mut raw = FileStream::open(&dir.path().join("meta")).unwrap();
        let mut b = [0u8; 1];
        raw.read(&mut b, 0).unwrap();
        b[0] ^= 0x80;
        raw.write(&b, 0).unwrap();

        assert!(HmacStream::new(test_key(), test_id(), backing(&dir), true).is_err());
    }

    #[test]
    fn test_truncated_prefix_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let mut raw = FileStream::open_or_create(&dir.path().join("meta")).unwrap();
            raw.write(&[0u8; 10], 0).unwrap();
        }
        let err = HmacStream::new(test_key(), test_id(), backing(&dir), true).unwrap_err();
        assert!(matches!(err, Error::InvalidFormat { .. }));
    }

    #[test]
    fn test_verification_can_be_skipped() {
        let dir = tempfile::TempDir::new().unwrap();

        let mut s = HmacStream::new(test_key(), test_id(), backing(&dir), true).unwrap();
        s.write(b"payload", 0).unwrap();
        s.close().unwrap();

        let mut raw = FileStream::open(&dir.path().join("meta")).unwrap();
        raw.write(&[0xAA], 0).unwrap();

        // Forensic mode opens anyway and still serves the payload.
        let mut s = HmacStream::new(test_key(), test_id(), backing(&dir), false).unwrap();
        let mut buf = [0u8; 7];
        assert_eq!(s.read(&mut buf, 0).unwrap(), 7);
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn test_wrong_key_rejected() {
        let dir = tempfile::TempDir::new().unwrap();

        let mut s = HmacStream::new(test_key(), test_id(), backing(&dir), true).unwrap();
        s.write(b"payload", 0).unwrap();
        s.close().unwrap();

        let other = Key::from_bytes([0x01; 32]);
        assert!(HmacStream::new(other, test_id(), backing(&dir), true).is_err());
    }

    #[test]
    fn test_size_excludes_prefix() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut s = HmacStream::new(test_key(), test_id(), backing(&dir), true).unwrap();
        assert_eq!(s.size().unwrap(), 0);
        s.resize(100).unwrap();
        assert_eq!(s.size().unwrap(), 100);
    }
}
