//! File-backed byte stream over positioned I/O

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use latchfs_core::Result;

use crate::base::ByteStream;

/// A byte stream over a host file descriptor.
///
/// Uses pread/pwrite so no seek position is shared; writes past EOF and
/// `set_len` extensions read back as zeroes per POSIX, which satisfies the
/// zero-fill obligation of [`ByteStream`]. `flush` is a no-op (writes land
/// in the host page cache); [`FileStream::fsync`] is the separate durability
/// hook for the mount's fsync path.
pub struct FileStream {
    file: File,
}

impl FileStream {
    pub fn new(file: File) -> Self {
        Self { file }
    }

    /// Create the file, failing if it already exists.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(Self { file })
    }

    /// Open an existing file for reading and writing.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    /// Open an existing file, creating it empty if absent.
    pub fn open_or_create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(Self { file })
    }

    /// Force file contents and metadata to stable storage.
    pub fn fsync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

impl ByteStream for FileStream {
    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        // pread may return short mid-file; keep going until the buffer is
        // full or EOF.
        let mut total = 0;
        while total < buf.len() {
            let n = self.file.read_at(&mut buf[total..], offset + total as u64)?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    fn write(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn resize(&mut self, new_size: u64) -> Result<()> {
        self.file.set_len(new_size)?;
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_sparse(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_stream(dir: &tempfile::TempDir, name: &str) -> FileStream {
        FileStream::create(&dir.path().join(name)).unwrap()
    }

    #[test]
    fn test_write_read_at_offset() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut s = temp_stream(&dir, "a");

        s.write(b"hello", 3).unwrap();
        assert_eq!(s.size().unwrap(), 8);

        let mut buf = [0u8; 8];
        let n = s.read(&mut buf, 0).unwrap();
        assert_eq!(n, 8);
        assert_eq!(&buf, b"\0\0\0hello");
    }

    #[test]
    fn test_read_past_end_is_short() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut s = temp_stream(&dir, "a");

        s.write(b"abc", 0).unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(s.read(&mut buf, 1).unwrap(), 2);
        assert_eq!(&buf[..2], b"bc");
        assert_eq!(s.read(&mut buf, 100).unwrap(), 0);
    }

    #[test]
    fn test_resize_extends_with_zeroes() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut s = temp_stream(&dir, "a");

        s.write(b"xy", 0).unwrap();
        s.resize(6).unwrap();

        let mut buf = [0xFFu8; 6];
        assert_eq!(s.read(&mut buf, 0).unwrap(), 6);
        assert_eq!(&buf, b"xy\0\0\0\0");

        s.resize(1).unwrap();
        assert_eq!(s.size().unwrap(), 1);
    }
}
