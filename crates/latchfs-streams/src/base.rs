use latchfs_core::Result;

/// A mutable byte sequence addressable by 64-bit offset.
///
/// The contract every implementation upholds:
///
/// - `read` copies up to `buf.len()` bytes from `offset` and returns how
///   many it copied; a short count means end of stream was reached.
/// - `write` stores all of `buf` at `offset`. Writing past the end extends
///   the stream, and the gap `[size, offset)` reads back as zeroes.
/// - `resize` truncates or extends; extension zero-fills. No region ever
///   reads as uninitialized bytes; layers above (the HMAC prefix in
///   particular) depend on this.
/// - `flush` pushes buffered state towards the host; durable persistence is
///   the business of an external fsync.
/// - `is_sparse` reports whether unwritten regions stay unallocated in the
///   backing store.
///
/// Implementations are not required to be thread-safe; callers serialize
/// access per stream.
pub trait ByteStream: Send {
    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize>;

    fn write(&mut self, buf: &[u8], offset: u64) -> Result<()>;

    fn resize(&mut self, new_size: u64) -> Result<()>;

    fn size(&self) -> Result<u64>;

    fn flush(&mut self) -> Result<()>;

    fn is_sparse(&self) -> bool;
}
