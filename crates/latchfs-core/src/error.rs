use thiserror::Error;

use crate::id::FileId;

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the storage layer can surface.
///
/// All failures propagate to the caller; nothing is silently recovered.
/// The only exception is drop-time flushing, which is best-effort.
#[derive(Debug, Error)]
pub enum Error {
    /// The HMAC prefix of a wrapped stream is truncated or does not match
    /// the payload.
    #[error("invalid stream format for file {id}: {reason}")]
    InvalidFormat { id: FileId, reason: &'static str },

    /// A per-block IV/tag record is missing or short.
    #[error("corrupted metadata for file {id}: {reason}")]
    CorruptedMetadata { id: FileId, reason: &'static str },

    /// AES-GCM tag verification failed for the block covering `offset`
    /// (a plaintext offset).
    #[error("verification of file {id} failed at offset {offset}")]
    MessageVerification { id: FileId, offset: u64 },

    /// The stream grew past the maximum addressable block.
    #[error("stream too long: requested {requested} bytes, limit is {limit}")]
    StreamTooLong { limit: u64, requested: u64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The key container could not be unwrapped. Deliberately does not
    /// distinguish a wrong password from any other integrity failure of the
    /// container.
    #[error("wrong password or corrupted key container")]
    WrongPassword,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_verification_display_carries_offset() {
        let err = Error::MessageVerification {
            id: FileId::from_bytes([0xEE; 32]),
            offset: 8192,
        };
        let msg = err.to_string();
        assert!(msg.contains("8192"));
        assert!(msg.contains("eeee"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
