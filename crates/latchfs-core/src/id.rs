use rand::RngCore;

/// Size of a file identifier in bytes.
pub const ID_SIZE: usize = 32;

/// A 32-byte identifier that uniquely names a file at the storage layer.
///
/// Generated uniformly at random when a file is created and never reused.
/// The identifier is fed as associated data into every MAC computed over the
/// file, binding ciphertext and metadata to this file and preventing
/// cross-file substitution.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId([u8; ID_SIZE]);

impl FileId {
    pub const fn from_bytes(bytes: [u8; ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random identifier.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl std::fmt::Debug for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FileId({self})")
    }
}
