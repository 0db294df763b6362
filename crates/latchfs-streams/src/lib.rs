//! latchfs-streams: the encrypted-stream core
//!
//! Every file object in the filesystem is a pair of host files driven
//! through this stack:
//!
//! ```text
//! caller
//!   └── AesGcmCryptStream            random-access authenticated encryption
//!         ├── data:  FileStream      ciphertext blocks, len_k ≤ B each
//!         └── meta:  HmacStream      HMAC-SHA-256 prefix over id ‖ payload
//!               └── FileStream       encrypted header + per-block IV ‖ TAG
//! ```
//!
//! The data file holds block ciphertext at `k·B`; tags and IVs live in the
//! metadata companion, so ciphertext length equals plaintext length and the
//! stream behaves byte-for-byte like a plain file under arbitrary
//! read/write/resize workloads. An all-zero IV marks a sparse hole: a block
//! of zeroes with no stored ciphertext or tag.

pub mod base;
pub mod block;
pub mod file;
pub mod gcm;
pub mod hmac;
pub mod memory;

pub use base::ByteStream;
pub use block::{BlockCrypter, CryptStream};
pub use file::FileStream;
pub use gcm::{AesGcmCryptStream, AesGcmStreamParams, HeaderHandle, SharedCryptStream};
pub use hmac::HmacStream;
pub use memory::MemoryStream;
