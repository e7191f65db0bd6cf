//! Shared SHA-256 digest helpers.
//!
//! The cloud LoRA cache is content-addressed: the storage identifier is
//! the base64 of the SHA-256 digest of the weight bytes, which doubles
//! as the object-storage checksum header value.

use base64::Engine as _;
use sha2::{Digest, Sha256};

/// Compute a SHA-256 hex digest of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

/// Compute a standard-base64 SHA-256 digest, the content-addressed
/// storage id for LoRA uploads.
pub fn sha256_base64(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    base64::engine::general_purpose::STANDARD.encode(hash)
}
