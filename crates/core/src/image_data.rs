//! Offset-based splitting of concatenated result blobs.
//!
//! The cloud service returns a batch of images as one byte blob plus a
//! list of start offsets. Image `i` spans `[offsets[i], offsets[i+1])`,
//! with the last entry running to the end of the blob.

use base64::Engine as _;

/// Split a concatenated blob into individual images using the server's
/// offsets list. Offsets beyond the blob length are clamped, so a
/// non-empty offsets list over an empty blob yields empty images rather
/// than a panic.
pub fn split_images(data: &[u8], offsets: &[usize]) -> Vec<Vec<u8>> {
    let mut images = Vec::with_capacity(offsets.len());
    for (i, &start) in offsets.iter().enumerate() {
        let end = offsets.get(i + 1).copied().unwrap_or(data.len());
        let start = start.min(data.len());
        let end = end.clamp(start, data.len());
        images.push(data[start..end].to_vec());
    }
    images
}

/// Decode a base64 blob and split it by offsets.
pub fn split_images_base64(b64: &str, offsets: &[usize]) -> Result<Vec<Vec<u8>>, base64::DecodeError> {
    let data = base64::engine::general_purpose::STANDARD.decode(b64)?;
    Ok(split_images(&data, offsets))
}
