// PKCS#7 padding and unpadding
use crate::PaddingError;

/// Pad `bytes` up to the next multiple of `block_size`.
///
/// Between 1 and `block_size` bytes are always appended, so a message that
/// is already block aligned gains a whole block of padding.
///
/// # Panics
///
/// Panics if `block_size` is zero.
pub fn pkcs7_pad(bytes: &[u8], block_size: u8) -> Vec<u8> {
    assert!(block_size > 0, "block size must be non-zero");
    let n_pad = block_size - (bytes.len() % block_size as usize) as u8;
    let mut out = Vec::with_capacity(bytes.len() + n_pad as usize);
    out.extend_from_slice(bytes);
    out.resize(bytes.len() + n_pad as usize, n_pad);
    out
}

/// Strip PKCS#7 padding, returning the message part of `bytes`.
pub fn pkcs7_unpad(bytes: &[u8], block_size: u8) -> Result<&[u8], PaddingError> {
    let n_pad = is_pkcs7_padded(bytes, block_size).ok_or(PaddingError::InvalidPadding)?;
    Ok(&bytes[..bytes.len() - n_pad])
}

fn is_pkcs7_padded(bytes: &[u8], block_size: u8) -> Option<usize> {
    let &n_pad = bytes.last()?;
    if n_pad == 0 || n_pad > block_size || n_pad as usize > bytes.len() {
        return None;
    }
    let padding = &bytes[(bytes.len() - n_pad as usize)..];
    if padding.iter().all(|&el| el == n_pad) {
        return Some(n_pad as usize);
    }
    None
}
