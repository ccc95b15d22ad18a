use core::str;

pub fn str_from_buf_nul(src: &[u8]) -> Result<&str, str::Utf8Error> {
    let end = src.iter().position(|&c| c == b'\0').unwrap_or(src.len());
    str::from_utf8(&src[0..end])
}

/// Copies `s` into `dst`, truncating to leave room for a trailing nul.
/// Returns the number of bytes copied.
pub fn copy_str_nul(dst: &mut [u8], s: &str) -> usize {
    if dst.is_empty() {
        return 0;
    }
    let len = s.len().min(dst.len() - 1);
    dst[..len].copy_from_slice(&s.as_bytes()[..len]);
    dst[len..].fill(0);
    len
}
