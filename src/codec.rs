//! UTF-8 conversions between Rust strings and the C strings SQLite hands to callbacks.
//!
//! Decoded strings borrow native memory. They are only valid for the duration of the
//! callback that received the pointer.

use core::ffi::{CStr, c_char, c_void};

use crate::error::{Error, Result};

/// Encode text as UTF-8 with a trailing NUL. `None` stays `None`.
pub fn encode(text: Option<&str>) -> Option<Vec<u8>> {
    text.map(encode_str)
}

/// Encode non-null text as UTF-8 with a trailing NUL.
pub fn encode_str(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() + 1);
    out.extend_from_slice(text.as_bytes());
    out.push(0);
    out
}

/// Decode a NUL-terminated UTF-8 string. A null pointer decodes to `None`.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated buffer valid for `'a`.
pub unsafe fn decode<'a>(ptr: *const c_char) -> Result<Option<&'a str>> {
    if ptr.is_null() {
        return Ok(None);
    }
    let bytes = unsafe { CStr::from_ptr(ptr) }.to_bytes();
    utf8(bytes).map(Some)
}

/// Decode exactly `len` bytes of UTF-8. A null pointer decodes to `None` whatever `len` is.
///
/// # Safety
/// `ptr` must be null or valid for reads of `len` bytes during `'a`.
pub unsafe fn decode_len<'a>(ptr: *const c_void, len: usize) -> Result<Option<&'a str>> {
    if ptr.is_null() {
        return Ok(None);
    }
    let bytes = unsafe { core::slice::from_raw_parts(ptr as *const u8, len) };
    utf8(bytes).map(Some)
}

/// Decode a string SQLite guarantees to be present, naming `what` when it is null.
pub(crate) unsafe fn decode_required<'a>(ptr: *const c_char, what: &str) -> Result<&'a str> {
    unsafe { decode(ptr) }?.ok_or_else(|| Error::Marshaling(format!("null {what}")))
}

/// Decode an array of `n` string pointers whose entries may individually be null.
pub(crate) unsafe fn decode_array<'a>(
    array: *const *mut c_char,
    n: i32,
) -> Result<Vec<Option<&'a str>>> {
    let n = usize::try_from(n).unwrap_or(0);
    if n == 0 {
        return Ok(Vec::new());
    }
    if array.is_null() {
        return Err(Error::Marshaling(format!("null array of {n} strings")));
    }
    let entries = unsafe { core::slice::from_raw_parts(array, n) };
    entries
        .iter()
        .map(|&entry| unsafe { decode(entry) })
        .collect()
}

fn utf8(bytes: &[u8]) -> Result<&str> {
    core::str::from_utf8(bytes).map_err(|err| {
        Error::Marshaling(format!(
            "invalid utf-8 after {} valid bytes",
            err.valid_up_to()
        ))
    })
}
