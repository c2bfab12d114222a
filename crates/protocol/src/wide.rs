//! UTF-16 ID strings as exchanged by PnP bus queries
//!
//! Single IDs (device ID, instance ID) are NUL-terminated; ID lists
//! (hardware IDs, compatible IDs) are a sequence of NUL-terminated strings
//! closed by an extra NUL.

use crate::error::{ProtocolError, Result};
use widestring::{U16CStr, U16CString};

/// Encode a NUL-terminated wide string
///
/// Anything after an interior NUL is dropped.
pub fn to_wide_sz(s: &str) -> Vec<u16> {
    U16CString::from_str_truncate(s).into_vec_with_nul()
}

/// Encode a double-NUL-terminated list of wide strings
pub fn to_wide_multi_sz<S: AsRef<str>>(items: &[S]) -> Vec<u16> {
    let mut out = Vec::new();
    for item in items {
        out.extend_from_slice(U16CString::from_str_truncate(item).as_slice_with_nul());
    }
    if items.is_empty() {
        out.push(0);
    }
    out.push(0);
    out
}

fn first_sz(buf: &[u16]) -> Result<&U16CStr> {
    U16CStr::from_slice_truncate(buf)
        .map_err(|_| ProtocolError::UnterminatedString { units: buf.len() })
}

/// Entries of a multi-string and its length with both terminators
fn multi_sz_entries(buf: &[u16]) -> Result<(Vec<&U16CStr>, usize)> {
    let mut entries = Vec::new();
    let mut offset = 0;
    loop {
        let entry = U16CStr::from_slice_truncate(&buf[offset..])
            .map_err(|_| ProtocolError::UnterminatedString { units: buf.len() })?;
        offset += entry.len() + 1;
        if entry.is_empty() {
            // A list with no entries is written as two NULs
            if entries.is_empty() && buf.get(offset) == Some(&0) {
                offset += 1;
            }
            return Ok((entries, offset));
        }
        entries.push(entry);
    }
}

/// Length in code units of a NUL-terminated string, terminator included
pub fn sz_len(buf: &[u16]) -> Result<usize> {
    first_sz(buf).map(|sz| sz.len() + 1)
}

/// Length in code units of a multi-string, both terminators included
pub fn multi_sz_len(buf: &[u16]) -> Result<usize> {
    multi_sz_entries(buf).map(|(_, len)| len)
}

/// Decode a NUL-terminated wide string
pub fn from_wide_sz(buf: &[u16]) -> Result<String> {
    first_sz(buf)?
        .to_string()
        .map_err(|_| ProtocolError::InvalidUtf16)
}

/// Decode a double-NUL-terminated list of wide strings
pub fn from_wide_multi_sz(buf: &[u16]) -> Result<Vec<String>> {
    let (entries, _) = multi_sz_entries(buf)?;
    entries
        .into_iter()
        .map(|entry| entry.to_string().map_err(|_| ProtocolError::InvalidUtf16))
        .collect()
}
