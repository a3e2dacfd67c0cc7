//! Byte/string conversions at the host↔guest boundary.
//!
//! Request and response bodies cross the boundary as JavaScript strings
//! in which each byte of the original payload occupies one code point
//! (the WHATWG `atob`/`btoa` convention), so arbitrary binary bodies
//! survive the trip.

/// Widens raw bytes into a string with one char per byte.
pub fn latin1_to_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Narrows a string back into bytes, one byte per char. Returns `None`
/// if any code point is above U+00FF.
pub fn string_to_latin1(s: &str) -> Option<Vec<u8>> {
    s.chars()
        .map(|c| u8::try_from(u32::from(c)).ok())
        .collect()
}
