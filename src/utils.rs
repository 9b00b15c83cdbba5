//! Utility functions for the helena-ble crate.

use std::fmt::Write;

/// Render bytes as space-separated upper-case hex pairs.
///
/// Every byte is followed by a single space, including the last one, which
/// matches the historical wire-debugging format.
///
/// # Example
///
/// ```
/// use helena_ble::hex_pairs;
///
/// assert_eq!(hex_pairs(&[0x01, 0x02, 0x0A]), "01 02 0A ");
/// assert_eq!(hex_pairs(&[]), "");
/// ```
pub fn hex_pairs(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for byte in data {
        // Writing to a String cannot fail.
        let _ = write!(out, "{:02X} ", byte);
    }
    out
}
