//! Structural validation of accessor paths.
//!
//! A path is an identifier followed by any number of `.ident`,
//! `["..."]`, `['...']`, or `[123]` segments. No whitespace, no leading
//! dots, no empty brackets; quoted segments may be empty strings but must
//! close with the same quote.

use crate::error::{Error, Result};

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b == b'$'
}

fn is_ident_continue(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

/// Scan an identifier starting at `i`; returns the index one past it.
fn scan_ident(bytes: &[u8], i: usize) -> Option<usize> {
    if i >= bytes.len() || !is_ident_start(bytes[i]) {
        return None;
    }
    let mut j = i + 1;
    while j < bytes.len() && is_ident_continue(bytes[j]) {
        j += 1;
    }
    Some(j)
}

/// Scan a bracketed segment starting at the `[` at `i`; returns the index
/// one past the closing `]`.
fn scan_bracket(bytes: &[u8], i: usize) -> Option<usize> {
    let mut j = i + 1;
    match bytes.get(j).copied() {
        Some(q) if q == b'"' || q == b'\'' => {
            j += 1;
            while j < bytes.len() && bytes[j] != q {
                j += 1;
            }
            if j >= bytes.len() {
                return None;
            }
            j += 1;
            (bytes.get(j) == Some(&b']')).then_some(j + 1)
        }
        Some(b'0'..=b'9') => {
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            (bytes.get(j) == Some(&b']')).then_some(j + 1)
        }
        _ => None,
    }
}

/// Validate `path` against the accessor grammar.
pub(crate) fn validate(path: &str) -> Result<()> {
    let bytes = path.as_bytes();
    let invalid = || Error::InvalidPath(path.to_string());

    let mut i = scan_ident(bytes, 0).ok_or_else(invalid)?;
    while i < bytes.len() {
        i = match bytes[i] {
            b'.' => scan_ident(bytes, i + 1).ok_or_else(invalid)?,
            b'[' => scan_bracket(bytes, i).ok_or_else(invalid)?,
            _ => return Err(invalid()),
        };
    }
    Ok(())
}
