//! Inline script fingerprinting.

use crate::types::InlineScriptEntry;
use std::collections::BTreeSet;

/// Maximum number of characters kept as an inline snippet.
pub const SNIPPET_CHARS: usize = 100;

/// Order-sensitive polynomial hash (base 31) over UTF-16 code units with
/// 32-bit wraparound. The empty string maps to 0.
///
/// Not cryptographic: a collision only makes two bodies count as one.
pub fn fingerprint(text: &str) -> i32 {
    text.encode_utf16()
        .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(unit as i32))
}

/// Bounded prefix of `body` on a char boundary.
pub fn snippet(body: &str) -> String {
    body.chars().take(SNIPPET_CHARS).collect()
}

/// Build an inline entry for a script body.
///
/// Returns `None` for bodies that are empty after trimming.
pub fn inline_entry(body: &str, suspicious_signals: BTreeSet<String>) -> Option<InlineScriptEntry> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }

    Some(InlineScriptEntry {
        hash: fingerprint(body),
        snippet: snippet(body),
        suspicious_signals,
        length: body.chars().count(),
    })
}
