//! Content-level truncation that respects UTF-8 boundaries.

use std::borrow::Cow;

/// Largest index `<= max` that lies on a char boundary of `s`.
pub fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut idx = max;
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Cut `s` to at most `max_bytes` bytes, marker included.
///
/// The kept head is followed by `[truncated: N bytes total, M omitted]`. When
/// `max_bytes` cannot even hold the marker, the marker alone is returned.
pub fn truncate_text(s: &str, max_bytes: usize) -> Cow<'_, str> {
    if s.len() <= max_bytes {
        return Cow::Borrowed(s);
    }

    // The omitted count changes the marker length; size it for the worst case.
    let worst_marker = marker(s.len(), s.len());
    let budget = max_bytes.saturating_sub(worst_marker.len());
    let keep = floor_char_boundary(s, budget);
    let head = s.get(..keep).unwrap_or_default();
    Cow::Owned(format!("{head}{}", marker(s.len(), s.len() - keep)))
}

fn marker(total: usize, omitted: usize) -> String {
    format!("\n[truncated: {total} bytes total, {omitted} omitted]")
}
