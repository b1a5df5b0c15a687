//! Single-range `Range` header handling for binary bodies.

use std::sync::OnceLock;

use regex::Regex;

/// What to send for a binary body of a given length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOutcome {
    /// Send the whole body with 200.
    Full,
    /// Send `start..=end` with 206.
    Partial { start: usize, end: usize },
    /// Reply 416 with `Content-Range: bytes */len`.
    Unsatisfiable,
}

fn range_regex() -> &'static Regex {
    static RANGE: OnceLock<Regex> = OnceLock::new();
    RANGE.get_or_init(|| Regex::new(r"^bytes=(\d+)?-(\d+)?$").expect("static regex"))
}

/// Evaluate a `Range` header against a body of `len` bytes.
///
/// Malformed headers and inverted ranges are ignored. A range that covers
/// the whole body is treated as no range at all.
pub fn evaluate(header: Option<&str>, len: usize) -> RangeOutcome {
    let Some(header) = header else {
        return RangeOutcome::Full;
    };
    let Some(caps) = range_regex().captures(header.trim()) else {
        return RangeOutcome::Full;
    };

    let first = caps.get(1).and_then(|m| m.as_str().parse::<usize>().ok());
    let last = caps.get(2).and_then(|m| m.as_str().parse::<usize>().ok());

    let (start, end) = match (first, last) {
        (None, None) => return RangeOutcome::Full,
        (Some(start), None) => (start, len.saturating_sub(1)),
        (Some(start), Some(end)) => {
            if end < start {
                return RangeOutcome::Full;
            }
            (start, end.min(len.saturating_sub(1)))
        }
        // Suffix range: the last `n` bytes.
        (None, Some(n)) => {
            if n == 0 {
                return RangeOutcome::Unsatisfiable;
            }
            (len.saturating_sub(n), len.saturating_sub(1))
        }
    };

    if start >= len {
        return RangeOutcome::Unsatisfiable;
    }
    if start == 0 && end + 1 >= len {
        return RangeOutcome::Full;
    }
    RangeOutcome::Partial { start, end }
}

/// `Content-Range` value for a partial reply.
pub fn content_range(start: usize, end: usize, len: usize) -> String {
    format!("bytes {}-{}/{}", start, end, len)
}

/// `Content-Range` value for a 416 reply.
pub fn unsatisfiable_range(len: usize) -> String {
    format!("bytes */{}", len)
}
