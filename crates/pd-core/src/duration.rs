//! Duration parsing for TTLs and expiries.
//!
//! Inputs are either a raw millisecond count or a compact token string such
//! as `1d2h30m45s`. Tokens are scanned, not grammar-checked: `"1h 30m"`
//! parses as 90 minutes because the gap is skipped, while `"1 h"` yields
//! nothing because the digit and unit are separated. `None` is an
//! input-level signal (no parseable duration), not an error.

use serde::Deserialize;

const MAX_INPUT_LEN: usize = 50;

/// A caller-supplied duration: milliseconds or a token string. JSON numbers
/// deserialize as `Millis` so non-finite values can be rejected explicitly.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DurationInput {
    Millis(f64),
    Text(String),
}

/// Parses a [`DurationInput`]. Finite numbers are returned verbatim
/// (negative values included; tests use them for immediate expiry).
/// Non-finite numbers return `None`.
pub fn parse_duration(input: &DurationInput) -> Option<i64> {
    match input {
        DurationInput::Millis(ms) if ms.is_finite() => Some(*ms as i64),
        DurationInput::Millis(_) => None,
        DurationInput::Text(text) => parse_duration_str(text),
    }
}

/// Scans a string for `<digits><s|m|h|d>` tokens and sums them in
/// milliseconds. No tokens, a zero sum, or over-length input all yield
/// `None`.
pub fn parse_duration_str(input: &str) -> Option<i64> {
    if input.len() > MAX_INPUT_LEN {
        return None;
    }

    let bytes = input.as_bytes();
    let mut total: i64 = 0;
    let mut matched = false;
    let mut i = 0;

    while i < bytes.len() {
        if !bytes[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        let Some(&unit) = bytes.get(i) else { break };
        let scale = match unit {
            b's' => 1_000,
            b'm' => 60_000,
            b'h' => 3_600_000,
            b'd' => 86_400_000,
            _ => continue,
        };
        let value: i64 = input[start..i].parse().ok()?;
        total = total.checked_add(value.checked_mul(scale)?)?;
        matched = true;
        i += 1;
    }

    if !matched || total == 0 {
        None
    } else {
        Some(total)
    }
}
