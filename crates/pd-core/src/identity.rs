//! Semantic identities: `project[:stack[:context]]`.
//!
//! The same segment grammar backs service ids, lock names, webhook filter
//! patterns, and activity target filters, and the glob-to-`LIKE` translation
//! here is the single implementation all of them share.

use serde_json::json;

use crate::error::{CoreError, CoreResult, ErrorCode};

const MAX_SEGMENTS: usize = 3;
const MAX_SEGMENT_LEN: usize = 64;

/// A parsed identity. `canonical` is the input as written; defaults applied
/// by [`Identity::normalize`] never reshape it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub segments: Vec<String>,
    pub canonical: String,
    pub has_wildcard: bool,
}

impl Identity {
    /// Parses and validates. Empty input, more than three segments, an empty
    /// segment between colons, over-length segments, and characters outside
    /// `[A-Za-z0-9._*-]` all fail with `IDENTITY_INVALID`.
    pub fn parse(input: &str) -> CoreResult<Identity> {
        if input.is_empty() {
            return Err(invalid(input, "identity is empty"));
        }
        let segments: Vec<&str> = input.split(':').collect();
        if segments.len() > MAX_SEGMENTS {
            return Err(invalid(input, "identity has more than 3 segments"));
        }
        for segment in &segments {
            if segment.is_empty() {
                return Err(invalid(input, "identity has an empty segment"));
            }
            if segment.len() > MAX_SEGMENT_LEN {
                return Err(invalid(input, "identity segment exceeds 64 characters"));
            }
            if !segment.bytes().all(is_segment_byte) {
                return Err(invalid(input, "identity contains forbidden characters"));
            }
        }

        let has_wildcard = segments.iter().any(|s| *s == "*");
        Ok(Identity {
            segments: segments.into_iter().map(str::to_owned).collect(),
            canonical: input.to_owned(),
            has_wildcard,
        })
    }

    /// Segment-wise glob match. A `*` pattern segment matches any one
    /// segment; a shorter pattern matches every identity sharing its prefix;
    /// a longer pattern never matches. Case-sensitive.
    pub fn matches(pattern: &Identity, id: &Identity) -> bool {
        if pattern.segments.len() > id.segments.len() {
            return false;
        }
        pattern
            .segments
            .iter()
            .zip(&id.segments)
            .all(|(p, s)| p == "*" || p == s)
    }

    /// Returns the parsed fields with missing `stack`/`context` filled from
    /// the defaults. The canonical string stays exactly as parsed.
    pub fn normalize(&self, stack: Option<&str>, context: Option<&str>) -> NormalizedIdentity {
        NormalizedIdentity {
            project: self.segments[0].clone(),
            stack: self
                .segments
                .get(1)
                .cloned()
                .or_else(|| stack.map(str::to_owned)),
            context: self
                .segments
                .get(2)
                .cloned()
                .or_else(|| context.map(str::to_owned)),
            canonical: self.canonical.clone(),
        }
    }
}

/// [`Identity::normalize`] output: filled fields, untouched canonical form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedIdentity {
    pub project: String,
    pub stack: Option<String>,
    pub context: Option<String>,
    pub canonical: String,
}

/// Translates a wildcard pattern to a SQL `LIKE` expression: each `*` segment
/// becomes `%`, literal segments and colons are preserved. `None` when the
/// pattern does not parse as an identity.
pub fn pattern_to_like(pattern: &str) -> Option<String> {
    let parsed = Identity::parse(pattern).ok()?;
    Some(
        parsed
            .segments
            .iter()
            .map(|s| if s == "*" { "%" } else { s.as_str() })
            .collect::<Vec<_>>()
            .join(":"),
    )
}

fn is_segment_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'*' | b'-')
}

fn invalid(input: &str, message: &str) -> CoreError {
    CoreError::with_details(
        ErrorCode::IdentityInvalid,
        message,
        json!({ "identity": input }),
    )
}
