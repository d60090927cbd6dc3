//! # Frame Sanitizer
//!
//! The firmware formats floats with `printf`, so a dead sensor shows up as a
//! bare `nan`, `NaN`, `inf` or `-inf` where a JSON number belongs. Those
//! tokens are not valid JSON. [`sanitize`] rewrites them to `null` so the
//! frame decodes with the affected fields empty.
//!
//! Only bare tokens are rewritten. Text inside quoted strings is left alone,
//! so a status string such as `"inference"` survives intact.
//!
//! ```
//! use suspension_tuner::telemetry::sanitize::sanitize;
//!
//! assert_eq!(sanitize(r#"{"roll":nan,"pitch":-inf}"#), r#"{"roll":null,"pitch":null}"#);
//! assert_eq!(sanitize(r#"{"msg":"nan"}"#), r#"{"msg":"nan"}"#);
//! ```

use std::borrow::Cow;

/// Non-finite spellings the firmware may emit, matched case-insensitively.
const NON_FINITE_TOKENS: &[&str] = &["nan", "inf"];

/// Replaces unquoted non-finite numeric tokens with `null`.
///
/// Returns the input unchanged (borrowed) when nothing needed rewriting.
#[must_use]
pub fn sanitize(payload: &str) -> Cow<'_, str> {
    let bytes = payload.as_bytes();
    let mut out: Option<String> = None;
    let mut copied_up_to = 0;
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];

        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        if b == b'"' {
            in_string = true;
            i += 1;
            continue;
        }

        if let Some(len) = non_finite_at(bytes, i) {
            let buf = out.get_or_insert_with(|| String::with_capacity(payload.len()));
            buf.push_str(&payload[copied_up_to..i]);
            buf.push_str("null");
            i += len;
            copied_up_to = i;
            continue;
        }

        i += 1;
    }

    match out {
        Some(mut buf) => {
            buf.push_str(&payload[copied_up_to..]);
            Cow::Owned(buf)
        }
        None => Cow::Borrowed(payload),
    }
}

/// If a standalone non-finite token (optionally negated) starts at `i`,
/// returns its length in bytes.
fn non_finite_at(bytes: &[u8], i: usize) -> Option<usize> {
    if i > 0 && is_word_byte(bytes[i - 1]) {
        return None;
    }

    let sign = usize::from(bytes[i] == b'-');
    let rest = &bytes[i + sign..];

    NON_FINITE_TOKENS.iter().find_map(|token| {
        let len = token.len();
        let matches = rest.len() >= len
            && rest[..len].eq_ignore_ascii_case(token.as_bytes())
            && rest.get(len).map_or(true, |&next| !is_word_byte(next));
        matches.then_some(sign + len)
    })
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'.'
}
