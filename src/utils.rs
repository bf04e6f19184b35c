//! Utility functions for the session engine
//!
//! Safe string handling that respects UTF-8 boundaries, and redaction of
//! secrets before they reach logs or `Debug` output.

/// Number of leading characters of a secret kept by [`redact`]
const REDACT_VISIBLE_BYTES: usize = 6;

/// Safely truncate a string at a UTF-8 character boundary.
///
/// Returns a slice of at most `max_bytes` bytes, ensuring the result
/// is valid UTF-8 by finding the last valid character boundary.
///
/// # Example
/// ```
/// use hasura_auth_session::utils::safe_truncate;
///
/// // Emoji is 4 bytes - truncating at byte 10 would cut it in half
/// let text = "Status: 🔍 Active";
/// let result = safe_truncate(text, 10);
/// assert_eq!(result, "Status: "); // Stops before the emoji
/// ```
#[inline]
#[must_use]
pub fn safe_truncate(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }

    let mut boundary = max_bytes;
    while boundary > 0 && !s.is_char_boundary(boundary) {
        boundary -= 1;
    }

    &s[..boundary]
}

/// Truncate a string for display with ellipsis.
///
/// # Example
/// ```
/// use hasura_auth_session::utils::truncate_for_display;
///
/// let text = "This is a long message";
/// let result = truncate_for_display(text, 10);
/// assert_eq!(result, "This is a ...");
/// ```
#[must_use]
pub fn truncate_for_display(s: &str, max_bytes: usize) -> String {
    let truncated = safe_truncate(s, max_bytes);
    if truncated.len() < s.len() {
        format!("{truncated}...")
    } else {
        truncated.to_string()
    }
}

/// Redact a token for logs, keeping a short prefix for correlation.
///
/// Short secrets are fully masked so that no meaningful fraction leaks.
///
/// # Example
/// ```
/// use hasura_auth_session::utils::redact;
///
/// assert_eq!(redact("eyJhbGciOiJIUzI1NiJ9.payload.sig"), "eyJhbG…[32 bytes]");
/// assert_eq!(redact("short"), "[redacted]");
/// assert_eq!(redact(""), "[empty]");
/// ```
#[must_use]
pub fn redact(secret: &str) -> String {
    if secret.is_empty() {
        return "[empty]".to_string();
    }
    if secret.len() <= REDACT_VISIBLE_BYTES * 2 {
        return "[redacted]".to_string();
    }
    format!(
        "{}…[{} bytes]",
        safe_truncate(secret, REDACT_VISIBLE_BYTES),
        secret.len()
    )
}
