//! Synchronous input checks run before any request is made

use regex::Regex;
use std::sync::LazyLock;

/// Minimum accepted password length
pub const MIN_PASSWORD_LENGTH: usize = 3;

/// Prefix of tickets issued for a TOTP second factor
pub const MFA_TOTP_TICKET_PREFIX: &str = "mfaTotp:";

static RE_EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@.]+$").expect("email pattern is valid")
});

/// Whether `email` looks like an email address
#[must_use]
pub fn is_valid_email(email: &str) -> bool {
    RE_EMAIL.is_match(email)
}

/// Whether `password` is long enough to be worth sending
#[must_use]
pub fn is_valid_password(password: &str) -> bool {
    password.chars().count() >= MIN_PASSWORD_LENGTH
}

/// Whether `ticket` has the shape of a TOTP challenge ticket
#[must_use]
pub fn is_valid_mfa_ticket(ticket: &str) -> bool {
    ticket
        .strip_prefix(MFA_TOTP_TICKET_PREFIX)
        .is_some_and(|id| !id.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email() {
        assert!(is_valid_email("jane@example.com"));
        assert!(is_valid_email("jane+tag@sub.example.co"));
        assert!(!is_valid_email("bad-email"));
        assert!(!is_valid_email("jane@example"));
        assert!(!is_valid_email("jane doe@example.com"));
        assert!(!is_valid_email(""));
    }

    #[test]
    fn test_password() {
        assert!(is_valid_password("abc"));
        assert!(!is_valid_password("x"));
        assert!(!is_valid_password(""));
        // counted in characters, not bytes
        assert!(!is_valid_password("éé"));
    }

    #[test]
    fn test_mfa_ticket() {
        assert!(is_valid_mfa_ticket("mfaTotp:0b6c7a52-93f1-4a0e-8d7b-3f1e2c4d5a6b"));
        assert!(!is_valid_mfa_ticket("mfaTotp:"));
        assert!(!is_valid_mfa_ticket("0b6c7a52-93f1-4a0e-8d7b-3f1e2c4d5a6b"));
        assert!(!is_valid_mfa_ticket(""));
    }
}
