//! Classification of backend failures
//!
//! Every flow (sign-in, sign-up, refresh, change-email, change-password)
//! funnels its failure through [`classify`], so the machine's transition
//! logic only ever branches on [`ErrorCategory`] and [`ErrorField`].

use serde::{Deserialize, Serialize};

/// Status used for failures that never reached the backend
pub const NETWORK_ERROR_CODE: u16 = 0;
/// Status used for input rejected before any request was made
pub const VALIDATION_ERROR_CODE: u16 = 10;

/// Error code for a malformed email address
pub const INVALID_EMAIL_ERROR: &str = "invalid-email";
/// Error code for a password that fails local checks
pub const INVALID_PASSWORD_ERROR: &str = "invalid-password";
/// Error code for a refresh token rejected as malformed
pub const INVALID_REFRESH_TOKEN_ERROR: &str = "invalid-refresh-token";
/// Error code for an MFA sign-in without a ticket
pub const NO_MFA_TICKET_ERROR: &str = "no-mfa-ticket";
/// Error code for an MFA ticket that is not a TOTP ticket
pub const INVALID_MFA_TICKET_ERROR: &str = "invalid-mfa-ticket";
/// Error code for a request that did not complete
pub const NETWORK_ERROR: &str = "network-error";

// ============================================================================
// Backend Error Payload
// ============================================================================

/// Error payload as returned by the backend (`{ error: { status, error, message } }`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendError {
    /// HTTP status, or one of the local pseudo-statuses
    #[serde(default)]
    pub status: u16,
    /// Machine-readable error code
    pub error: String,
    /// Human-readable message
    #[serde(default)]
    pub message: String,
}

impl BackendError {
    /// Create an error payload
    pub fn new(status: u16, error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            message: message.into(),
        }
    }

    /// Failure to reach the backend at all
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(NETWORK_ERROR_CODE, NETWORK_ERROR, message)
    }

    /// Malformed email detected locally
    #[must_use]
    pub fn invalid_email() -> Self {
        Self::new(
            VALIDATION_ERROR_CODE,
            INVALID_EMAIL_ERROR,
            "Email is incorrectly formatted",
        )
    }

    /// Password rejected by local checks
    #[must_use]
    pub fn invalid_password() -> Self {
        Self::new(
            VALIDATION_ERROR_CODE,
            INVALID_PASSWORD_ERROR,
            "Password is incorrectly formatted",
        )
    }

    /// Empty or malformed refresh token
    #[must_use]
    pub fn invalid_refresh_token() -> Self {
        Self::new(
            VALIDATION_ERROR_CODE,
            INVALID_REFRESH_TOKEN_ERROR,
            "Invalid or expired refresh token",
        )
    }

    /// MFA sign-in attempted with no ticket to answer
    #[must_use]
    pub fn no_mfa_ticket() -> Self {
        Self::new(
            VALIDATION_ERROR_CODE,
            NO_MFA_TICKET_ERROR,
            "No MFA ticket has been provided",
        )
    }

    /// MFA ticket with the wrong shape
    #[must_use]
    pub fn invalid_mfa_ticket() -> Self {
        Self::new(
            VALIDATION_ERROR_CODE,
            INVALID_MFA_TICKET_ERROR,
            "MFA ticket is invalid",
        )
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.error, self.status, self.message)
    }
}

impl std::error::Error for BackendError {}

// ============================================================================
// Classification
// ============================================================================

/// Broad category of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Bad input, detectable on the client; never retried
    Validation,
    /// Backend rejected the request
    Server,
    /// Backend could not be reached or did not answer in time
    Network,
}

/// Input field a validation error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorField {
    /// The email address
    Email,
    /// The password
    Password,
}

/// A backend failure together with its classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedError {
    /// Broad category
    pub category: ErrorCategory,
    /// Offending input field, for validation errors
    pub field: Option<ErrorField>,
    /// Original payload
    pub payload: BackendError,
}

impl ClassifiedError {
    /// Whether the failure means the user exists but has not verified their email
    #[must_use]
    pub fn is_unverified(&self) -> bool {
        self.payload.status == 401
            && (self.payload.error == "unverified-user"
                || self.payload.message == "Email is not verified")
    }

    /// Whether the failure is worth retrying after a delay
    ///
    /// Network failures always are; 5xx responses are treated the same way,
    /// since the backend may be restarting.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.category == ErrorCategory::Network || self.payload.status >= 500
    }
}

impl From<BackendError> for ClassifiedError {
    fn from(payload: BackendError) -> Self {
        classify(payload)
    }
}

impl std::fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} error: {}", self.category, self.payload)
    }
}

/// Map a backend error payload onto a category
///
/// The mapping is closed: codes it does not know are `Server`.
#[must_use]
pub fn classify(payload: BackendError) -> ClassifiedError {
    let (category, field) = match (payload.status, payload.error.as_str()) {
        (NETWORK_ERROR_CODE, _) | (_, NETWORK_ERROR | "timeout") => (ErrorCategory::Network, None),
        (502..=504, _) => (ErrorCategory::Network, None),
        (_, INVALID_EMAIL_ERROR) => (ErrorCategory::Validation, Some(ErrorField::Email)),
        (_, INVALID_PASSWORD_ERROR | "password-too-short" | "password-in-hibp-database") => {
            (ErrorCategory::Validation, Some(ErrorField::Password))
        }
        (VALIDATION_ERROR_CODE, _) => (ErrorCategory::Validation, None),
        _ => (ErrorCategory::Server, None),
    };
    ClassifiedError {
        category,
        field,
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_failures() {
        let err = classify(BackendError::network("connection refused"));
        assert_eq!(err.category, ErrorCategory::Network);
        assert!(err.is_transient());

        for status in [502, 503, 504] {
            let err = classify(BackendError::new(status, "bad-gateway", "upstream"));
            assert_eq!(err.category, ErrorCategory::Network, "status {status}");
        }
    }

    #[test]
    fn test_validation_fields() {
        let err = classify(BackendError::invalid_email());
        assert_eq!(err.category, ErrorCategory::Validation);
        assert_eq!(err.field, Some(ErrorField::Email));

        let err = classify(BackendError::new(400, "password-too-short", "too short"));
        assert_eq!(err.category, ErrorCategory::Validation);
        assert_eq!(err.field, Some(ErrorField::Password));

        let err = classify(BackendError::invalid_refresh_token());
        assert_eq!(err.category, ErrorCategory::Validation);
        assert_eq!(err.field, None);
    }

    #[test]
    fn test_unknown_codes_are_server() {
        let err = classify(BackendError::new(401, "invalid-email-password", "wrong"));
        assert_eq!(err.category, ErrorCategory::Server);
        assert!(!err.is_transient());

        let err = classify(BackendError::new(418, "teapot", "short and stout"));
        assert_eq!(err.category, ErrorCategory::Server);

        let err = classify(BackendError::new(500, "internal-error", "boom"));
        assert_eq!(err.category, ErrorCategory::Server);
        assert!(err.is_transient());
    }

    #[test]
    fn test_email_conflict_is_server() {
        let err = classify(BackendError::new(409, "email-already-in-use", "taken"));
        assert_eq!(err.category, ErrorCategory::Server);
    }

    #[test]
    fn test_unverified_detection() {
        let err = classify(BackendError::new(401, "unverified-user", "Email not verified"));
        assert!(err.is_unverified());

        let legacy = classify(BackendError::new(401, "unauthenticated", "Email is not verified"));
        assert!(legacy.is_unverified());

        let other = classify(BackendError::new(403, "unverified-user", "forbidden"));
        assert!(!other.is_unverified());
    }
}
