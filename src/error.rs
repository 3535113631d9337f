//! Error types for SSO correlation and callback handling.

use thiserror::Error;

/// Result type for SSO operations.
pub type SsoResult<T> = Result<T, SsoError>;

/// Generic message returned to end users for any non-benign failure.
pub const PUBLIC_FAILURE_MESSAGE: &str = "Authentication failed";

/// SSO errors.
#[derive(Debug, Error)]
pub enum SsoError {
    /// IdP response failed validation (status, signature, timing, audience, replay).
    #[error("Invalid assertion: {0}")]
    InvalidAssertion(String),

    /// No correlation entry exists for the token (forged, expired or already consumed).
    #[error("Unknown correlation token")]
    UnknownToken,

    /// The correlation entry already holds an assertion.
    #[error("Correlation token already asserted")]
    AlreadyAsserted,

    /// A freshly generated token collided with an existing entry.
    #[error("Duplicate correlation token")]
    DuplicateToken,

    /// The correlation token is not a well-formed opaque value.
    #[error("Malformed correlation token")]
    InvalidToken,

    /// A collaborator (redirect builder, IdP integration) failed.
    #[error("Collaborator failure: {0}")]
    Collaborator(#[from] anyhow::Error),

    /// Missing or invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SsoError {
    /// Whether the caller should silently start a new login attempt.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::UnknownToken | Self::InvalidToken)
    }

    /// Message safe to show the end user.
    pub fn public_message(&self) -> &'static str {
        if self.is_benign() {
            "Login session expired, please sign in again"
        } else {
            PUBLIC_FAILURE_MESSAGE
        }
    }

    /// Short machine-readable reason code for audit logs.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::InvalidAssertion(_) => "SSO_INVALID_ASSERTION",
            Self::UnknownToken => "SSO_UNKNOWN_TOKEN",
            Self::AlreadyAsserted => "SSO_ALREADY_ASSERTED",
            Self::DuplicateToken => "SSO_DUPLICATE_TOKEN",
            Self::InvalidToken => "SSO_INVALID_TOKEN",
            Self::Collaborator(_) => "SSO_COLLABORATOR_FAILED",
            Self::Config(_) => "SSO_CONFIG",
        }
    }
}
