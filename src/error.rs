//! Typed error taxonomy for lifecycle operations.
//!
//! Expected, user-recoverable outcomes (bad credentials, lockouts, rate
//! limits) are dedicated variants so callers can produce precise messaging
//! without this crate ever leaking which factor actually failed.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    /// Malformed input; the caller's fault, never retried by the core.
    #[error("invalid input: {0}")]
    Validation(String),

    /// No account with the given id.
    #[error("account not found")]
    NotFound,

    /// A unique field (contact, OAuth identity) is already taken.
    #[error("conflict on unique field")]
    Conflict,

    /// An email/password account already exists for the OAuth email.
    /// Whether to link or reject is the calling product's decision.
    #[error("account with this email already exists under another provider")]
    LinkingConflict,

    /// Deliberately undifferentiated between "no such account",
    /// "wrong password", and "account not eligible for login".
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Account is locked out; retry after the remaining duration.
    #[error("account locked for {remaining_seconds}s")]
    Locked { remaining_seconds: i64 },

    /// Too many attempts against the outstanding one-time code.
    #[error("rate limited")]
    RateLimited,

    /// The hashing worker pool is saturated; shed instead of queueing.
    #[error("too many concurrent credential operations")]
    Throttled,

    /// Token is malformed, unknown, or fails signature validation.
    #[error("invalid token")]
    InvalidToken,

    /// Token (access or refresh) is past its expiry.
    #[error("token expired")]
    TokenExpired,

    /// An already-rotated refresh token was presented again. The whole
    /// device token family has been revoked.
    #[error("refresh token reuse detected")]
    TokenReuse,

    /// Optimistic-concurrency retries exhausted; caller should re-read
    /// fresh state and retry.
    #[error("concurrent update conflict")]
    Concurrency,

    /// Notification collaborator failure; non-fatal to the triggering
    /// operation but reported distinctly for monitoring.
    #[error("notification delivery failed")]
    DeliveryFailed,

    /// Collaborator timed out mid-write; the operation may or may not
    /// have committed. Safe to retry idempotent operations.
    #[error("operation outcome unknown")]
    Unknown,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locked_error_reports_remaining() {
        let err = AuthError::Locked {
            remaining_seconds: 42,
        };
        assert_eq!(err.to_string(), "account locked for 42s");
    }

    #[test]
    fn invalid_credentials_is_generic() {
        // The message must not reveal which factor failed.
        assert_eq!(
            AuthError::InvalidCredentials.to_string(),
            "invalid credentials"
        );
    }
}
