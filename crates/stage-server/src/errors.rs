//! Stage server error types.
//!
//! Error types map to wire `ErrorCode` values for client responses. Internal
//! details are logged server-side but not exposed to clients.

use stage_protocol::{ErrorCode, ErrorPayload};
use thiserror::Error;

/// Stage server error type.
#[derive(Debug, Error)]
pub enum StageError {
    /// Identity token validation failed.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Stage not found.
    #[error("Stage not found: {0}")]
    StageNotFound(String),

    /// Participant not found.
    #[error("Participant not found: {0}")]
    ParticipantNotFound(String),

    /// Transport not found (or not owned by the requester).
    #[error("Transport not found: {0}")]
    TransportNotFound(String),

    /// Producer not found.
    #[error("Producer not found: {0}")]
    ProducerNotFound(String),

    /// Consumer not found (or not owned by the requester).
    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    /// Supplied stage password does not match.
    #[error("Wrong stage password")]
    WrongPassword,

    /// External media engine call failed.
    #[error("Engine error: {0}")]
    Engine(String),

    /// Operation conflicts with current session state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Signaling connection failed or closed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StageError {
    /// Wire error code for this error.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            StageError::Authentication(_) => ErrorCode::Authentication,
            StageError::StageNotFound(_)
            | StageError::ParticipantNotFound(_)
            | StageError::TransportNotFound(_)
            | StageError::ProducerNotFound(_)
            | StageError::ConsumerNotFound(_) => ErrorCode::NotFound,
            StageError::WrongPassword => ErrorCode::Permission,
            StageError::Engine(_) => ErrorCode::Engine,
            StageError::Conflict(_) => ErrorCode::Conflict,
            StageError::Connection(_) => ErrorCode::Connection,
            StageError::Config(_) | StageError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            StageError::Authentication(_) => "Invalid or expired identity token".to_string(),
            StageError::StageNotFound(_) => "Stage not found".to_string(),
            StageError::ParticipantNotFound(_) => "Participant not found".to_string(),
            StageError::TransportNotFound(_) => "Transport not found".to_string(),
            StageError::ProducerNotFound(_) => "Producer not found".to_string(),
            StageError::ConsumerNotFound(_) => "Consumer not found".to_string(),
            StageError::WrongPassword => "Wrong stage password".to_string(),
            StageError::Engine(_) => "Media engine operation failed".to_string(),
            StageError::Conflict(msg) => msg.clone(),
            StageError::Config(_) | StageError::Internal(_) => {
                "An internal error occurred".to_string()
            }
            StageError::Connection(_) => "Connection error".to_string(),
        }
    }

    /// Wire error payload for a client response.
    #[must_use]
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload::new(self.error_code(), self.client_message())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            StageError::Authentication("bad sig".to_string()).error_code(),
            ErrorCode::Authentication
        );
        assert_eq!(
            StageError::StageNotFound("stage-1".to_string()).error_code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            StageError::TransportNotFound("t-1".to_string()).error_code(),
            ErrorCode::NotFound
        );
        assert_eq!(StageError::WrongPassword.error_code(), ErrorCode::Permission);
        assert_eq!(
            StageError::Engine("produce failed".to_string()).error_code(),
            ErrorCode::Engine
        );
        assert_eq!(
            StageError::Conflict("already in a stage".to_string()).error_code(),
            ErrorCode::Conflict
        );
        assert_eq!(
            StageError::Internal("oops".to_string()).error_code(),
            ErrorCode::Internal
        );
    }

    #[test]
    fn test_client_messages_hide_internal_details() {
        let err = StageError::Engine("router 10.0.0.3 rejected produce".to_string());
        assert!(!err.client_message().contains("10.0.0.3"));

        let err = StageError::Internal("lock poisoned in registry".to_string());
        assert_eq!(err.client_message(), "An internal error occurred");

        let err = StageError::Authentication("kid mismatch for key-7".to_string());
        assert!(!err.client_message().contains("key-7"));
    }

    #[test]
    fn test_payload_round_trip() {
        let payload = StageError::WrongPassword.to_payload();
        assert_eq!(payload.code, ErrorCode::Permission);
        assert_eq!(payload.message, "Wrong stage password");
    }
}
