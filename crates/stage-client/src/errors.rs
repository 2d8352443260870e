//! Client session error types.

use stage_protocol::{ErrorCode, ErrorPayload};
use thiserror::Error;

/// Local media stack failure (the boundary to the native RTC stack).
#[derive(Debug, Error)]
pub enum MediaError {
    /// The stack rejected or failed the operation.
    #[error("media stack error: {0}")]
    Failed(String),

    /// The operation is invalid in the stack's current state.
    #[error("media stack state error: {0}")]
    InvalidState(String),
}

/// Client session error type.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The server rejected the identity token.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Unknown stage/transport/producer/consumer id.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Wrong stage password.
    #[error("Permission denied: {0}")]
    Permission(String),

    /// The server-side media engine call failed.
    #[error("Engine error: {0}")]
    Engine(String),

    /// No response within the request deadline.
    #[error("Request timed out")]
    Timeout,

    /// The channel closed or failed to open.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation conflicts with current state on the server.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Malformed or unexpected wire traffic.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The local media stack failed.
    #[error(transparent)]
    Media(#[from] MediaError),

    /// The requested transition is invalid in the current session state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Unspecified server-side failure.
    #[error("Server error: {0}")]
    Server(String),
}

impl From<ErrorPayload> for SessionError {
    fn from(payload: ErrorPayload) -> Self {
        match payload.code {
            ErrorCode::Authentication => SessionError::Authentication(payload.message),
            ErrorCode::NotFound => SessionError::NotFound(payload.message),
            ErrorCode::Permission => SessionError::Permission(payload.message),
            ErrorCode::Engine => SessionError::Engine(payload.message),
            ErrorCode::Timeout => SessionError::Timeout,
            ErrorCode::Connection => SessionError::Connection(payload.message),
            ErrorCode::Conflict => SessionError::Conflict(payload.message),
            ErrorCode::Internal => SessionError::Server(payload.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_errors_map_to_variants() {
        let err: SessionError =
            ErrorPayload::new(ErrorCode::Permission, "Wrong stage password").into();
        assert!(matches!(err, SessionError::Permission(_)));

        let err: SessionError = ErrorPayload::new(ErrorCode::Timeout, "deadline").into();
        assert!(matches!(err, SessionError::Timeout));

        let err: SessionError = ErrorPayload::new(ErrorCode::Internal, "boom").into();
        assert!(matches!(err, SessionError::Server(_)));
    }
}
