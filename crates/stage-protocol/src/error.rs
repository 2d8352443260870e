//! Stable error codes surfaced to clients.
//!
//! Codes are part of the wire contract and never renumbered. Messages are
//! client-safe: internal details stay in server logs.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum ErrorCode {
    /// Invalid or expired identity token.
    Authentication,
    /// Unknown stage/transport/producer/consumer id.
    NotFound,
    /// Wrong stage password.
    Permission,
    /// The external media engine call failed.
    Engine,
    /// No response within the request deadline.
    Timeout,
    /// The signaling channel closed or failed to open.
    Connection,
    /// Operation conflicts with current state (e.g. duplicate join).
    Conflict,
    /// Unspecified server-side failure.
    Internal,
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::Authentication => 1,
            ErrorCode::NotFound => 2,
            ErrorCode::Permission => 3,
            ErrorCode::Engine => 4,
            ErrorCode::Timeout => 5,
            ErrorCode::Connection => 6,
            ErrorCode::Conflict => 7,
            ErrorCode::Internal => 8,
        }
    }
}

/// Error for an unrecognized wire code.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown error code: {0}")]
pub struct UnknownErrorCode(pub u16);

impl TryFrom<u16> for ErrorCode {
    type Error = UnknownErrorCode;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ErrorCode::Authentication),
            2 => Ok(ErrorCode::NotFound),
            3 => Ok(ErrorCode::Permission),
            4 => Ok(ErrorCode::Engine),
            5 => Ok(ErrorCode::Timeout),
            6 => Ok(ErrorCode::Connection),
            7 => Ok(ErrorCode::Conflict),
            8 => Ok(ErrorCode::Internal),
            other => Err(UnknownErrorCode(other)),
        }
    }
}

/// Error body carried in a correlated response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorPayload {
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, u16::from(self.code))
    }
}

impl std::error::Error for ErrorPayload {}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(u16::from(ErrorCode::Authentication), 1);
        assert_eq!(u16::from(ErrorCode::NotFound), 2);
        assert_eq!(u16::from(ErrorCode::Permission), 3);
        assert_eq!(u16::from(ErrorCode::Engine), 4);
        assert_eq!(u16::from(ErrorCode::Timeout), 5);
        assert_eq!(u16::from(ErrorCode::Connection), 6);
        assert_eq!(u16::from(ErrorCode::Conflict), 7);
        assert_eq!(u16::from(ErrorCode::Internal), 8);
    }

    #[test]
    fn code_round_trips_through_wire_integer() {
        for raw in 1..=8u16 {
            let code = ErrorCode::try_from(raw).unwrap();
            assert_eq!(u16::from(code), raw);
        }
        assert_eq!(ErrorCode::try_from(99), Err(UnknownErrorCode(99)));
    }

    #[test]
    fn payload_serializes_code_as_integer() {
        let payload = ErrorPayload::new(ErrorCode::Permission, "Wrong stage password");
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["code"], 3);
        assert_eq!(value["message"], "Wrong stage password");
    }
}
