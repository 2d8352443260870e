//! Correlation envelope.
//!
//! The channel's native primitive is a fire-and-forget event; requests are
//! events carrying a correlation id, and the single matching response echoes
//! that id back. Events carry no id.

use crate::messages::{ClientMessage, ServerMessage};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Version of the message schema. Bumped on incompatible changes.
pub const PROTOCOL_VERSION: u16 = 1;

fn default_version() -> u16 {
    PROTOCOL_VERSION
}

/// Envelope for client-to-server traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientEnvelope {
    #[serde(default = "default_version")]
    pub v: u16,
    /// Correlation id; present iff this is a request expecting a response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub message: ClientMessage,
}

impl ClientEnvelope {
    /// Wrap a request with its correlation id.
    #[must_use]
    pub fn request(id: u64, message: ClientMessage) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            id: Some(id),
            message,
        }
    }

    /// Wrap a fire-and-forget event.
    #[must_use]
    pub fn event(message: ClientMessage) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            id: None,
            message,
        }
    }
}

/// Envelope for server-to-client traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEnvelope {
    #[serde(default = "default_version")]
    pub v: u16,
    /// Correlation id; present iff this is the response to a request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub message: ServerMessage,
}

impl ServerEnvelope {
    /// Wrap the response to request `id`.
    #[must_use]
    pub fn response(id: u64, message: ServerMessage) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            id: Some(id),
            message,
        }
    }

    /// Wrap an unsolicited event (broadcast or relay).
    #[must_use]
    pub fn event(message: ServerMessage) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            id: None,
            message,
        }
    }
}

/// Wire encoding/decoding failure.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),
}

/// Encode an envelope as a JSON text frame.
///
/// # Errors
///
/// Returns `WireError::Malformed` if serialization fails.
pub fn encode<T: Serialize>(envelope: &T) -> Result<String, WireError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Decode a client envelope, rejecting newer protocol versions.
///
/// # Errors
///
/// Returns `WireError::Malformed` on invalid JSON or schema mismatch, and
/// `WireError::UnsupportedVersion` for frames from a newer protocol.
pub fn decode_client(text: &str) -> Result<ClientEnvelope, WireError> {
    let envelope: ClientEnvelope = serde_json::from_str(text)?;
    if envelope.v > PROTOCOL_VERSION {
        return Err(WireError::UnsupportedVersion(envelope.v));
    }
    Ok(envelope)
}

/// Decode a server envelope, rejecting newer protocol versions.
///
/// # Errors
///
/// Returns `WireError::Malformed` on invalid JSON or schema mismatch, and
/// `WireError::UnsupportedVersion` for frames from a newer protocol.
pub fn decode_server(text: &str) -> Result<ServerEnvelope, WireError> {
    let envelope: ServerEnvelope = serde_json::from_str(text)?;
    if envelope.v > PROTOCOL_VERSION {
        return Err(WireError::UnsupportedVersion(envelope.v));
    }
    Ok(envelope)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::{ErrorCode, ErrorPayload};
    use crate::messages::ResponsePayload;

    #[test]
    fn request_envelope_carries_correlation_id() {
        let envelope = ClientEnvelope::request(42, ClientMessage::GetRtpCapabilities);
        let text = encode(&envelope).unwrap();
        let back = decode_client(&text).unwrap();
        assert_eq!(back.id, Some(42));
        assert_eq!(back.message, ClientMessage::GetRtpCapabilities);
    }

    #[test]
    fn event_envelope_has_no_id() {
        let envelope = ClientEnvelope::event(ClientMessage::LeaveStage);
        let text = encode(&envelope).unwrap();
        assert!(!text.contains("\"id\""));
        assert_eq!(decode_client(&text).unwrap().id, None);
    }

    #[test]
    fn response_echoes_request_id() {
        let body = ResponsePayload::err(ErrorPayload::new(ErrorCode::NotFound, "Stage not found"));
        let envelope = ServerEnvelope::response(7, ServerMessage::Response(body));
        let text = encode(&envelope).unwrap();
        let back = decode_server(&text).unwrap();
        assert_eq!(back.id, Some(7));
        assert!(matches!(back.message, ServerMessage::Response(_)));
    }

    #[test]
    fn missing_version_defaults_to_current() {
        let text = r#"{"event":"leave-stage"}"#;
        let envelope = decode_client(text).unwrap();
        assert_eq!(envelope.v, PROTOCOL_VERSION);
    }

    #[test]
    fn newer_version_is_rejected() {
        let text = r#"{"v":99,"event":"leave-stage"}"#;
        assert!(matches!(
            decode_client(text),
            Err(WireError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn malformed_frame_is_rejected() {
        assert!(matches!(
            decode_client("{not json"),
            Err(WireError::Malformed(_))
        ));
        assert!(matches!(
            decode_client(r#"{"event":"no-such-event"}"#),
            Err(WireError::Malformed(_))
        ));
    }
}
