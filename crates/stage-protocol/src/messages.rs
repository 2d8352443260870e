//! Typed signaling messages, one variant per event name.
//!
//! Requests and fire-and-forget events share the same enum per direction;
//! the envelope decides which is which (a request carries a correlation id,
//! an event does not). Wire event names are kebab-case.

use crate::error::ErrorPayload;
use crate::types::{
    CommunicationMode, ConnectionId, ConsumerId, DtlsParameters, IceCandidate, MediaKind,
    ParticipantId, ParticipantInfo, ProducerId, RtpCapabilities, RtpParameters,
    SessionDescription, StageId, StageKind, TransportId,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages the client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Create a stage; the requester becomes its director.
    CreateStage {
        identity_token: String,
        stage_name: String,
        kind: StageKind,
        mode: CommunicationMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },

    /// Join an existing stage as an actor.
    JoinStage {
        identity_token: String,
        stage_id: StageId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },

    /// Leave the current stage without closing the channel.
    LeaveStage,

    /// Fetch the media engine's router capability set.
    GetRtpCapabilities,

    /// Create the send-direction transport.
    CreateSendTransport { rtp_capabilities: RtpCapabilities },

    /// Create the receive-direction transport.
    CreateReceiveTransport { rtp_capabilities: RtpCapabilities },

    /// Complete transport negotiation with the client's DTLS parameters.
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },

    /// Register a local track as a producer on the send transport.
    SendTrack {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },

    /// Subscribe to a remote producer; the consumer is created paused.
    Consume {
        producer_id: ProducerId,
        transport_id: TransportId,
        rtp_capabilities: RtpCapabilities,
    },

    /// Signal that local consumer setup finished; the ack triggers resume.
    FinishConsume { consumer_id: ConsumerId },

    /// Close a producer (unpublish). Fire-and-forget.
    CloseProducer { producer_id: ProducerId },

    /// Relay an SDP offer to another connection (mesh path).
    MakeOffer {
        target_connection_id: ConnectionId,
        offer: SessionDescription,
    },

    /// Relay an SDP answer to another connection (mesh path).
    MakeAnswer {
        target_connection_id: ConnectionId,
        answer: SessionDescription,
    },

    /// Relay an ICE candidate to another connection (mesh path).
    SendCandidate {
        target_connection_id: ConnectionId,
        candidate: IceCandidate,
    },
}

impl ClientMessage {
    /// Wire event name, for logging.
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientMessage::CreateStage { .. } => "create-stage",
            ClientMessage::JoinStage { .. } => "join-stage",
            ClientMessage::LeaveStage => "leave-stage",
            ClientMessage::GetRtpCapabilities => "get-rtp-capabilities",
            ClientMessage::CreateSendTransport { .. } => "create-send-transport",
            ClientMessage::CreateReceiveTransport { .. } => "create-receive-transport",
            ClientMessage::ConnectTransport { .. } => "connect-transport",
            ClientMessage::SendTrack { .. } => "send-track",
            ClientMessage::Consume { .. } => "consume",
            ClientMessage::FinishConsume { .. } => "finish-consume",
            ClientMessage::CloseProducer { .. } => "close-producer",
            ClientMessage::MakeOffer { .. } => "make-offer",
            ClientMessage::MakeAnswer { .. } => "make-answer",
            ClientMessage::SendCandidate { .. } => "send-candidate",
        }
    }
}

/// Messages the server sends to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Correlated reply to a client request.
    Response(ResponsePayload),

    /// A participant joined the stage (sent to the pre-existing roster).
    ParticipantJoined(ParticipantInfo),

    /// A participant left or disconnected.
    ParticipantRemoved(ParticipantInfo),

    /// A participant published a new track.
    ProducerAdded {
        participant_id: ParticipantId,
        producer_id: ProducerId,
        kind: MediaKind,
    },

    /// Mesh path: a new connection joined; the recipient (the pre-existing
    /// side) initiates the offer toward it.
    PeerAdded {
        participant_id: ParticipantId,
        connection_id: ConnectionId,
    },

    /// Mesh path: an offer relayed from another participant.
    OfferMade {
        participant_id: ParticipantId,
        connection_id: ConnectionId,
        offer: SessionDescription,
    },

    /// Mesh path: an answer relayed from another participant.
    AnswerMade {
        participant_id: ParticipantId,
        connection_id: ConnectionId,
        answer: SessionDescription,
    },

    /// Mesh path: an ICE candidate relayed from another participant.
    CandidateSent {
        participant_id: ParticipantId,
        connection_id: ConnectionId,
        candidate: IceCandidate,
    },
}

impl ServerMessage {
    /// Wire event name, for logging.
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerMessage::Response(_) => "response",
            ServerMessage::ParticipantJoined(_) => "participant-joined",
            ServerMessage::ParticipantRemoved(_) => "participant-removed",
            ServerMessage::ProducerAdded { .. } => "producer-added",
            ServerMessage::PeerAdded { .. } => "peer-added",
            ServerMessage::OfferMade { .. } => "offer-made",
            ServerMessage::AnswerMade { .. } => "answer-made",
            ServerMessage::CandidateSent { .. } => "candidate-sent",
        }
    }
}

/// Body of a correlated response: exactly one of `result` or `error`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl ResponsePayload {
    /// Build a success response from a serializable result.
    ///
    /// # Errors
    ///
    /// Returns a `serde_json::Error` if the result cannot be serialized.
    pub fn ok<T: Serialize>(result: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            result: Some(serde_json::to_value(result)?),
            error: None,
        })
    }

    /// Build an error response.
    #[must_use]
    pub fn err(error: ErrorPayload) -> Self {
        Self {
            result: None,
            error: Some(error),
        }
    }

    /// Collapse into a `Result`, treating a body with neither field as an
    /// empty success.
    #[must_use]
    pub fn into_result(self) -> Result<Value, ErrorPayload> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(error),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::types::ParticipantRole;

    #[test]
    fn client_message_uses_kebab_case_event_names() {
        let msg = ClientMessage::GetRtpCapabilities;
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["event"], "get-rtp-capabilities");
        assert!(value.get("payload").is_none());
    }

    #[test]
    fn create_stage_round_trips() {
        let msg = ClientMessage::CreateStage {
            identity_token: "token-abc".to_string(),
            stage_name: "opening night".to_string(),
            kind: StageKind::Theater,
            mode: CommunicationMode::Sfu,
            password: Some("s3cret".to_string()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"create-stage\""));
        let back: ClientMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn optional_password_is_omitted_when_absent() {
        let msg = ClientMessage::JoinStage {
            identity_token: "token-abc".to_string(),
            stage_id: "stage-1".to_string(),
            password: None,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value["payload"].get("password").is_none());
    }

    #[test]
    fn server_broadcast_round_trips() {
        let msg = ServerMessage::ProducerAdded {
            participant_id: "p1".to_string(),
            producer_id: "prod-9".to_string(),
            kind: MediaKind::Audio,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"producer-added\""));
        let back: ServerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn unknown_payload_fields_are_ignored() {
        let json = r#"{
            "event": "participant-joined",
            "payload": {
                "participant_id": "p2",
                "connection_id": "c2",
                "name": "Second Violin",
                "role": "actor",
                "seat": 14
            }
        }"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        match msg {
            ServerMessage::ParticipantJoined(info) => {
                assert_eq!(info.participant_id, "p2");
                assert_eq!(info.role, ParticipantRole::Actor);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn response_payload_collapses_to_result() {
        let ok = ResponsePayload::ok(&serde_json::json!({"stage_id": "s1"})).unwrap();
        assert_eq!(ok.clone().into_result().unwrap()["stage_id"], "s1");

        let err = ResponsePayload::err(ErrorPayload::new(ErrorCode::NotFound, "Stage not found"));
        assert_eq!(err.into_result().unwrap_err().code, ErrorCode::NotFound);

        let empty = ResponsePayload::default();
        assert_eq!(empty.into_result().unwrap(), Value::Null);
    }
}
