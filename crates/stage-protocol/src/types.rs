//! Shared data types carried by signaling messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stage identifier (assigned by the server on creation).
pub type StageId = String;

/// Participant identifier, scoped to one stage.
pub type ParticipantId = String;

/// Connection identifier, scoped to one signaling connection.
pub type ConnectionId = String;

/// Transport identifier, assigned by the media engine.
pub type TransportId = String;

/// Producer identifier, assigned by the media engine.
pub type ProducerId = String;

/// Consumer identifier, assigned by the media engine.
pub type ConsumerId = String;

/// What a stage is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Theater,
    Music,
    Conference,
}

/// Media topology of a stage: forwarded through the SFU engine, or a
/// direct mesh between participants. The two are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommunicationMode {
    Sfu,
    Mesh,
}

/// Role of a participant within a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Director,
    Actor,
}

/// Kind of a media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Direction of a media transport, from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Receive,
}

/// One codec the media engine can route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    /// Codec-specific parameters, relayed verbatim.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub parameters: Value,
}

/// Capability set of the media engine's router (or of a client device).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<CodecCapability>,
    /// Header extensions and other capability fields the orchestration
    /// layer never inspects.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub header_extensions: Value,
}

/// RTP parameters of a produced track. Opaque to the orchestration layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpParameters(pub Value);

/// DTLS parameters exchanged during transport negotiation. Opaque.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DtlsParameters(pub Value);

/// ICE parameters of an engine transport. Opaque.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IceParameters(pub Value);

/// One ICE candidate. Opaque; relayed verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IceCandidate(pub Value);

/// An SDP offer or answer for the mesh path. Opaque; relayed verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionDescription(pub Value);

/// Connection parameters returned by transport creation; the client
/// instantiates its local transport handle from these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportOptions {
    pub transport_id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

/// Roster entry, as carried by join snapshots and roster broadcasts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub participant_id: ParticipantId,
    pub connection_id: ConnectionId,
    pub name: String,
    pub role: ParticipantRole,
}

/// Immutable stage descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInfo {
    pub stage_id: StageId,
    pub name: String,
    pub kind: StageKind,
    pub mode: CommunicationMode,
    pub director_id: ParticipantId,
}

/// Snapshot returned by a successful join: the stage descriptor plus the
/// roster as it stood at join time (the joiner included, in join order).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSnapshot {
    pub stage: StageInfo,
    pub participants: Vec<ParticipantInfo>,
}

/// Result of a `create-stage` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageCreated {
    pub stage_id: StageId,
    pub participant_id: ParticipantId,
}

/// Result of a `join-stage` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageJoined {
    pub participant_id: ParticipantId,
    #[serde(flatten)]
    pub snapshot: StageSnapshot,
}

/// Result of a `send-track` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackSent {
    pub producer_id: ProducerId,
}

/// Result of a `consume` request. The consumer starts paused; media flows
/// only after `finish-consume` is acknowledged and the client resumes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerCreated {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub paused: bool,
}

/// Empty acknowledgment body for requests without a richer result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ack {}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn stage_kind_wire_names_are_lowercase() {
        assert_eq!(serde_json::to_string(&StageKind::Music).unwrap(), "\"music\"");
        assert_eq!(
            serde_json::from_str::<StageKind>("\"conference\"").unwrap(),
            StageKind::Conference
        );
    }

    #[test]
    fn communication_mode_round_trips() {
        for mode in [CommunicationMode::Sfu, CommunicationMode::Mesh] {
            let json = serde_json::to_string(&mode).unwrap();
            assert_eq!(serde_json::from_str::<CommunicationMode>(&json).unwrap(), mode);
        }
    }

    #[test]
    fn codec_capability_ignores_unknown_fields() {
        let json = r#"{
            "kind": "audio",
            "mime_type": "audio/opus",
            "clock_rate": 48000,
            "channels": 2,
            "future_field": {"nested": true}
        }"#;
        let codec: CodecCapability = serde_json::from_str(json).unwrap();
        assert_eq!(codec.mime_type, "audio/opus");
        assert_eq!(codec.channels, Some(2));
    }

    #[test]
    fn opaque_payloads_round_trip_verbatim() {
        let dtls = DtlsParameters(serde_json::json!({
            "role": "client",
            "fingerprints": [{"algorithm": "sha-256", "value": "AA:BB"}]
        }));
        let json = serde_json::to_string(&dtls).unwrap();
        let back: DtlsParameters = serde_json::from_str(&json).unwrap();
        assert_eq!(back, dtls);
    }

    #[test]
    fn stage_joined_flattens_snapshot() {
        let joined = StageJoined {
            participant_id: "p1".to_string(),
            snapshot: StageSnapshot {
                stage: StageInfo {
                    stage_id: "s1".to_string(),
                    name: "rehearsal".to_string(),
                    kind: StageKind::Music,
                    mode: CommunicationMode::Sfu,
                    director_id: "p0".to_string(),
                },
                participants: vec![],
            },
        };
        let value = serde_json::to_value(&joined).unwrap();
        assert!(value.get("stage").is_some());
        assert!(value.get("participant_id").is_some());
        assert!(value.get("snapshot").is_none());
    }
}
