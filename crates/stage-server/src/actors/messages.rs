//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via
//! `tokio::sync::mpsc`. Response patterns use `tokio::sync::oneshot` for
//! request-reply semantics.

use crate::auth::Identity;
use crate::errors::StageError;

use stage_protocol::envelope::ServerEnvelope;
use stage_protocol::types::{
    CommunicationMode, ConnectionId, ConsumerCreated, ConsumerId, DtlsParameters, IceCandidate,
    MediaKind, ParticipantId, ProducerId, RtpCapabilities, RtpParameters, SessionDescription,
    StageId, StageKind, StageSnapshot, TransportDirection, TransportId, TransportOptions,
};
use tokio::sync::{mpsc, oneshot};

/// Outbound side of one signaling connection.
///
/// Stage actors hold these to push responses, broadcasts and relayed
/// messages toward the client; the connection's writer task drains them.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    connection_id: ConnectionId,
    sender: mpsc::Sender<ServerEnvelope>,
}

impl ConnectionHandle {
    #[must_use]
    pub fn new(connection_id: ConnectionId, sender: mpsc::Sender<ServerEnvelope>) -> Self {
        Self {
            connection_id,
            sender,
        }
    }

    /// Get the connection ID.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Queue an envelope toward the client.
    pub async fn send(&self, envelope: ServerEnvelope) -> Result<(), StageError> {
        self.sender
            .send(envelope)
            .await
            .map_err(|e| StageError::Connection(format!("outbound channel closed: {e}")))
    }
}

/// Messages sent to the `RegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Create a stage; the requester becomes its sole participant with the
    /// director role.
    CreateStage {
        identity: Identity,
        connection_id: ConnectionId,
        stage_name: String,
        kind: StageKind,
        mode: CommunicationMode,
        password: Option<String>,
        outbound: ConnectionHandle,
        respond_to: oneshot::Sender<Result<StageCreation, StageError>>,
    },

    /// Resolve a stage actor handle.
    GetStage {
        stage_id: StageId,
        respond_to: oneshot::Sender<Result<super::stage::StageActorHandle, StageError>>,
    },

    /// Remove a stage (lifecycle decision of the external directory).
    DeleteStage {
        stage_id: StageId,
        respond_to: oneshot::Sender<Result<(), StageError>>,
    },

    /// Current registry status (for health checks).
    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },

    /// Initiate graceful shutdown.
    Shutdown {
        deadline: std::time::Duration,
        respond_to: oneshot::Sender<Result<(), StageError>>,
    },
}

/// Messages sent to a `StageActor`.
#[derive(Debug)]
pub enum StageMessage {
    /// A connection wants to join this stage as an actor.
    Join {
        identity: Identity,
        connection_id: ConnectionId,
        password: Option<String>,
        outbound: ConnectionHandle,
        respond_to: oneshot::Sender<Result<JoinedStage, StageError>>,
    },

    /// A participant leaves explicitly (channel stays open).
    Leave {
        participant_id: ParticipantId,
        respond_to: oneshot::Sender<Result<(), StageError>>,
    },

    /// The participant's connection closed; unconditional cleanup.
    ConnectionClosed {
        participant_id: ParticipantId,
        connection_id: ConnectionId,
    },

    /// Fetch the engine router's capability set.
    RouterCapabilities {
        respond_to: oneshot::Sender<Result<RtpCapabilities, StageError>>,
    },

    /// Create (or renegotiate) the participant's transport for a direction.
    CreateTransport {
        participant_id: ParticipantId,
        direction: TransportDirection,
        rtp_capabilities: RtpCapabilities,
        respond_to: oneshot::Sender<Result<TransportOptions, StageError>>,
    },

    /// Complete the connect handshake for a transport.
    ConnectTransport {
        participant_id: ParticipantId,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
        respond_to: oneshot::Sender<Result<(), StageError>>,
    },

    /// Register a produced track; broadcasts `producer-added` on success.
    SendTrack {
        participant_id: ParticipantId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        respond_to: oneshot::Sender<Result<ProducerId, StageError>>,
    },

    /// Create a paused consumer of another participant's producer.
    Consume {
        participant_id: ParticipantId,
        producer_id: ProducerId,
        transport_id: TransportId,
        rtp_capabilities: RtpCapabilities,
        respond_to: oneshot::Sender<Result<ConsumerCreated, StageError>>,
    },

    /// Consumer-side setup finished; resume the engine consumer.
    FinishConsume {
        participant_id: ParticipantId,
        consumer_id: ConsumerId,
        respond_to: oneshot::Sender<Result<(), StageError>>,
    },

    /// Close a producer (unpublish). Fire-and-forget.
    CloseProducer {
        participant_id: ParticipantId,
        producer_id: ProducerId,
    },

    /// Relay a mesh signaling payload to another connection.
    Relay {
        from_participant_id: ParticipantId,
        from_connection_id: ConnectionId,
        payload: RelayPayload,
    },

    /// Current stage snapshot (for debugging/tests).
    Snapshot {
        respond_to: oneshot::Sender<StageSnapshot>,
    },
}

/// Mesh signaling payloads relayed verbatim between two connections.
#[derive(Debug, Clone)]
pub enum RelayPayload {
    Offer {
        target_connection_id: ConnectionId,
        offer: SessionDescription,
    },
    Answer {
        target_connection_id: ConnectionId,
        answer: SessionDescription,
    },
    Candidate {
        target_connection_id: ConnectionId,
        candidate: IceCandidate,
    },
}

/// Result of a successful stage creation.
#[derive(Debug)]
pub struct StageCreation {
    pub stage_id: StageId,
    pub participant_id: ParticipantId,
    pub handle: super::stage::StageActorHandle,
}

/// Result of a successful join.
#[derive(Debug, Clone)]
pub struct JoinedStage {
    pub participant_id: ParticipantId,
    pub snapshot: StageSnapshot,
}

/// Status of the `RegistryActor`.
#[derive(Debug, Clone)]
pub struct RegistryStatus {
    /// Total stages currently registered.
    pub stage_count: usize,
    /// Total participants across all stages.
    pub participant_count: usize,
    /// Whether the registry is draining.
    pub is_draining: bool,
}
