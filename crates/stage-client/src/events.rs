//! Session events surfaced to the embedding UI layer.

use crate::media::RemoteTrack;

use stage_protocol::types::{ConnectionId, ConsumerId, ParticipantId, ParticipantInfo};

/// Events delivered to the UI layer over the session's event channel.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Another participant joined the stage.
    ParticipantJoined(ParticipantInfo),

    /// A participant left or disconnected.
    ParticipantRemoved(ParticipantInfo),

    /// A remote track became consumable; media is flowing.
    ConsumerAdded {
        participant_id: ParticipantId,
        consumer_id: ConsumerId,
        track: RemoteTrack,
    },

    /// A mesh peer link finished ICE negotiation.
    PeerLinkEstablished {
        participant_id: ParticipantId,
        connection_id: ConnectionId,
    },

    /// Terminal: the session lost its connection or a transport failed.
    /// There is no automatic recovery; re-entry is a full re-join.
    Disconnected,
}
