//! P2P signaling relay (mesh path).
//!
//! Stateless: each relay message names a target connection id and carries an
//! opaque payload, forwarded verbatim under the renamed "made/sent" event
//! with the sender's participant and connection ids attached so the receiver
//! can associate it with a peer link. Media state is never inspected here.

use crate::actors::messages::RelayPayload;

use stage_protocol::messages::ServerMessage;
use stage_protocol::types::{ConnectionId, ParticipantId};

/// Rewrite a relay payload into the event delivered to the target.
///
/// Returns the target connection id and the outbound message.
#[must_use]
pub fn route(
    from_participant_id: &ParticipantId,
    from_connection_id: &ConnectionId,
    payload: RelayPayload,
) -> (ConnectionId, ServerMessage) {
    match payload {
        RelayPayload::Offer {
            target_connection_id,
            offer,
        } => (
            target_connection_id,
            ServerMessage::OfferMade {
                participant_id: from_participant_id.clone(),
                connection_id: from_connection_id.clone(),
                offer,
            },
        ),
        RelayPayload::Answer {
            target_connection_id,
            answer,
        } => (
            target_connection_id,
            ServerMessage::AnswerMade {
                participant_id: from_participant_id.clone(),
                connection_id: from_connection_id.clone(),
                answer,
            },
        ),
        RelayPayload::Candidate {
            target_connection_id,
            candidate,
        } => (
            target_connection_id,
            ServerMessage::CandidateSent {
                participant_id: from_participant_id.clone(),
                connection_id: from_connection_id.clone(),
                candidate,
            },
        ),
    }
}

/// Event announcing a newcomer to the pre-existing roster.
///
/// Delivered only to participants already present, which fixes the offerer
/// role on the pre-existing side and rules out glare: the newcomer never
/// initiates an offer.
#[must_use]
pub fn peer_added(
    participant_id: &ParticipantId,
    connection_id: &ConnectionId,
) -> ServerMessage {
    ServerMessage::PeerAdded {
        participant_id: participant_id.clone(),
        connection_id: connection_id.clone(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use stage_protocol::types::{IceCandidate, SessionDescription};

    #[test]
    fn test_offer_is_renamed_and_forwarded_verbatim() {
        let offer = SessionDescription(serde_json::json!({"type": "offer", "sdp": "v=0..."}));
        let (target, message) = route(
            &"alice".to_string(),
            &"conn-a".to_string(),
            RelayPayload::Offer {
                target_connection_id: "conn-b".to_string(),
                offer: offer.clone(),
            },
        );

        assert_eq!(target, "conn-b");
        match message {
            ServerMessage::OfferMade {
                participant_id,
                connection_id,
                offer: forwarded,
            } => {
                assert_eq!(participant_id, "alice");
                assert_eq!(connection_id, "conn-a");
                assert_eq!(forwarded, offer);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_answer_and_candidate_routing() {
        let (target, message) = route(
            &"bob".to_string(),
            &"conn-b".to_string(),
            RelayPayload::Answer {
                target_connection_id: "conn-a".to_string(),
                answer: SessionDescription(serde_json::json!({"type": "answer"})),
            },
        );
        assert_eq!(target, "conn-a");
        assert!(matches!(message, ServerMessage::AnswerMade { .. }));

        let candidate = IceCandidate(serde_json::json!({"candidate": "candidate:1 1 udp ..."}));
        let (target, message) = route(
            &"bob".to_string(),
            &"conn-b".to_string(),
            RelayPayload::Candidate {
                target_connection_id: "conn-a".to_string(),
                candidate: candidate.clone(),
            },
        );
        assert_eq!(target, "conn-a");
        match message {
            ServerMessage::CandidateSent {
                candidate: forwarded,
                ..
            } => assert_eq!(forwarded, candidate),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_peer_added_names_the_newcomer() {
        let message = peer_added(&"carol".to_string(), &"conn-c".to_string());
        match message {
            ServerMessage::PeerAdded {
                participant_id,
                connection_id,
            } => {
                assert_eq!(participant_id, "carol");
                assert_eq!(connection_id, "conn-c");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
