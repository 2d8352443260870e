//! Direct mesh path (non-SFU).
//!
//! One `PeerLink` per remote connection, negotiated through the server's
//! stateless relay. The offerer role is fixed: `peer-added` is only ever
//! delivered to the pre-existing side, so the newcomer always answers and
//! glare cannot occur.

use crate::channel::Channel;
use crate::errors::{MediaError, SessionError};
use crate::events::SessionEvent;
use crate::media::LocalTrack;

use async_trait::async_trait;
use stage_protocol::messages::ClientMessage;
use stage_protocol::types::{ConnectionId, IceCandidate, ParticipantId, SessionDescription};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// State of one peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Offer/answer/candidate exchange in progress.
    Negotiating,
    /// ICE yielded no further local candidates; media can flow.
    Established,
}

/// Boundary to the native RTC stack for direct peer connections.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn create_link(&self) -> Result<Arc<dyn PeerLink>, MediaError>;
}

/// One direct connection to a remote participant.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Create the local offer (offerer side).
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;

    /// Apply a remote offer and produce the answer (answerer side).
    async fn accept_offer(
        &self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, MediaError>;

    /// Apply the remote answer (offerer side).
    async fn accept_answer(&self, answer: &SessionDescription) -> Result<(), MediaError>;

    /// Add a relayed remote ICE candidate.
    async fn add_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError>;

    /// Next local ICE candidate to relay; `None` once exhausted, which
    /// marks the link established.
    async fn next_candidate(&self) -> Option<IceCandidate>;

    /// Attach a local track to this link.
    async fn add_track(&self, track: &LocalTrack) -> Result<(), MediaError>;

    /// Detach a local track.
    async fn remove_track(&self, track_id: &str) -> Result<(), MediaError>;

    async fn close(&self);
}

struct LinkEntry {
    link: Arc<dyn PeerLink>,
    participant_id: ParticipantId,
    state: LinkState,
}

type LinkMap = Arc<Mutex<HashMap<ConnectionId, LinkEntry>>>;

/// Mesh-side counterpart of the transport orchestrator.
pub struct MeshConnector {
    channel: Channel,
    connector: Arc<dyn PeerConnector>,
    links: LinkMap,
    local_tracks: Vec<LocalTrack>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl MeshConnector {
    #[must_use]
    pub fn new(
        channel: Channel,
        connector: Arc<dyn PeerConnector>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            channel,
            connector,
            links: Arc::new(Mutex::new(HashMap::new())),
            local_tracks: Vec::new(),
            events,
        }
    }

    /// State of the link toward `connection_id`, if any.
    #[must_use]
    pub fn link_state(&self, connection_id: &str) -> Option<LinkState> {
        self.links
            .lock()
            .ok()
            .and_then(|links| links.get(connection_id).map(|entry| entry.state))
    }

    fn insert_link(
        &self,
        connection_id: ConnectionId,
        participant_id: ParticipantId,
        link: Arc<dyn PeerLink>,
    ) {
        if let Ok(mut links) = self.links.lock() {
            links.insert(
                connection_id,
                LinkEntry {
                    link,
                    participant_id,
                    state: LinkState::Negotiating,
                },
            );
        }
    }

    fn lookup_link(&self, connection_id: &str) -> Option<Arc<dyn PeerLink>> {
        self.links
            .lock()
            .ok()
            .and_then(|links| links.get(connection_id).map(|entry| Arc::clone(&entry.link)))
    }

    /// Create a link and seed it with the current local tracks.
    async fn new_link(
        &self,
        connection_id: &str,
        participant_id: &str,
    ) -> Result<Arc<dyn PeerLink>, SessionError> {
        let link = self.connector.create_link().await?;
        for track in &self.local_tracks {
            link.add_track(track).await?;
        }
        self.insert_link(
            connection_id.to_string(),
            participant_id.to_string(),
            Arc::clone(&link),
        );
        self.pump_candidates(connection_id.to_string(), Arc::clone(&link));
        Ok(link)
    }

    /// Relay local candidates toward the remote side until exhausted, then
    /// mark the link established.
    fn pump_candidates(&self, connection_id: ConnectionId, link: Arc<dyn PeerLink>) {
        let channel = self.channel.clone();
        let links = Arc::clone(&self.links);
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(candidate) = link.next_candidate().await {
                if channel
                    .emit(ClientMessage::SendCandidate {
                        target_connection_id: connection_id.clone(),
                        candidate,
                    })
                    .is_err()
                {
                    return;
                }
            }

            let participant_id = match links.lock() {
                Ok(mut links) => links.get_mut(&connection_id).map(|entry| {
                    entry.state = LinkState::Established;
                    entry.participant_id.clone()
                }),
                Err(_) => None,
            };
            if let Some(participant_id) = participant_id {
                debug!(
                    target: "stage.client.mesh",
                    connection_id = %connection_id,
                    "Peer link established"
                );
                let _ = events.send(SessionEvent::PeerLinkEstablished {
                    participant_id,
                    connection_id,
                });
            }
        });
    }

    /// `peer-added`: we are the pre-existing side, so we offer.
    pub async fn handle_peer_added(
        &mut self,
        participant_id: ParticipantId,
        connection_id: ConnectionId,
    ) -> Result<(), SessionError> {
        debug!(
            target: "stage.client.mesh",
            connection_id = %connection_id,
            "Peer added, sending offer"
        );
        let link = self.new_link(&connection_id, &participant_id).await?;
        let offer = link.create_offer().await?;
        self.channel.emit(ClientMessage::MakeOffer {
            target_connection_id: connection_id,
            offer,
        })?;
        Ok(())
    }

    /// `offer-made`: we are the newcomer, so we only answer.
    pub async fn handle_offer_made(
        &mut self,
        participant_id: ParticipantId,
        connection_id: ConnectionId,
        offer: &SessionDescription,
    ) -> Result<(), SessionError> {
        debug!(
            target: "stage.client.mesh",
            connection_id = %connection_id,
            "Offer received, answering"
        );
        let link = self.new_link(&connection_id, &participant_id).await?;
        let answer = link.accept_offer(offer).await?;
        self.channel.emit(ClientMessage::MakeAnswer {
            target_connection_id: connection_id,
            answer,
        })?;
        Ok(())
    }

    /// `answer-made`: complete our outstanding offer.
    pub async fn handle_answer_made(
        &mut self,
        connection_id: &str,
        answer: &SessionDescription,
    ) -> Result<(), SessionError> {
        match self.lookup_link(connection_id) {
            Some(link) => {
                link.accept_answer(answer).await?;
                Ok(())
            }
            None => {
                warn!(
                    target: "stage.client.mesh",
                    connection_id = %connection_id,
                    "Answer for unknown peer link"
                );
                Err(SessionError::NotFound(format!(
                    "no peer link for connection {connection_id}"
                )))
            }
        }
    }

    /// `candidate-sent`: feed a remote candidate into the link.
    pub async fn handle_candidate_sent(
        &mut self,
        connection_id: &str,
        candidate: &IceCandidate,
    ) -> Result<(), SessionError> {
        match self.lookup_link(connection_id) {
            Some(link) => {
                link.add_candidate(candidate).await?;
                Ok(())
            }
            None => {
                warn!(
                    target: "stage.client.mesh",
                    connection_id = %connection_id,
                    "Candidate for unknown peer link"
                );
                Err(SessionError::NotFound(format!(
                    "no peer link for connection {connection_id}"
                )))
            }
        }
    }

    /// Attach a local track to every link, current and future.
    pub async fn publish_track(&mut self, track: LocalTrack) -> Result<(), SessionError> {
        let links: Vec<Arc<dyn PeerLink>> = self
            .links
            .lock()
            .map(|links| links.values().map(|e| Arc::clone(&e.link)).collect())
            .unwrap_or_default();
        for link in links {
            link.add_track(&track).await?;
        }
        self.local_tracks.push(track);
        Ok(())
    }

    /// Detach a local track from every link.
    ///
    /// # Errors
    ///
    /// `SessionError::NotFound` if the track was never published.
    pub async fn unpublish_track(&mut self, track_id: &str) -> Result<(), SessionError> {
        let index = self
            .local_tracks
            .iter()
            .position(|track| track.track_id == track_id)
            .ok_or_else(|| SessionError::NotFound(format!("no published track {track_id}")))?;
        self.local_tracks.remove(index);

        let links: Vec<Arc<dyn PeerLink>> = self
            .links
            .lock()
            .map(|links| links.values().map(|e| Arc::clone(&e.link)).collect())
            .unwrap_or_default();
        for link in links {
            link.remove_track(track_id).await?;
        }
        Ok(())
    }

    /// Close every link.
    pub async fn close(&mut self) {
        let links: Vec<Arc<dyn PeerLink>> = match self.links.lock() {
            Ok(mut links) => links.drain().map(|(_, e)| e.link).collect(),
            Err(_) => Vec::new(),
        };
        for link in links {
            link.close().await;
        }
        self.local_tracks.clear();
    }
}
