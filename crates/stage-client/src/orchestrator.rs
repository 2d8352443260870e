//! Transport orchestration (SFU path).
//!
//! Drives the per-participant media handshake against the server, one state
//! machine per direction:
//!
//! `Idle → CapabilitiesExchanged → TransportCreated → TransportConnected →
//! Active`
//!
//! The capability exchange is fatal on failure (no forwarding is possible
//! without it) and is surfaced to the caller, never retried here. No
//! produce/consume call is issued on a transport before its connect request
//! is acknowledged. Consumers are created paused and resumed only after the
//! finish-consume acknowledgment, so the receive path is fully constructed
//! before packets arrive.

use crate::channel::Channel;
use crate::errors::SessionError;
use crate::events::SessionEvent;
use crate::media::{LocalConsumer, LocalTrack, MediaStack, RecvTransport, SendTransport};

use stage_protocol::messages::ClientMessage;
use stage_protocol::types::{
    Ack, ConsumerCreated, ConsumerId, MediaKind, ParticipantId, ProducerId, RtpCapabilities,
    TrackSent, TransportOptions,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Per-direction handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathState {
    Idle,
    CapabilitiesExchanged,
    TransportCreated,
    TransportConnected,
    Active,
}

/// A published local track and its server-side producer id.
struct ProducerBinding {
    producer_id: ProducerId,
    track: LocalTrack,
}

/// A subscribed remote track.
struct ConsumerBinding {
    consumer_id: ConsumerId,
    #[allow(dead_code)]
    participant_id: ParticipantId,
    consumer: Arc<dyn LocalConsumer>,
}

/// Client-side transport orchestrator for one stage session.
pub struct TransportOrchestrator {
    channel: Channel,
    stack: Arc<dyn MediaStack>,
    participant_id: ParticipantId,
    events: mpsc::UnboundedSender<SessionEvent>,

    device_capabilities: RtpCapabilities,
    send_state: PathState,
    recv_state: PathState,
    send_transport: Option<Arc<dyn SendTransport>>,
    recv_transport: Option<Arc<dyn RecvTransport>>,

    producers: Vec<ProducerBinding>,
    consumers: Vec<ConsumerBinding>,
    /// Producer announcements that arrived before the receive path was up.
    pending_remote_producers: Vec<(ParticipantId, ProducerId, MediaKind)>,

    /// Set once the single terminal disconnected notification fired.
    disconnected: Arc<AtomicBool>,
    state_watchers: Vec<JoinHandle<()>>,
}

impl TransportOrchestrator {
    #[must_use]
    pub fn new(
        channel: Channel,
        stack: Arc<dyn MediaStack>,
        participant_id: ParticipantId,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            channel,
            stack,
            participant_id,
            events,
            device_capabilities: RtpCapabilities::default(),
            send_state: PathState::Idle,
            recv_state: PathState::Idle,
            send_transport: None,
            recv_transport: None,
            producers: Vec::new(),
            consumers: Vec::new(),
            pending_remote_producers: Vec::new(),
            disconnected: Arc::new(AtomicBool::new(false)),
            state_watchers: Vec::new(),
        }
    }

    /// Current send-path state.
    #[must_use]
    pub fn send_state(&self) -> PathState {
        self.send_state
    }

    /// Current receive-path state.
    #[must_use]
    pub fn recv_state(&self) -> PathState {
        self.recv_state
    }

    /// Run the full handshake: capability exchange, then both transports.
    ///
    /// # Errors
    ///
    /// Capability or transport-creation failures are returned to the caller
    /// with no automatic retry; the media session is unusable after such a
    /// failure.
    pub async fn start(&mut self) -> Result<(), SessionError> {
        // Step 1: capability exchange. Fatal if it fails.
        let router_capabilities: RtpCapabilities = self
            .channel
            .request(ClientMessage::GetRtpCapabilities)
            .await?;
        self.stack.load(router_capabilities).await?;
        self.device_capabilities = self.stack.rtp_capabilities().await?;
        self.send_state = PathState::CapabilitiesExchanged;
        self.recv_state = PathState::CapabilitiesExchanged;

        // Steps 2-3, send direction.
        let options: TransportOptions = self
            .channel
            .request(ClientMessage::CreateSendTransport {
                rtp_capabilities: self.device_capabilities.clone(),
            })
            .await?;
        let transport_id = options.transport_id.clone();
        let send = self.stack.create_send_transport(options).await?;
        self.send_state = PathState::TransportCreated;

        // The negotiation event fires exactly once; its payload becomes the
        // connect request. Until the ack, no produce may be issued.
        let dtls_parameters = send.negotiate().await?;
        let _: Ack = self
            .channel
            .request(ClientMessage::ConnectTransport {
                transport_id,
                dtls_parameters,
            })
            .await?;
        self.send_state = PathState::TransportConnected;
        self.watch_transport_state(send.connection_state());
        self.send_transport = Some(send);

        // Steps 2-3, receive direction.
        let options: TransportOptions = self
            .channel
            .request(ClientMessage::CreateReceiveTransport {
                rtp_capabilities: self.device_capabilities.clone(),
            })
            .await?;
        let transport_id = options.transport_id.clone();
        let recv = self.stack.create_receive_transport(options).await?;
        self.recv_state = PathState::TransportCreated;

        let dtls_parameters = recv.negotiate().await?;
        let _: Ack = self
            .channel
            .request(ClientMessage::ConnectTransport {
                transport_id,
                dtls_parameters,
            })
            .await?;
        self.recv_state = PathState::TransportConnected;
        self.watch_transport_state(recv.connection_state());
        self.recv_transport = Some(recv);

        info!(
            target: "stage.client.orchestrator",
            participant_id = %self.participant_id,
            "Media transports connected"
        );

        // Serve announcements that raced the handshake.
        let pending = std::mem::take(&mut self.pending_remote_producers);
        for (participant_id, producer_id, kind) in pending {
            if let Err(e) = self
                .consume_remote(participant_id.clone(), producer_id.clone(), kind)
                .await
            {
                warn!(
                    target: "stage.client.orchestrator",
                    producer_id = %producer_id,
                    error = %e,
                    "Deferred consume failed"
                );
            }
        }

        Ok(())
    }

    /// Publish a local track on the send transport.
    ///
    /// # Errors
    ///
    /// `SessionError::InvalidState` before the send transport is connected;
    /// otherwise whatever the stack or server returns.
    pub async fn publish_track(&mut self, track: LocalTrack) -> Result<ProducerId, SessionError> {
        if !matches!(
            self.send_state,
            PathState::TransportConnected | PathState::Active
        ) {
            return Err(SessionError::InvalidState(
                "send transport is not connected".to_string(),
            ));
        }
        let send = self
            .send_transport
            .as_ref()
            .ok_or_else(|| SessionError::InvalidState("send transport missing".to_string()))?;

        let rtp_parameters = send.produce(&track).await?;
        let sent: TrackSent = self
            .channel
            .request(ClientMessage::SendTrack {
                transport_id: send.transport_id().to_string(),
                kind: track.kind,
                rtp_parameters,
            })
            .await?;

        debug!(
            target: "stage.client.orchestrator",
            track_id = %track.track_id,
            producer_id = %sent.producer_id,
            "Track published"
        );

        self.producers.push(ProducerBinding {
            producer_id: sent.producer_id.clone(),
            track,
        });
        self.send_state = PathState::Active;
        Ok(sent.producer_id)
    }

    /// Unpublish a track by its local track id.
    ///
    /// The close is fire-and-forget: peers are not required to acknowledge
    /// removal before this returns.
    ///
    /// # Errors
    ///
    /// `SessionError::NotFound` if no producer publishes this track.
    pub fn unpublish_track(&mut self, track_id: &str) -> Result<(), SessionError> {
        let index = self
            .producers
            .iter()
            .position(|binding| binding.track.track_id == track_id)
            .ok_or_else(|| {
                SessionError::NotFound(format!("no producer for track {track_id}"))
            })?;
        let binding = self.producers.remove(index);

        self.channel.emit(ClientMessage::CloseProducer {
            producer_id: binding.producer_id.clone(),
        })?;

        debug!(
            target: "stage.client.orchestrator",
            track_id = %track_id,
            producer_id = %binding.producer_id,
            "Track unpublished"
        );
        Ok(())
    }

    /// React to a `producer-added` broadcast.
    ///
    /// Own announcements are ignored; announcements arriving before the
    /// receive path is up are deferred and served at the end of `start`.
    pub async fn handle_producer_added(
        &mut self,
        participant_id: ParticipantId,
        producer_id: ProducerId,
        kind: MediaKind,
    ) -> Result<(), SessionError> {
        if participant_id == self.participant_id {
            return Ok(());
        }
        if !matches!(
            self.recv_state,
            PathState::TransportConnected | PathState::Active
        ) {
            self.pending_remote_producers
                .push((participant_id, producer_id, kind));
            return Ok(());
        }
        self.consume_remote(participant_id, producer_id, kind).await
    }

    /// Two-phase consume: request (paused) → local construction →
    /// finish-consume ack → resume → surface the track.
    async fn consume_remote(
        &mut self,
        participant_id: ParticipantId,
        producer_id: ProducerId,
        kind: MediaKind,
    ) -> Result<(), SessionError> {
        let recv = self
            .recv_transport
            .as_ref()
            .ok_or_else(|| SessionError::InvalidState("receive transport missing".to_string()))?;

        let created: ConsumerCreated = self
            .channel
            .request(ClientMessage::Consume {
                producer_id: producer_id.clone(),
                transport_id: recv.transport_id().to_string(),
                rtp_capabilities: self.device_capabilities.clone(),
            })
            .await?;

        // Local construction of the receive path happens while the
        // consumer is still paused server-side.
        let consumer = recv.consume(&created).await?;

        let _: Ack = self
            .channel
            .request(ClientMessage::FinishConsume {
                consumer_id: created.consumer_id.clone(),
            })
            .await?;

        // Only now may media flow.
        consumer.resume().await?;
        self.recv_state = PathState::Active;

        let track = consumer.track();
        debug!(
            target: "stage.client.orchestrator",
            participant_id = %participant_id,
            producer_id = %producer_id,
            consumer_id = %created.consumer_id,
            kind = ?kind,
            "Remote track consuming"
        );

        let _ = self.events.send(SessionEvent::ConsumerAdded {
            participant_id: participant_id.clone(),
            consumer_id: created.consumer_id.clone(),
            track,
        });

        self.consumers.push(ConsumerBinding {
            consumer_id: created.consumer_id,
            participant_id,
            consumer,
        });
        Ok(())
    }

    /// Watch a transport's connection state; terminal states surface one
    /// `Disconnected` notification and no reconnection attempt.
    fn watch_transport_state(
        &mut self,
        mut state_rx: tokio::sync::watch::Receiver<crate::media::TransportConnectionState>,
    ) {
        let events = self.events.clone();
        let disconnected = Arc::clone(&self.disconnected);
        self.state_watchers.push(tokio::spawn(async move {
            while state_rx.changed().await.is_ok() {
                let state = *state_rx.borrow();
                if state.is_terminal() {
                    if !disconnected.swap(true, Ordering::SeqCst) {
                        warn!(
                            target: "stage.client.orchestrator",
                            state = ?state,
                            "Transport reached terminal state"
                        );
                        let _ = events.send(SessionEvent::Disconnected);
                    }
                    break;
                }
            }
        }));
    }

    /// Tear down local media objects. Server-side cleanup happens via the
    /// stage's disconnect handling.
    pub async fn close(&mut self) {
        for watcher in self.state_watchers.drain(..) {
            watcher.abort();
        }
        for binding in self.consumers.drain(..) {
            binding.consumer.close().await;
        }
        self.producers.clear();
        if let Some(recv) = self.recv_transport.take() {
            recv.close().await;
        }
        if let Some(send) = self.send_transport.take() {
            send.close().await;
        }
        self.send_state = PathState::Idle;
        self.recv_state = PathState::Idle;
    }
}
