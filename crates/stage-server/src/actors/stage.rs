//! `StageActor` - per-stage actor that owns stage state.
//!
//! Each `StageActor`:
//! - Owns the roster and every participant's media session tables
//! - Serializes roster mutation and orchestration steps for its stage
//! - Drives the media engine for transport/producer/consumer lifecycles
//! - Routes mesh relay messages between its connections
//!
//! Connections for different stages proceed in parallel; everything for one
//! stage flows through this actor's mailbox.

use crate::actors::media::{
    ConsumerRecord, MediaCleanup, MediaSessions, ParticipantMedia, ProducerRecord,
};
use crate::actors::messages::{ConnectionHandle, JoinedStage, RelayPayload, StageMessage};
use crate::auth::Identity;
use crate::engine::MediaEngine;
use crate::errors::StageError;
use crate::observability::metrics::RegistryMetrics;
use crate::relay;

use stage_protocol::envelope::ServerEnvelope;
use stage_protocol::messages::ServerMessage;
use stage_protocol::types::{
    CommunicationMode, ConsumerCreated, ConsumerId, DtlsParameters, MediaKind, ParticipantId,
    ParticipantInfo, ParticipantRole, ProducerId, RtpCapabilities, RtpParameters, StageId,
    StageInfo, StageKind, StageSnapshot, TransportDirection, TransportId, TransportOptions,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Default channel buffer size for the stage mailbox.
const STAGE_CHANNEL_BUFFER: usize = 500;

/// Immutable parameters of a stage.
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub stage_id: StageId,
    pub name: String,
    pub kind: StageKind,
    pub mode: CommunicationMode,
    pub password: Option<String>,
    pub max_participants: usize,
}

/// Handle to a `StageActor`.
#[derive(Clone, Debug)]
pub struct StageActorHandle {
    sender: mpsc::Sender<StageMessage>,
    cancel_token: CancellationToken,
    stage_id: StageId,
}

impl StageActorHandle {
    /// Get the stage ID.
    #[must_use]
    pub fn stage_id(&self) -> &str {
        &self.stage_id
    }

    async fn send(&self, message: StageMessage) -> Result<(), StageError> {
        self.sender
            .send(message)
            .await
            .map_err(|_| StageError::StageNotFound(self.stage_id.clone()))
    }

    async fn request<T>(
        &self,
        rx: oneshot::Receiver<Result<T, StageError>>,
    ) -> Result<T, StageError> {
        rx.await
            .map_err(|_| StageError::StageNotFound(self.stage_id.clone()))?
    }

    /// Join this stage as an actor.
    pub async fn join(
        &self,
        identity: Identity,
        connection_id: String,
        password: Option<String>,
        outbound: ConnectionHandle,
    ) -> Result<JoinedStage, StageError> {
        let (tx, rx) = oneshot::channel();
        self.send(StageMessage::Join {
            identity,
            connection_id,
            password,
            outbound,
            respond_to: tx,
        })
        .await?;
        self.request(rx).await
    }

    /// Leave explicitly (the channel stays open).
    pub async fn leave(&self, participant_id: ParticipantId) -> Result<(), StageError> {
        let (tx, rx) = oneshot::channel();
        self.send(StageMessage::Leave {
            participant_id,
            respond_to: tx,
        })
        .await?;
        self.request(rx).await
    }

    /// Notify that a participant's connection closed.
    pub async fn connection_closed(
        &self,
        participant_id: ParticipantId,
        connection_id: String,
    ) -> Result<(), StageError> {
        self.send(StageMessage::ConnectionClosed {
            participant_id,
            connection_id,
        })
        .await
    }

    /// Fetch the engine router's capability set.
    pub async fn router_capabilities(&self) -> Result<RtpCapabilities, StageError> {
        let (tx, rx) = oneshot::channel();
        self.send(StageMessage::RouterCapabilities { respond_to: tx })
            .await?;
        self.request(rx).await
    }

    /// Create (or renegotiate) a direction-scoped transport.
    pub async fn create_transport(
        &self,
        participant_id: ParticipantId,
        direction: TransportDirection,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<TransportOptions, StageError> {
        let (tx, rx) = oneshot::channel();
        self.send(StageMessage::CreateTransport {
            participant_id,
            direction,
            rtp_capabilities,
            respond_to: tx,
        })
        .await?;
        self.request(rx).await
    }

    /// Complete a transport's connect handshake.
    pub async fn connect_transport(
        &self,
        participant_id: ParticipantId,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), StageError> {
        let (tx, rx) = oneshot::channel();
        self.send(StageMessage::ConnectTransport {
            participant_id,
            transport_id,
            dtls_parameters,
            respond_to: tx,
        })
        .await?;
        self.request(rx).await
    }

    /// Register a produced track.
    pub async fn send_track(
        &self,
        participant_id: ParticipantId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, StageError> {
        let (tx, rx) = oneshot::channel();
        self.send(StageMessage::SendTrack {
            participant_id,
            transport_id,
            kind,
            rtp_parameters,
            respond_to: tx,
        })
        .await?;
        self.request(rx).await
    }

    /// Create a paused consumer of another participant's producer.
    pub async fn consume(
        &self,
        participant_id: ParticipantId,
        producer_id: ProducerId,
        transport_id: TransportId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerCreated, StageError> {
        let (tx, rx) = oneshot::channel();
        self.send(StageMessage::Consume {
            participant_id,
            producer_id,
            transport_id,
            rtp_capabilities,
            respond_to: tx,
        })
        .await?;
        self.request(rx).await
    }

    /// Resume a consumer after the client finished local setup.
    pub async fn finish_consume(
        &self,
        participant_id: ParticipantId,
        consumer_id: ConsumerId,
    ) -> Result<(), StageError> {
        let (tx, rx) = oneshot::channel();
        self.send(StageMessage::FinishConsume {
            participant_id,
            consumer_id,
            respond_to: tx,
        })
        .await?;
        self.request(rx).await
    }

    /// Close a producer (unpublish). Fire-and-forget.
    pub async fn close_producer(
        &self,
        participant_id: ParticipantId,
        producer_id: ProducerId,
    ) -> Result<(), StageError> {
        self.send(StageMessage::CloseProducer {
            participant_id,
            producer_id,
        })
        .await
    }

    /// Relay a mesh signaling payload.
    pub async fn relay(
        &self,
        from_participant_id: ParticipantId,
        from_connection_id: String,
        payload: RelayPayload,
    ) -> Result<(), StageError> {
        self.send(StageMessage::Relay {
            from_participant_id,
            from_connection_id,
            payload,
        })
        .await
    }

    /// Current stage snapshot.
    pub async fn snapshot(&self) -> Result<StageSnapshot, StageError> {
        let (tx, rx) = oneshot::channel();
        self.send(StageMessage::Snapshot { respond_to: tx }).await?;
        rx.await
            .map_err(|_| StageError::StageNotFound(self.stage_id.clone()))
    }

    /// Cancel the stage actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Participant state within a stage.
#[derive(Debug, Clone)]
struct Participant {
    participant_id: ParticipantId,
    identity_id: String,
    name: String,
    connection_id: String,
    role: ParticipantRole,
    outbound: ConnectionHandle,
}

impl Participant {
    fn to_info(&self) -> ParticipantInfo {
        ParticipantInfo {
            participant_id: self.participant_id.clone(),
            connection_id: self.connection_id.clone(),
            name: self.name.clone(),
            role: self.role,
        }
    }
}

/// The `StageActor` implementation.
pub struct StageActor {
    spec: StageSpec,
    director_id: ParticipantId,
    /// Roster in join order.
    roster: Vec<Participant>,
    media: MediaSessions,
    engine: Arc<dyn MediaEngine>,
    receiver: mpsc::Receiver<StageMessage>,
    cancel_token: CancellationToken,
    metrics: Arc<RegistryMetrics>,
    created_at: i64,
}

impl StageActor {
    /// Spawn a stage actor with its creator seeded as director.
    ///
    /// Returns the handle, the task join handle and the director's
    /// participant id. Creation cannot fail: the requester's identity was
    /// already verified and the stage id is freshly assigned.
    pub fn spawn(
        spec: StageSpec,
        creator: Identity,
        creator_connection_id: String,
        creator_outbound: ConnectionHandle,
        engine: Arc<dyn MediaEngine>,
        metrics: Arc<RegistryMetrics>,
        cancel_token: CancellationToken,
    ) -> (StageActorHandle, JoinHandle<()>, ParticipantId) {
        let (sender, receiver) = mpsc::channel(STAGE_CHANNEL_BUFFER);

        let director_id = Uuid::new_v4().to_string();
        let director = Participant {
            participant_id: director_id.clone(),
            identity_id: creator.identity_id,
            name: creator.display_name,
            connection_id: creator_connection_id,
            role: ParticipantRole::Director,
            outbound: creator_outbound,
        };

        let mut media = MediaSessions::default();
        media.create(director_id.clone());
        metrics.participant_joined();

        let stage_id = spec.stage_id.clone();
        let actor = Self {
            spec,
            director_id: director_id.clone(),
            roster: vec![director],
            media,
            engine,
            receiver,
            cancel_token: cancel_token.clone(),
            metrics,
            created_at: chrono::Utc::now().timestamp(),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = StageActorHandle {
            sender,
            cancel_token,
            stage_id,
        };

        (handle, task_handle, director_id)
    }

    fn stage_info(&self) -> StageInfo {
        StageInfo {
            stage_id: self.spec.stage_id.clone(),
            name: self.spec.name.clone(),
            kind: self.spec.kind,
            mode: self.spec.mode,
            director_id: self.director_id.clone(),
        }
    }

    fn snapshot(&self) -> StageSnapshot {
        StageSnapshot {
            stage: self.stage_info(),
            participants: self.roster.iter().map(Participant::to_info).collect(),
        }
    }

    fn participant(&self, participant_id: &str) -> Option<&Participant> {
        self.roster
            .iter()
            .find(|p| p.participant_id == participant_id)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "stage.actor.stage", fields(stage_id = %self.spec.stage_id))]
    async fn run(mut self) {
        info!(
            target: "stage.actor.stage",
            stage_id = %self.spec.stage_id,
            kind = ?self.spec.kind,
            mode = ?self.spec.mode,
            created_at = self.created_at,
            "StageActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "stage.actor.stage",
                        stage_id = %self.spec.stage_id,
                        "StageActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => self.handle_message(message).await,
                        None => {
                            info!(
                                target: "stage.actor.stage",
                                stage_id = %self.spec.stage_id,
                                "StageActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "stage.actor.stage",
            stage_id = %self.spec.stage_id,
            participants = self.roster.len(),
            "StageActor stopped"
        );
    }

    /// Handle a single message.
    async fn handle_message(&mut self, message: StageMessage) {
        match message {
            StageMessage::Join {
                identity,
                connection_id,
                password,
                outbound,
                respond_to,
            } => {
                let result = self
                    .handle_join(identity, connection_id, password, outbound)
                    .await;
                let _ = respond_to.send(result);
            }

            StageMessage::Leave {
                participant_id,
                respond_to,
            } => {
                let result = self.handle_leave(&participant_id).await;
                let _ = respond_to.send(result);
            }

            StageMessage::ConnectionClosed {
                participant_id,
                connection_id,
            } => {
                self.handle_connection_closed(&participant_id, &connection_id)
                    .await;
            }

            StageMessage::RouterCapabilities { respond_to } => {
                let result = self
                    .engine
                    .router_capabilities(&self.spec.stage_id)
                    .await
                    .map_err(StageError::from);
                let _ = respond_to.send(result);
            }

            StageMessage::CreateTransport {
                participant_id,
                direction,
                rtp_capabilities: _,
                respond_to,
            } => {
                let result = self.handle_create_transport(&participant_id, direction).await;
                let _ = respond_to.send(result);
            }

            StageMessage::ConnectTransport {
                participant_id,
                transport_id,
                dtls_parameters,
                respond_to,
            } => {
                let result = self
                    .handle_connect_transport(&participant_id, &transport_id, &dtls_parameters)
                    .await;
                let _ = respond_to.send(result);
            }

            StageMessage::SendTrack {
                participant_id,
                transport_id,
                kind,
                rtp_parameters,
                respond_to,
            } => {
                let result = self
                    .handle_send_track(&participant_id, &transport_id, kind, &rtp_parameters)
                    .await;
                let _ = respond_to.send(result);
            }

            StageMessage::Consume {
                participant_id,
                producer_id,
                transport_id,
                rtp_capabilities,
                respond_to,
            } => {
                let result = self
                    .handle_consume(&participant_id, &producer_id, &transport_id, &rtp_capabilities)
                    .await;
                let _ = respond_to.send(result);
            }

            StageMessage::FinishConsume {
                participant_id,
                consumer_id,
                respond_to,
            } => {
                let result = self.handle_finish_consume(&participant_id, &consumer_id).await;
                let _ = respond_to.send(result);
            }

            StageMessage::CloseProducer {
                participant_id,
                producer_id,
            } => {
                self.handle_close_producer(&participant_id, &producer_id).await;
            }

            StageMessage::Relay {
                from_participant_id,
                from_connection_id,
                payload,
            } => {
                self.handle_relay(&from_participant_id, &from_connection_id, payload)
                    .await;
            }

            StageMessage::Snapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
        }
    }

    /// Broadcast an event to every participant except `exclude`.
    ///
    /// Per-recipient ordering follows the order broadcasts are issued here;
    /// each connection's writer drains its queue in order.
    async fn broadcast_except(&self, exclude: &str, message: ServerMessage) {
        for participant in &self.roster {
            if participant.participant_id == exclude {
                continue;
            }
            if let Err(e) = participant
                .outbound
                .send(ServerEnvelope::event(message.clone()))
                .await
            {
                warn!(
                    target: "stage.actor.stage",
                    stage_id = %self.spec.stage_id,
                    participant_id = %participant.participant_id,
                    error = %e,
                    "Failed to queue broadcast"
                );
            }
        }
    }

    /// Handle a new participant joining.
    #[instrument(skip_all, fields(stage_id = %self.spec.stage_id))]
    async fn handle_join(
        &mut self,
        identity: Identity,
        connection_id: String,
        password: Option<String>,
        outbound: ConnectionHandle,
    ) -> Result<JoinedStage, StageError> {
        // Exact-match password check; an absent stored password only
        // matches an absent supplied one. No roster mutation on failure.
        let stored = self.spec.password.as_deref().unwrap_or("");
        let supplied = password.as_deref().unwrap_or("");
        if stored != supplied {
            return Err(StageError::WrongPassword);
        }

        if self.roster.len() >= self.spec.max_participants {
            return Err(StageError::Conflict("Stage is full".to_string()));
        }

        if self
            .roster
            .iter()
            .any(|p| p.connection_id == connection_id)
        {
            return Err(StageError::Conflict(
                "Connection already joined this stage".to_string(),
            ));
        }

        let participant = Participant {
            participant_id: Uuid::new_v4().to_string(),
            identity_id: identity.identity_id,
            name: identity.display_name,
            connection_id: connection_id.clone(),
            role: ParticipantRole::Actor,
            outbound,
        };
        let info = participant.to_info();
        let participant_id = participant.participant_id.clone();

        self.roster.push(participant);
        self.media.create(participant_id.clone());
        self.metrics.participant_joined();

        // Announce to the pre-existing roster only.
        self.broadcast_except(&participant_id, ServerMessage::ParticipantJoined(info.clone()))
            .await;

        // Mesh stages additionally instruct the pre-existing side to open
        // an offer toward the newcomer.
        if self.spec.mode == CommunicationMode::Mesh {
            self.broadcast_except(
                &participant_id,
                relay::peer_added(&participant_id, &connection_id),
            )
            .await;
        }

        info!(
            target: "stage.actor.stage",
            total_participants = self.roster.len(),
            "Participant joined"
        );

        Ok(JoinedStage {
            participant_id,
            snapshot: self.snapshot(),
        })
    }

    /// Remove a participant and tear down everything it owns in the engine.
    ///
    /// Returns the removed participant's info, or `None` if already gone
    /// (removal is idempotent).
    async fn remove_participant(&mut self, participant_id: &str) -> Option<ParticipantInfo> {
        let index = self
            .roster
            .iter()
            .position(|p| p.participant_id == participant_id)?;
        let participant = self.roster.remove(index);
        let info = participant.to_info();

        if let Some(media) = self.media.remove(participant_id) {
            self.cleanup_media(participant_id, media).await;
        }
        self.metrics.participant_left();

        self.broadcast_except(participant_id, ServerMessage::ParticipantRemoved(info.clone()))
            .await;

        Some(info)
    }

    /// Close every engine resource a participant owned. Unconditional:
    /// failures are logged and the remaining resources are still closed.
    async fn cleanup_media(&self, participant_id: &str, media: ParticipantMedia) {
        let MediaCleanup {
            consumers,
            producers,
            transports,
        } = media.into_cleanup();

        for consumer_id in consumers {
            if let Err(e) = self.engine.close_consumer(&consumer_id).await {
                warn!(
                    target: "stage.actor.stage",
                    participant_id = %participant_id,
                    consumer_id = %consumer_id,
                    error = %e,
                    "Engine consumer close failed during teardown"
                );
            }
        }
        for producer_id in producers {
            if let Err(e) = self.engine.close_producer(&producer_id).await {
                warn!(
                    target: "stage.actor.stage",
                    participant_id = %participant_id,
                    producer_id = %producer_id,
                    error = %e,
                    "Engine producer close failed during teardown"
                );
            }
        }
        for transport_id in transports {
            if let Err(e) = self.engine.close_transport(&transport_id).await {
                warn!(
                    target: "stage.actor.stage",
                    participant_id = %participant_id,
                    transport_id = %transport_id,
                    error = %e,
                    "Engine transport close failed during teardown"
                );
            }
        }
    }

    async fn handle_leave(&mut self, participant_id: &str) -> Result<(), StageError> {
        match self.remove_participant(participant_id).await {
            Some(_) => {
                info!(
                    target: "stage.actor.stage",
                    stage_id = %self.spec.stage_id,
                    participant_id = %participant_id,
                    "Participant left"
                );
                Ok(())
            }
            None => Err(StageError::ParticipantNotFound(participant_id.to_string())),
        }
    }

    async fn handle_connection_closed(&mut self, participant_id: &str, connection_id: &str) {
        debug!(
            target: "stage.actor.stage",
            stage_id = %self.spec.stage_id,
            participant_id = %participant_id,
            connection_id = %connection_id,
            "Connection closed"
        );

        // Idempotent: a second notification for the same participant is a
        // no-op.
        if self.remove_participant(participant_id).await.is_some() {
            info!(
                target: "stage.actor.stage",
                stage_id = %self.spec.stage_id,
                participant_id = %participant_id,
                "Participant removed after disconnect"
            );
        }
    }

    async fn handle_create_transport(
        &mut self,
        participant_id: &str,
        direction: TransportDirection,
    ) -> Result<TransportOptions, StageError> {
        if self.media.get(participant_id).is_none() {
            return Err(StageError::ParticipantNotFound(participant_id.to_string()));
        }

        // Engine allocation first: on failure nothing becomes visible.
        let options = self.engine.create_transport(&self.spec.stage_id).await?;

        let replaced = self
            .media
            .get_mut(participant_id)
            .ok_or_else(|| StageError::ParticipantNotFound(participant_id.to_string()))?
            .set_transport(options.transport_id.clone(), direction);

        // Renegotiation: the displaced transport and everything it owned is
        // closed in the engine.
        if let Some(old) = replaced {
            debug!(
                target: "stage.actor.stage",
                participant_id = %participant_id,
                transport_id = %old.transport_id,
                "Transport renegotiated, closing previous"
            );
            for consumer_id in &old.consumers {
                let _ = self.engine.close_consumer(consumer_id).await;
            }
            for producer_id in &old.producers {
                let _ = self.engine.close_producer(producer_id).await;
            }
            if let Err(e) = self.engine.close_transport(&old.transport_id).await {
                warn!(
                    target: "stage.actor.stage",
                    transport_id = %old.transport_id,
                    error = %e,
                    "Engine close of displaced transport failed"
                );
            }
        }

        Ok(options)
    }

    async fn handle_connect_transport(
        &mut self,
        participant_id: &str,
        transport_id: &str,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), StageError> {
        let media = self
            .media
            .get(participant_id)
            .ok_or_else(|| StageError::ParticipantNotFound(participant_id.to_string()))?;
        if media.transport(transport_id).is_none() {
            return Err(StageError::TransportNotFound(transport_id.to_string()));
        }

        self.engine
            .connect_transport(transport_id, dtls_parameters)
            .await?;

        if let Some(media) = self.media.get_mut(participant_id) {
            media.mark_connected(transport_id);
        }
        Ok(())
    }

    async fn handle_send_track(
        &mut self,
        participant_id: &str,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<ProducerId, StageError> {
        let media = self
            .media
            .get(participant_id)
            .ok_or_else(|| StageError::ParticipantNotFound(participant_id.to_string()))?;
        let transport = media
            .transport(transport_id)
            .ok_or_else(|| StageError::TransportNotFound(transport_id.to_string()))?;
        if transport.direction != TransportDirection::Send {
            return Err(StageError::Conflict(
                "Cannot produce on a receive transport".to_string(),
            ));
        }
        if !transport.connected {
            return Err(StageError::Conflict(
                "Transport is not connected yet".to_string(),
            ));
        }

        let producer_id = self
            .engine
            .produce(transport_id, kind, rtp_parameters)
            .await?;

        if let Some(media) = self.media.get_mut(participant_id) {
            media.record_producer(ProducerRecord {
                producer_id: producer_id.clone(),
                transport_id: transport_id.to_string(),
                kind,
            });
        }

        // The producer is registered before the broadcast goes out, so every
        // id peers see refers to a live producer.
        self.broadcast_except(
            participant_id,
            ServerMessage::ProducerAdded {
                participant_id: participant_id.to_string(),
                producer_id: producer_id.clone(),
                kind,
            },
        )
        .await;

        info!(
            target: "stage.actor.stage",
            stage_id = %self.spec.stage_id,
            participant_id = %participant_id,
            producer_id = %producer_id,
            kind = ?kind,
            "Track published"
        );

        Ok(producer_id)
    }

    async fn handle_consume(
        &mut self,
        participant_id: &str,
        producer_id: &str,
        transport_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerCreated, StageError> {
        let media = self
            .media
            .get(participant_id)
            .ok_or_else(|| StageError::ParticipantNotFound(participant_id.to_string()))?;
        let transport = media
            .transport(transport_id)
            .ok_or_else(|| StageError::TransportNotFound(transport_id.to_string()))?;
        if transport.direction != TransportDirection::Receive {
            return Err(StageError::Conflict(
                "Cannot consume on a send transport".to_string(),
            ));
        }
        if !transport.connected {
            return Err(StageError::Conflict(
                "Transport is not connected yet".to_string(),
            ));
        }
        if self.media.producer_owner(producer_id).is_none() {
            return Err(StageError::ProducerNotFound(producer_id.to_string()));
        }

        let created = self
            .engine
            .consume(transport_id, producer_id, rtp_capabilities)
            .await?;

        if let Some(media) = self.media.get_mut(participant_id) {
            media.record_consumer(ConsumerRecord {
                consumer_id: created.consumer_id.clone(),
                transport_id: transport_id.to_string(),
                producer_id: producer_id.to_string(),
                resumed: false,
            });
        }

        Ok(created)
    }

    async fn handle_finish_consume(
        &mut self,
        participant_id: &str,
        consumer_id: &str,
    ) -> Result<(), StageError> {
        let media = self
            .media
            .get(participant_id)
            .ok_or_else(|| StageError::ParticipantNotFound(participant_id.to_string()))?;
        if media.consumer(consumer_id).is_none() {
            return Err(StageError::ConsumerNotFound(consumer_id.to_string()));
        }

        self.engine.resume_consumer(consumer_id).await?;

        if let Some(media) = self.media.get_mut(participant_id) {
            media.mark_consumer_resumed(consumer_id);
        }
        Ok(())
    }

    async fn handle_close_producer(&mut self, participant_id: &str, producer_id: &str) {
        let removed = self
            .media
            .get_mut(participant_id)
            .and_then(|media| media.remove_producer(producer_id));

        match removed {
            Some(_) => {
                if let Err(e) = self.engine.close_producer(producer_id).await {
                    warn!(
                        target: "stage.actor.stage",
                        producer_id = %producer_id,
                        error = %e,
                        "Engine producer close failed"
                    );
                }
                debug!(
                    target: "stage.actor.stage",
                    stage_id = %self.spec.stage_id,
                    participant_id = %participant_id,
                    producer_id = %producer_id,
                    "Producer closed"
                );
            }
            None => {
                warn!(
                    target: "stage.actor.stage",
                    stage_id = %self.spec.stage_id,
                    participant_id = %participant_id,
                    producer_id = %producer_id,
                    "close-producer for unknown producer"
                );
            }
        }
    }

    async fn handle_relay(
        &mut self,
        from_participant_id: &str,
        from_connection_id: &str,
        payload: RelayPayload,
    ) {
        let (target_connection_id, message) = relay::route(
            &from_participant_id.to_string(),
            &from_connection_id.to_string(),
            payload,
        );

        let target = self
            .roster
            .iter()
            .find(|p| p.connection_id == target_connection_id);

        match target {
            Some(participant) => {
                if let Err(e) = participant
                    .outbound
                    .send(ServerEnvelope::event(message))
                    .await
                {
                    warn!(
                        target: "stage.actor.stage",
                        connection_id = %target_connection_id,
                        error = %e,
                        "Failed to queue relayed message"
                    );
                }
            }
            None => {
                warn!(
                    target: "stage.actor.stage",
                    stage_id = %self.spec.stage_id,
                    connection_id = %target_connection_id,
                    "Relay target not in stage"
                );
            }
        }
    }

    /// Tear down every participant's engine resources on shutdown.
    async fn graceful_shutdown(&mut self) {
        let participants: Vec<ParticipantId> = self
            .roster
            .iter()
            .map(|p| p.participant_id.clone())
            .collect();

        for participant_id in participants {
            if let Some(media) = self.media.remove(&participant_id) {
                self.cleanup_media(&participant_id, media).await;
            }
            self.metrics.participant_left();
        }
        self.roster.clear();
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use crate::config::default_media_codecs;
    use crate::engine::{
        RtcEngine, RtcEngineSettings, DEFAULT_INITIAL_AVAILABLE_OUTGOING_BITRATE,
        DEFAULT_MAX_INCOMING_BITRATE,
    };

    use std::time::Duration;
    use tokio::time::timeout;

    fn test_engine() -> Arc<RtcEngine> {
        Arc::new(RtcEngine::new(RtcEngineSettings {
            listen_ip: "127.0.0.1".to_string(),
            announced_ip: None,
            rtc_min_port: 40000,
            rtc_max_port: 40099,
            media_codecs: default_media_codecs(),
            initial_available_outgoing_bitrate: DEFAULT_INITIAL_AVAILABLE_OUTGOING_BITRATE,
            max_incoming_bitrate: DEFAULT_MAX_INCOMING_BITRATE,
        }))
    }

    fn test_spec(mode: CommunicationMode, password: Option<&str>) -> StageSpec {
        StageSpec {
            stage_id: "stage-1".to_string(),
            name: "rehearsal".to_string(),
            kind: StageKind::Music,
            mode,
            password: password.map(ToString::to_string),
            max_participants: 16,
        }
    }

    fn identity(id: &str, name: &str) -> Identity {
        Identity {
            identity_id: id.to_string(),
            display_name: name.to_string(),
        }
    }

    fn outbound(connection_id: &str) -> (ConnectionHandle, mpsc::Receiver<ServerEnvelope>) {
        let (tx, rx) = mpsc::channel(64);
        (ConnectionHandle::new(connection_id.to_string(), tx), rx)
    }

    async fn next_event(rx: &mut mpsc::Receiver<ServerEnvelope>) -> ServerMessage {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
            .message
    }

    fn spawn_stage(
        mode: CommunicationMode,
        password: Option<&str>,
    ) -> (
        StageActorHandle,
        ParticipantId,
        mpsc::Receiver<ServerEnvelope>,
        Arc<RtcEngine>,
    ) {
        let engine = test_engine();
        let (creator_out, creator_rx) = outbound("conn-a");
        let (handle, _task, director_id) = StageActor::spawn(
            test_spec(mode, password),
            identity("id-a", "Alice"),
            "conn-a".to_string(),
            creator_out,
            Arc::clone(&engine) as Arc<dyn MediaEngine>,
            RegistryMetrics::new(),
            CancellationToken::new(),
        );
        (handle, director_id, creator_rx, engine)
    }

    async fn join_stage(
        handle: &StageActorHandle,
        id: &str,
        name: &str,
        connection_id: &str,
        password: Option<&str>,
    ) -> (JoinedStage, mpsc::Receiver<ServerEnvelope>) {
        let (out, rx) = outbound(connection_id);
        let joined = handle
            .join(
                identity(id, name),
                connection_id.to_string(),
                password.map(ToString::to_string),
                out,
            )
            .await
            .expect("join should succeed");
        (joined, rx)
    }

    #[tokio::test]
    async fn test_create_then_join_yields_two_participants_in_join_order() {
        let (handle, director_id, mut creator_rx, _engine) =
            spawn_stage(CommunicationMode::Sfu, None);

        let (joined, _bob_rx) = join_stage(&handle, "id-b", "Bob", "conn-b", None).await;

        let snapshot = joined.snapshot;
        assert_eq!(snapshot.participants.len(), 2);
        assert_eq!(snapshot.participants[0].participant_id, director_id);
        assert_eq!(snapshot.participants[0].role, ParticipantRole::Director);
        assert_eq!(snapshot.participants[1].participant_id, joined.participant_id);
        assert_eq!(snapshot.participants[1].role, ParticipantRole::Actor);

        // Only the pre-existing participant sees the join broadcast.
        match next_event(&mut creator_rx).await {
            ServerMessage::ParticipantJoined(info) => {
                assert_eq!(info.participant_id, joined.participant_id);
                assert_eq!(info.name, "Bob");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wrong_password_rejects_without_roster_mutation() {
        let (handle, _director_id, _creator_rx, _engine) =
            spawn_stage(CommunicationMode::Sfu, Some("s3cret"));

        let (out, _rx) = outbound("conn-b");
        let result = handle
            .join(
                identity("id-b", "Bob"),
                "conn-b".to_string(),
                Some("wrong".to_string()),
                out,
            )
            .await;
        assert!(matches!(result, Err(StageError::WrongPassword)));

        let snapshot = handle.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.participants.len(), 1);
    }

    #[tokio::test]
    async fn test_absent_password_only_matches_absent() {
        let (handle, _director_id, _creator_rx, _engine) =
            spawn_stage(CommunicationMode::Sfu, None);

        let (out, _rx) = outbound("conn-b");
        let result = handle
            .join(
                identity("id-b", "Bob"),
                "conn-b".to_string(),
                Some("anything".to_string()),
                out,
            )
            .await;
        assert!(matches!(result, Err(StageError::WrongPassword)));
    }

    async fn connect_direction(
        handle: &StageActorHandle,
        participant_id: &str,
        direction: TransportDirection,
    ) -> TransportOptions {
        let options = handle
            .create_transport(
                participant_id.to_string(),
                direction,
                RtpCapabilities::default(),
            )
            .await
            .expect("create transport");
        handle
            .connect_transport(
                participant_id.to_string(),
                options.transport_id.clone(),
                DtlsParameters::default(),
            )
            .await
            .expect("connect transport");
        options
    }

    #[tokio::test]
    async fn test_publish_broadcasts_to_present_participants_only() {
        let (handle, director_id, _creator_rx, _engine) =
            spawn_stage(CommunicationMode::Sfu, None);
        let (joined_b, mut bob_rx) = join_stage(&handle, "id-b", "Bob", "conn-b", None).await;

        // Drain nothing for bob: he joined last, saw no broadcast yet.
        let send = connect_direction(&handle, &director_id, TransportDirection::Send).await;

        let producer_id = handle
            .send_track(
                director_id.clone(),
                send.transport_id.clone(),
                MediaKind::Audio,
                RtpParameters::default(),
            )
            .await
            .expect("send track");

        match next_event(&mut bob_rx).await {
            ServerMessage::ProducerAdded {
                participant_id,
                producer_id: announced,
                kind,
            } => {
                assert_eq!(participant_id, director_id);
                assert_eq!(announced, producer_id);
                assert_eq!(kind, MediaKind::Audio);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // A participant joining after the broadcast never sees it.
        let (_joined_c, mut carol_rx) = join_stage(&handle, "id-c", "Carol", "conn-c", None).await;
        let _ = joined_b;
        assert!(
            timeout(Duration::from_millis(100), carol_rx.recv())
                .await
                .is_err(),
            "late joiner must not receive earlier producer-added"
        );
    }

    #[tokio::test]
    async fn test_produce_requires_connected_send_transport() {
        let (handle, director_id, _creator_rx, _engine) =
            spawn_stage(CommunicationMode::Sfu, None);

        let options = handle
            .create_transport(
                director_id.clone(),
                TransportDirection::Send,
                RtpCapabilities::default(),
            )
            .await
            .expect("create transport");

        // Produce before connect-transport ack is refused.
        let result = handle
            .send_track(
                director_id.clone(),
                options.transport_id.clone(),
                MediaKind::Audio,
                RtpParameters::default(),
            )
            .await;
        assert!(matches!(result, Err(StageError::Conflict(_))));

        // Producing on a receive transport is refused.
        let recv = connect_direction(&handle, &director_id, TransportDirection::Receive).await;
        let result = handle
            .send_track(
                director_id.clone(),
                recv.transport_id,
                MediaKind::Audio,
                RtpParameters::default(),
            )
            .await;
        assert!(matches!(result, Err(StageError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_consume_flow_paused_then_resumed() {
        let (handle, director_id, _creator_rx, engine) =
            spawn_stage(CommunicationMode::Sfu, None);
        let (joined_b, _bob_rx) = join_stage(&handle, "id-b", "Bob", "conn-b", None).await;
        let bob_id = joined_b.participant_id;

        let send = connect_direction(&handle, &director_id, TransportDirection::Send).await;
        let producer_id = handle
            .send_track(
                director_id.clone(),
                send.transport_id.clone(),
                MediaKind::Audio,
                RtpParameters::default(),
            )
            .await
            .expect("send track");

        let recv = connect_direction(&handle, &bob_id, TransportDirection::Receive).await;
        let created = handle
            .consume(
                bob_id.clone(),
                producer_id.clone(),
                recv.transport_id.clone(),
                RtpCapabilities {
                    codecs: default_media_codecs(),
                    header_extensions: serde_json::Value::Null,
                },
            )
            .await
            .expect("consume");

        assert!(created.paused);
        assert_eq!(engine.consumer_paused(&created.consumer_id), Some(true));

        handle
            .finish_consume(bob_id.clone(), created.consumer_id.clone())
            .await
            .expect("finish consume");
        assert_eq!(engine.consumer_paused(&created.consumer_id), Some(false));
    }

    #[tokio::test]
    async fn test_consume_unknown_producer_is_not_found() {
        let (handle, director_id, _creator_rx, _engine) =
            spawn_stage(CommunicationMode::Sfu, None);
        let recv = connect_direction(&handle, &director_id, TransportDirection::Receive).await;

        let result = handle
            .consume(
                director_id.clone(),
                "no-such-producer".to_string(),
                recv.transport_id,
                RtpCapabilities::default(),
            )
            .await;
        assert!(matches!(result, Err(StageError::ProducerNotFound(_))));
    }

    #[tokio::test]
    async fn test_disconnect_tears_down_engine_resources() {
        let (handle, director_id, mut creator_rx, engine) =
            spawn_stage(CommunicationMode::Sfu, None);
        let (joined_b, _bob_rx) = join_stage(&handle, "id-b", "Bob", "conn-b", None).await;
        let bob_id = joined_b.participant_id;

        // Bob gets mid-negotiation: receive transport created but never
        // connected.
        let recv = handle
            .create_transport(
                bob_id.clone(),
                TransportDirection::Receive,
                RtpCapabilities::default(),
            )
            .await
            .expect("create transport");
        assert!(engine.transport_exists(&recv.transport_id));

        handle
            .connection_closed(bob_id.clone(), "conn-b".to_string())
            .await
            .expect("connection closed");

        // Roster no longer contains Bob; no orphaned transport remains.
        let snapshot = handle.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.participants.len(), 1);
        assert!(!engine.transport_exists(&recv.transport_id));

        // Skip the participant-joined broadcast, then expect the removal.
        match next_event(&mut creator_rx).await {
            ServerMessage::ParticipantJoined(_) => {}
            other => panic!("unexpected event: {other:?}"),
        }
        match next_event(&mut creator_rx).await {
            ServerMessage::ParticipantRemoved(info) => {
                assert_eq!(info.participant_id, bob_id);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // Closing twice is a no-op.
        handle
            .connection_closed(bob_id, "conn-b".to_string())
            .await
            .expect("second close is a no-op");
    }

    #[tokio::test]
    async fn test_mesh_join_announces_peer_to_existing_roster_only() {
        let (handle, _director_id, mut creator_rx, _engine) =
            spawn_stage(CommunicationMode::Mesh, None);
        let (joined_b, mut bob_rx) = join_stage(&handle, "id-b", "Bob", "conn-b", None).await;

        match next_event(&mut creator_rx).await {
            ServerMessage::ParticipantJoined(_) => {}
            other => panic!("unexpected event: {other:?}"),
        }
        match next_event(&mut creator_rx).await {
            ServerMessage::PeerAdded {
                participant_id,
                connection_id,
            } => {
                assert_eq!(participant_id, joined_b.participant_id);
                assert_eq!(connection_id, "conn-b");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // The newcomer never receives peer-added: it only answers.
        assert!(timeout(Duration::from_millis(100), bob_rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_relay_routes_to_target_connection() {
        let (handle, director_id, _creator_rx, _engine) =
            spawn_stage(CommunicationMode::Mesh, None);
        let (joined_b, mut bob_rx) = join_stage(&handle, "id-b", "Bob", "conn-b", None).await;

        let offer =
            stage_protocol::types::SessionDescription(serde_json::json!({"type": "offer"}));
        handle
            .relay(
                director_id.clone(),
                "conn-a".to_string(),
                RelayPayload::Offer {
                    target_connection_id: "conn-b".to_string(),
                    offer: offer.clone(),
                },
            )
            .await
            .expect("relay");

        match next_event(&mut bob_rx).await {
            ServerMessage::OfferMade {
                participant_id,
                connection_id,
                offer: forwarded,
            } => {
                assert_eq!(participant_id, director_id);
                assert_eq!(connection_id, "conn-a");
                assert_eq!(forwarded, offer);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        let _ = joined_b;
    }

    #[tokio::test]
    async fn test_close_producer_removes_engine_resource() {
        let (handle, director_id, _creator_rx, engine) =
            spawn_stage(CommunicationMode::Sfu, None);
        let send = connect_direction(&handle, &director_id, TransportDirection::Send).await;
        let producer_id = handle
            .send_track(
                director_id.clone(),
                send.transport_id.clone(),
                MediaKind::Video,
                RtpParameters::default(),
            )
            .await
            .expect("send track");
        assert!(engine.producer_exists(&producer_id));

        handle
            .close_producer(director_id.clone(), producer_id.clone())
            .await
            .expect("close producer");

        // The close is fire-and-forget; give the mailbox a beat.
        let snapshot = handle.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.participants.len(), 1);
        assert!(!engine.producer_exists(&producer_id));
    }

    #[tokio::test]
    async fn test_cancellation_cleans_up_engine() {
        let (handle, director_id, _creator_rx, engine) =
            spawn_stage(CommunicationMode::Sfu, None);
        let _send = connect_direction(&handle, &director_id, TransportDirection::Send).await;
        assert_eq!(engine.live_transport_count(), 1);

        handle.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.live_transport_count(), 0);
    }
}
