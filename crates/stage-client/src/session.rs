//! Top-level client session state machine.
//!
//! `Disconnected → Connecting → Connected → Authenticating → InStage →
//! Publishing`
//!
//! The identity token is exchanged as part of the create/join request (the
//! protocol has no standalone auth event); the `Authenticating` state spans
//! that round-trip. `disconnect` is reachable from every state and returns
//! the controller to `Disconnected`. There is no automatic re-entry after a
//! failure: the `Disconnected` event is terminal and callers re-join from
//! scratch.

use crate::channel::{Channel, ChannelConfig};
use crate::errors::SessionError;
use crate::events::SessionEvent;
use crate::media::{LocalTrack, MediaStack};
use crate::mesh::{MeshConnector, PeerConnector};
use crate::orchestrator::TransportOrchestrator;

use stage_protocol::messages::{ClientMessage, ServerMessage};
use stage_protocol::types::{
    CommunicationMode, ParticipantId, StageCreated, StageInfo, StageJoined, StageKind,
    StageSnapshot,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    InStage,
    Publishing,
}

/// Session configuration.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub channel: ChannelConfig,
}

/// Top-level client controller for one stage session.
pub struct SessionController {
    state: SessionState,
    config: SessionConfig,
    stack: Arc<dyn MediaStack>,
    peer_connector: Arc<dyn PeerConnector>,

    channel: Option<Channel>,
    stage: Option<StageInfo>,
    participant_id: Option<ParticipantId>,
    orchestrator: Option<Arc<Mutex<TransportOrchestrator>>>,
    mesh: Option<Arc<Mutex<MeshConnector>>>,
    event_task: Option<JoinHandle<()>>,

    events_tx: mpsc::UnboundedSender<SessionEvent>,
    disconnected: Arc<AtomicBool>,
}

impl SessionController {
    /// Create a controller and the event stream for the UI layer.
    #[must_use]
    pub fn new(
        stack: Arc<dyn MediaStack>,
        peer_connector: Arc<dyn PeerConnector>,
        config: SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                state: SessionState::Disconnected,
                config,
                stack,
                peer_connector,
                channel: None,
                stage: None,
                participant_id: None,
                orchestrator: None,
                mesh: None,
                event_task: None,
                events_tx,
                disconnected: Arc::new(AtomicBool::new(false)),
            },
            events_rx,
        )
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The joined stage, if any.
    #[must_use]
    pub fn stage(&self) -> Option<&StageInfo> {
        self.stage.as_ref()
    }

    /// Own participant id, if in a stage.
    #[must_use]
    pub fn participant_id(&self) -> Option<&str> {
        self.participant_id.as_deref()
    }

    /// Open the signaling channel.
    ///
    /// # Errors
    ///
    /// `SessionError::InvalidState` unless currently `Disconnected`;
    /// `SessionError::Connection` if the endpoint is unreachable.
    pub async fn connect(&mut self, endpoint: &str) -> Result<(), SessionError> {
        if self.state != SessionState::Disconnected {
            return Err(SessionError::InvalidState(format!(
                "connect is only valid when disconnected (state: {:?})",
                self.state
            )));
        }
        self.state = SessionState::Connecting;

        match Channel::connect(endpoint, self.config.channel.clone()).await {
            Ok(channel) => {
                self.channel = Some(channel);
                self.state = SessionState::Connected;
                self.disconnected.store(false, Ordering::SeqCst);
                info!(target: "stage.client.session", endpoint = %endpoint, "Channel connected");
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Adopt an already-connected channel (tests and embedders that manage
    /// their own sockets).
    ///
    /// # Errors
    ///
    /// `SessionError::InvalidState` unless currently `Disconnected`.
    pub fn connect_with(&mut self, channel: Channel) -> Result<(), SessionError> {
        if self.state != SessionState::Disconnected {
            return Err(SessionError::InvalidState(format!(
                "connect is only valid when disconnected (state: {:?})",
                self.state
            )));
        }
        self.channel = Some(channel);
        self.state = SessionState::Connected;
        self.disconnected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn channel(&self) -> Result<Channel, SessionError> {
        self.channel
            .clone()
            .ok_or_else(|| SessionError::InvalidState("no channel".to_string()))
    }

    fn guard_not_in_stage(&self) -> Result<(), SessionError> {
        match self.state {
            SessionState::InStage | SessionState::Publishing => Err(SessionError::InvalidState(
                "already in a stage; leave or disconnect first".to_string(),
            )),
            SessionState::Connected => Ok(()),
            other => Err(SessionError::InvalidState(format!(
                "must be connected to create or join a stage (state: {other:?})"
            ))),
        }
    }

    /// Create a stage and become its director.
    ///
    /// # Errors
    ///
    /// Fails fast with `SessionError::InvalidState` when already in a
    /// stage; otherwise authentication/server errors surface unchanged.
    pub async fn create_stage(
        &mut self,
        identity_token: &str,
        stage_name: &str,
        kind: StageKind,
        mode: CommunicationMode,
        password: Option<String>,
    ) -> Result<StageInfo, SessionError> {
        self.guard_not_in_stage()?;
        let channel = self.channel()?;

        self.state = SessionState::Authenticating;
        let created: StageCreated = match channel
            .request(ClientMessage::CreateStage {
                identity_token: identity_token.to_string(),
                stage_name: stage_name.to_string(),
                kind,
                mode,
                password,
            })
            .await
        {
            Ok(created) => created,
            Err(e) => {
                self.state = SessionState::Connected;
                return Err(e);
            }
        };

        let stage = StageInfo {
            stage_id: created.stage_id,
            name: stage_name.to_string(),
            kind,
            mode,
            director_id: created.participant_id.clone(),
        };
        self.enter_stage(stage.clone(), created.participant_id)
            .await?;
        Ok(stage)
    }

    /// Join an existing stage as an actor.
    ///
    /// # Errors
    ///
    /// Fails fast with `SessionError::InvalidState` when already in a
    /// stage; `NotFound`/`Permission` surface from the server.
    pub async fn join_stage(
        &mut self,
        identity_token: &str,
        stage_id: &str,
        password: Option<String>,
    ) -> Result<StageSnapshot, SessionError> {
        self.guard_not_in_stage()?;
        let channel = self.channel()?;

        self.state = SessionState::Authenticating;
        let joined: StageJoined = match channel
            .request(ClientMessage::JoinStage {
                identity_token: identity_token.to_string(),
                stage_id: stage_id.to_string(),
                password,
            })
            .await
        {
            Ok(joined) => joined,
            Err(e) => {
                self.state = SessionState::Connected;
                return Err(e);
            }
        };

        let snapshot = joined.snapshot.clone();
        self.enter_stage(joined.snapshot.stage, joined.participant_id)
            .await?;
        Ok(snapshot)
    }

    /// Wire the media path and the event loop for the joined stage.
    async fn enter_stage(
        &mut self,
        stage: StageInfo,
        participant_id: ParticipantId,
    ) -> Result<(), SessionError> {
        let channel = self.channel()?;
        self.participant_id = Some(participant_id.clone());

        // Subscribe before the media handshake: broadcasts arriving while
        // transports are still negotiating buffer in the subscription
        // instead of being lost.
        let events = channel.subscribe();

        match stage.mode {
            CommunicationMode::Sfu => {
                let mut orchestrator = TransportOrchestrator::new(
                    channel.clone(),
                    Arc::clone(&self.stack),
                    participant_id.clone(),
                    self.events_tx.clone(),
                );
                // Capability/transport failures are fatal to the media
                // session and surface to the caller; the stage membership
                // itself stands.
                let start_result = orchestrator.start().await;
                let orchestrator = Arc::new(Mutex::new(orchestrator));
                self.orchestrator = Some(Arc::clone(&orchestrator));
                self.spawn_event_loop(events, &channel, Some(orchestrator), None);
                self.stage = Some(stage);
                self.state = SessionState::InStage;
                start_result?;
            }
            CommunicationMode::Mesh => {
                let mesh = Arc::new(Mutex::new(MeshConnector::new(
                    channel.clone(),
                    Arc::clone(&self.peer_connector),
                    self.events_tx.clone(),
                )));
                self.mesh = Some(Arc::clone(&mesh));
                self.spawn_event_loop(events, &channel, None, Some(mesh));
                self.stage = Some(stage);
                self.state = SessionState::InStage;
            }
        }

        info!(
            target: "stage.client.session",
            participant_id = %participant_id,
            "Entered stage"
        );
        Ok(())
    }

    fn spawn_event_loop(
        &mut self,
        events: broadcast::Receiver<ServerMessage>,
        channel: &Channel,
        orchestrator: Option<Arc<Mutex<TransportOrchestrator>>>,
        mesh: Option<Arc<Mutex<MeshConnector>>>,
    ) {
        let closed = channel.closed_token();
        let task = tokio::spawn(run_event_loop(
            events,
            closed,
            orchestrator,
            mesh,
            self.events_tx.clone(),
            Arc::clone(&self.disconnected),
        ));
        self.event_task = Some(task);
    }

    /// Publish a local track into the stage.
    ///
    /// # Errors
    ///
    /// `SessionError::InvalidState` outside a stage; media/server errors
    /// surface unchanged.
    pub async fn publish_track(&mut self, track: LocalTrack) -> Result<(), SessionError> {
        if !matches!(
            self.state,
            SessionState::InStage | SessionState::Publishing
        ) {
            return Err(SessionError::InvalidState(
                "must be in a stage to publish".to_string(),
            ));
        }

        if let Some(orchestrator) = &self.orchestrator {
            orchestrator.lock().await.publish_track(track).await?;
        } else if let Some(mesh) = &self.mesh {
            mesh.lock().await.publish_track(track).await?;
        } else {
            return Err(SessionError::InvalidState(
                "no media path wired".to_string(),
            ));
        }

        self.state = SessionState::Publishing;
        Ok(())
    }

    /// Unpublish a previously published track by its local track id.
    ///
    /// # Errors
    ///
    /// `SessionError::NotFound` if the track is not published.
    pub async fn unpublish_track(&mut self, track_id: &str) -> Result<(), SessionError> {
        if let Some(orchestrator) = &self.orchestrator {
            orchestrator.lock().await.unpublish_track(track_id)?;
            Ok(())
        } else if let Some(mesh) = &self.mesh {
            mesh.lock().await.unpublish_track(track_id).await
        } else {
            Err(SessionError::InvalidState(
                "no media path wired".to_string(),
            ))
        }
    }

    /// Leave the stage, keeping the channel open.
    ///
    /// # Errors
    ///
    /// `SessionError::InvalidState` outside a stage.
    pub async fn leave_stage(&mut self) -> Result<(), SessionError> {
        if !matches!(
            self.state,
            SessionState::InStage | SessionState::Publishing
        ) {
            return Err(SessionError::InvalidState(
                "not in a stage".to_string(),
            ));
        }
        let channel = self.channel()?;

        let _: stage_protocol::types::Ack = channel.request(ClientMessage::LeaveStage).await?;
        self.teardown_stage().await;
        self.state = SessionState::Connected;
        info!(target: "stage.client.session", "Left stage");
        Ok(())
    }

    /// Disconnect entirely. Reachable from any state: stops local media,
    /// closes peer links and transports, closes the channel and returns to
    /// `Disconnected`.
    pub async fn disconnect(&mut self) {
        debug!(target: "stage.client.session", state = ?self.state, "Disconnecting");

        self.teardown_stage().await;

        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        self.state = SessionState::Disconnected;
        info!(target: "stage.client.session", "Disconnected");
    }

    /// Stop the event loop and release local media objects.
    async fn teardown_stage(&mut self) {
        if let Some(task) = self.event_task.take() {
            task.abort();
        }
        if let Some(orchestrator) = self.orchestrator.take() {
            orchestrator.lock().await.close().await;
        }
        if let Some(mesh) = self.mesh.take() {
            mesh.lock().await.close().await;
        }
        self.stage = None;
        self.participant_id = None;
    }
}

/// Dispatch unsolicited server events to the media path and the UI layer.
async fn run_event_loop(
    mut events: broadcast::Receiver<ServerMessage>,
    closed: CancellationToken,
    orchestrator: Option<Arc<Mutex<TransportOrchestrator>>>,
    mesh: Option<Arc<Mutex<MeshConnector>>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    disconnected: Arc<AtomicBool>,
) {
    let emit_disconnected = |events_tx: &mpsc::UnboundedSender<SessionEvent>| {
        if !disconnected.swap(true, Ordering::SeqCst) {
            let _ = events_tx.send(SessionEvent::Disconnected);
        }
    };

    loop {
        tokio::select! {
            () = closed.cancelled() => {
                // One terminal notification; re-entry is a full re-join.
                emit_disconnected(&events_tx);
                break;
            }

            event = events.recv() => {
                match event {
                    Ok(message) => {
                        handle_server_event(message, &orchestrator, &mesh, &events_tx).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(
                            target: "stage.client.session",
                            missed = missed,
                            "Event loop lagged behind server events"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        emit_disconnected(&events_tx);
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_server_event(
    message: ServerMessage,
    orchestrator: &Option<Arc<Mutex<TransportOrchestrator>>>,
    mesh: &Option<Arc<Mutex<MeshConnector>>>,
    events_tx: &mpsc::UnboundedSender<SessionEvent>,
) {
    match message {
        ServerMessage::ParticipantJoined(info) => {
            let _ = events_tx.send(SessionEvent::ParticipantJoined(info));
        }

        ServerMessage::ParticipantRemoved(info) => {
            let _ = events_tx.send(SessionEvent::ParticipantRemoved(info));
        }

        ServerMessage::ProducerAdded {
            participant_id,
            producer_id,
            kind,
        } => {
            if let Some(orchestrator) = orchestrator {
                let result = orchestrator
                    .lock()
                    .await
                    .handle_producer_added(participant_id, producer_id.clone(), kind)
                    .await;
                if let Err(e) = result {
                    warn!(
                        target: "stage.client.session",
                        producer_id = %producer_id,
                        error = %e,
                        "Consuming announced producer failed"
                    );
                }
            }
        }

        ServerMessage::PeerAdded {
            participant_id,
            connection_id,
        } => {
            if let Some(mesh) = mesh {
                if let Err(e) = mesh
                    .lock()
                    .await
                    .handle_peer_added(participant_id, connection_id)
                    .await
                {
                    warn!(
                        target: "stage.client.session",
                        error = %e,
                        "Opening peer link failed"
                    );
                }
            }
        }

        ServerMessage::OfferMade {
            participant_id,
            connection_id,
            offer,
        } => {
            if let Some(mesh) = mesh {
                if let Err(e) = mesh
                    .lock()
                    .await
                    .handle_offer_made(participant_id, connection_id, &offer)
                    .await
                {
                    warn!(
                        target: "stage.client.session",
                        error = %e,
                        "Answering offer failed"
                    );
                }
            }
        }

        ServerMessage::AnswerMade {
            connection_id,
            answer,
            ..
        } => {
            if let Some(mesh) = mesh {
                if let Err(e) = mesh
                    .lock()
                    .await
                    .handle_answer_made(&connection_id, &answer)
                    .await
                {
                    warn!(
                        target: "stage.client.session",
                        error = %e,
                        "Applying answer failed"
                    );
                }
            }
        }

        ServerMessage::CandidateSent {
            connection_id,
            candidate,
            ..
        } => {
            if let Some(mesh) = mesh {
                if let Err(e) = mesh
                    .lock()
                    .await
                    .handle_candidate_sent(&connection_id, &candidate)
                    .await
                {
                    warn!(
                        target: "stage.client.session",
                        error = %e,
                        "Applying candidate failed"
                    );
                }
            }
        }

        ServerMessage::Response(_) => {
            // Responses are consumed by the channel's pending map; one
            // arriving here has no correlation id and is a server bug.
            warn!(
                target: "stage.client.session",
                "Uncorrelated response event ignored"
            );
        }
    }
}
