//! `RegistryActor` - singleton stage registry.
//!
//! The authoritative in-memory map from stage id to its `StageActor`. It
//! supervises stage actors: creates them with the requester seeded as
//! director, resolves handles for joins, and tears everything down on
//! shutdown.
//!
//! Stages whose roster empties are retained; deletion is an explicit
//! operation owned by the external directory's lifecycle policy.

use crate::actors::messages::{
    ConnectionHandle, RegistryMessage, RegistryStatus, StageCreation,
};
use crate::actors::stage::{StageActor, StageActorHandle, StageSpec};
use crate::auth::Identity;
use crate::engine::MediaEngine;
use crate::errors::StageError;
use crate::observability::metrics::RegistryMetrics;

use stage_protocol::types::{CommunicationMode, StageId, StageKind};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 500;

/// Handle to the `RegistryActor`.
#[derive(Clone, Debug)]
pub struct RegistryActorHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl RegistryActorHandle {
    async fn send(&self, message: RegistryMessage) -> Result<(), StageError> {
        self.sender
            .send(message)
            .await
            .map_err(|e| StageError::Internal(format!("registry channel send failed: {e}")))
    }

    /// Create a stage; the requester becomes its director.
    pub async fn create_stage(
        &self,
        identity: Identity,
        connection_id: String,
        stage_name: String,
        kind: StageKind,
        mode: CommunicationMode,
        password: Option<String>,
        outbound: ConnectionHandle,
    ) -> Result<StageCreation, StageError> {
        let (tx, rx) = oneshot::channel();
        self.send(RegistryMessage::CreateStage {
            identity,
            connection_id,
            stage_name,
            kind,
            mode,
            password,
            outbound,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|e| StageError::Internal(format!("registry response failed: {e}")))?
    }

    /// Resolve a stage actor handle.
    pub async fn get_stage(&self, stage_id: StageId) -> Result<StageActorHandle, StageError> {
        let (tx, rx) = oneshot::channel();
        self.send(RegistryMessage::GetStage {
            stage_id,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|e| StageError::Internal(format!("registry response failed: {e}")))?
    }

    /// Delete a stage and cancel its actor.
    pub async fn delete_stage(&self, stage_id: StageId) -> Result<(), StageError> {
        let (tx, rx) = oneshot::channel();
        self.send(RegistryMessage::DeleteStage {
            stage_id,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|e| StageError::Internal(format!("registry response failed: {e}")))?
    }

    /// Current registry status.
    pub async fn status(&self) -> Result<RegistryStatus, StageError> {
        let (tx, rx) = oneshot::channel();
        self.send(RegistryMessage::GetStatus { respond_to: tx })
            .await?;
        rx.await
            .map_err(|e| StageError::Internal(format!("registry response failed: {e}")))
    }

    /// Initiate graceful shutdown.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), StageError> {
        let (tx, rx) = oneshot::channel();
        self.send(RegistryMessage::Shutdown {
            deadline,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|e| StageError::Internal(format!("registry response failed: {e}")))?
    }

    /// Cancel the registry actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Get a child token tied to the registry's lifetime.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// A supervised stage.
struct StageEntry {
    handle: StageActorHandle,
    task_handle: JoinHandle<()>,
}

/// The `RegistryActor` implementation.
pub struct RegistryActor {
    stages: HashMap<StageId, StageEntry>,
    engine: Arc<dyn MediaEngine>,
    metrics: Arc<RegistryMetrics>,
    max_participants_per_stage: usize,
    receiver: mpsc::Receiver<RegistryMessage>,
    cancel_token: CancellationToken,
    is_draining: bool,
}

impl RegistryActor {
    /// Spawn the registry actor.
    pub fn spawn(
        engine: Arc<dyn MediaEngine>,
        metrics: Arc<RegistryMetrics>,
        max_participants_per_stage: usize,
        cancel_token: CancellationToken,
    ) -> (RegistryActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);

        let actor = Self {
            stages: HashMap::new(),
            engine,
            metrics,
            max_participants_per_stage,
            receiver,
            cancel_token: cancel_token.clone(),
            is_draining: false,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RegistryActorHandle {
            sender,
            cancel_token,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "stage.actor.registry")]
    async fn run(mut self) {
        info!(target: "stage.actor.registry", "RegistryActor started");

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "stage.actor.registry",
                        "RegistryActor received cancellation signal"
                    );
                    self.shutdown_stages(Duration::from_secs(5)).await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            if self.handle_message(message).await {
                                break;
                            }
                        }
                        None => {
                            info!(
                                target: "stage.actor.registry",
                                "RegistryActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "stage.actor.registry",
            stages = self.stages.len(),
            "RegistryActor stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: RegistryMessage) -> bool {
        match message {
            RegistryMessage::CreateStage {
                identity,
                connection_id,
                stage_name,
                kind,
                mode,
                password,
                outbound,
                respond_to,
            } => {
                let result = self.handle_create_stage(
                    identity,
                    connection_id,
                    stage_name,
                    kind,
                    mode,
                    password,
                    outbound,
                );
                let _ = respond_to.send(result);
                false
            }

            RegistryMessage::GetStage {
                stage_id,
                respond_to,
            } => {
                let result = self
                    .stages
                    .get(&stage_id)
                    .map(|entry| entry.handle.clone())
                    .ok_or(StageError::StageNotFound(stage_id));
                let _ = respond_to.send(result);
                false
            }

            RegistryMessage::DeleteStage {
                stage_id,
                respond_to,
            } => {
                let result = self.handle_delete_stage(&stage_id).await;
                let _ = respond_to.send(result);
                false
            }

            RegistryMessage::GetStatus { respond_to } => {
                let snapshot = self.metrics.snapshot();
                let _ = respond_to.send(RegistryStatus {
                    stage_count: self.stages.len(),
                    participant_count: snapshot.participants,
                    is_draining: self.is_draining,
                });
                false
            }

            RegistryMessage::Shutdown {
                deadline,
                respond_to,
            } => {
                info!(target: "stage.actor.registry", "Shutdown requested");
                self.is_draining = true;
                self.shutdown_stages(deadline).await;
                let _ = respond_to.send(Ok(()));
                true
            }
        }
    }

    #[allow(clippy::too_many_arguments)] // mirrors the create-stage payload
    fn handle_create_stage(
        &mut self,
        identity: Identity,
        connection_id: String,
        stage_name: String,
        kind: StageKind,
        mode: CommunicationMode,
        password: Option<String>,
        outbound: ConnectionHandle,
    ) -> Result<StageCreation, StageError> {
        if self.is_draining {
            return Err(StageError::Conflict(
                "Server is shutting down".to_string(),
            ));
        }

        let stage_id = Uuid::new_v4().to_string();
        let spec = StageSpec {
            stage_id: stage_id.clone(),
            name: stage_name,
            kind,
            mode,
            password,
            max_participants: self.max_participants_per_stage,
        };

        let (handle, task_handle, participant_id) = StageActor::spawn(
            spec,
            identity,
            connection_id,
            outbound,
            Arc::clone(&self.engine),
            Arc::clone(&self.metrics),
            self.cancel_token.child_token(),
        );

        self.stages.insert(
            stage_id.clone(),
            StageEntry {
                handle: handle.clone(),
                task_handle,
            },
        );
        self.metrics.stage_created();

        info!(
            target: "stage.actor.registry",
            stage_id = %stage_id,
            kind = ?kind,
            mode = ?mode,
            total_stages = self.stages.len(),
            "Stage created"
        );

        Ok(StageCreation {
            stage_id,
            participant_id,
            handle,
        })
    }

    async fn handle_delete_stage(&mut self, stage_id: &str) -> Result<(), StageError> {
        let entry = self
            .stages
            .remove(stage_id)
            .ok_or_else(|| StageError::StageNotFound(stage_id.to_string()))?;

        entry.handle.cancel();
        if tokio::time::timeout(Duration::from_secs(1), entry.task_handle)
            .await
            .is_err()
        {
            warn!(
                target: "stage.actor.registry",
                stage_id = %stage_id,
                "Stage actor did not stop within deadline"
            );
        }
        self.metrics.stage_deleted();

        info!(
            target: "stage.actor.registry",
            stage_id = %stage_id,
            "Stage deleted"
        );
        Ok(())
    }

    /// Cancel every stage actor and wait for them within the deadline.
    async fn shutdown_stages(&mut self, deadline: Duration) {
        debug!(
            target: "stage.actor.registry",
            stages = self.stages.len(),
            "Shutting down stage actors"
        );

        for entry in self.stages.values() {
            entry.handle.cancel();
        }

        let tasks: Vec<JoinHandle<()>> = self
            .stages
            .drain()
            .map(|(_, entry)| {
                self.metrics.stage_deleted();
                entry.task_handle
            })
            .collect();

        let wait_all = async {
            for task in tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(deadline, wait_all).await.is_err() {
            warn!(
                target: "stage.actor.registry",
                "Stage actors did not stop within shutdown deadline"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::default_media_codecs;
    use crate::engine::{
        RtcEngine, RtcEngineSettings, DEFAULT_INITIAL_AVAILABLE_OUTGOING_BITRATE,
        DEFAULT_MAX_INCOMING_BITRATE,
    };
    use stage_protocol::envelope::ServerEnvelope;

    fn test_engine() -> Arc<dyn MediaEngine> {
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

    fn spawn_registry() -> RegistryActorHandle {
        let (handle, _task) = RegistryActor::spawn(
            test_engine(),
            RegistryMetrics::new(),
            16,
            CancellationToken::new(),
        );
        handle
    }

    fn outbound(connection_id: &str) -> (ConnectionHandle, mpsc::Receiver<ServerEnvelope>) {
        let (tx, rx) = mpsc::channel(64);
        (ConnectionHandle::new(connection_id.to_string(), tx), rx)
    }

    fn identity(id: &str) -> Identity {
        Identity {
            identity_id: id.to_string(),
            display_name: format!("User {id}"),
        }
    }

    #[tokio::test]
    async fn test_create_stage_assigns_fresh_ids() {
        let registry = spawn_registry();
        let (out_a, _rx_a) = outbound("conn-a");
        let (out_b, _rx_b) = outbound("conn-b");

        let first = registry
            .create_stage(
                identity("id-a"),
                "conn-a".to_string(),
                "stage one".to_string(),
                StageKind::Theater,
                CommunicationMode::Sfu,
                None,
                out_a,
            )
            .await
            .expect("create should succeed");

        let second = registry
            .create_stage(
                identity("id-b"),
                "conn-b".to_string(),
                "stage two".to_string(),
                StageKind::Music,
                CommunicationMode::Mesh,
                None,
                out_b,
            )
            .await
            .expect("create should succeed");

        assert_ne!(first.stage_id, second.stage_id);

        let status = registry.status().await.expect("status");
        assert_eq!(status.stage_count, 2);
        assert_eq!(status.participant_count, 2);
    }

    #[tokio::test]
    async fn test_get_stage_unknown_id_is_not_found() {
        let registry = spawn_registry();
        let result = registry.get_stage("no-such-stage".to_string()).await;
        assert!(matches!(result, Err(StageError::StageNotFound(_))));
    }

    #[tokio::test]
    async fn test_empty_stage_is_retained() {
        let registry = spawn_registry();
        let (out_a, _rx_a) = outbound("conn-a");

        let created = registry
            .create_stage(
                identity("id-a"),
                "conn-a".to_string(),
                "stage".to_string(),
                StageKind::Conference,
                CommunicationMode::Sfu,
                None,
                out_a,
            )
            .await
            .expect("create should succeed");

        // The sole participant disconnects; the stage stays registered.
        created
            .handle
            .connection_closed(created.participant_id.clone(), "conn-a".to_string())
            .await
            .expect("connection closed");

        let handle = registry
            .get_stage(created.stage_id.clone())
            .await
            .expect("stage should still exist");
        let snapshot = handle.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.participants.len(), 0);
    }

    #[tokio::test]
    async fn test_delete_stage_cancels_actor() {
        let registry = spawn_registry();
        let (out_a, _rx_a) = outbound("conn-a");

        let created = registry
            .create_stage(
                identity("id-a"),
                "conn-a".to_string(),
                "stage".to_string(),
                StageKind::Theater,
                CommunicationMode::Sfu,
                None,
                out_a,
            )
            .await
            .expect("create should succeed");

        registry
            .delete_stage(created.stage_id.clone())
            .await
            .expect("delete should succeed");

        assert!(created.handle.is_cancelled());
        let result = registry.get_stage(created.stage_id).await;
        assert!(matches!(result, Err(StageError::StageNotFound(_))));
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_stages() {
        let registry = spawn_registry();
        registry
            .shutdown(Duration::from_secs(1))
            .await
            .expect("shutdown should succeed");

        // The registry actor exits after shutdown; creating is an error
        // either way (draining or channel closed).
        let (out, _rx) = outbound("conn-a");
        let result = registry
            .create_stage(
                identity("id-a"),
                "conn-a".to_string(),
                "late stage".to_string(),
                StageKind::Theater,
                CommunicationMode::Sfu,
                None,
                out,
            )
            .await;
        assert!(result.is_err());
    }
}
