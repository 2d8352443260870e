//! In-process server harness.
//!
//! Spins up a real registry actor backed by the mock engine and identity
//! verifier, and connects real client channels to real server connection
//! tasks over `tokio::io::duplex`: complete WebSocket handshakes, no
//! sockets.

use crate::mock_engine::MockMediaEngine;
use crate::mock_identity::MockIdentityVerifier;

use stage_client::{Channel, ChannelConfig};
use stage_server::actors::registry::{RegistryActor, RegistryActorHandle};
use stage_server::connection::{serve_connection, ConnectionDeps};
use stage_server::engine::MediaEngine;
use stage_server::observability::RegistryMetrics;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Identity token the mock verifier accepts for `identity_id`.
#[must_use]
pub fn identity_token(identity_id: &str) -> String {
    format!("valid-{identity_id}")
}

/// An in-process stage server for tests.
pub struct TestServer {
    pub registry: RegistryActorHandle,
    pub engine: Arc<MockMediaEngine>,
    pub metrics: Arc<RegistryMetrics>,
    cancel: CancellationToken,
}

impl TestServer {
    /// Spawn a registry with the mock engine and default limits.
    #[must_use]
    pub fn spawn() -> Self {
        let engine = MockMediaEngine::new();
        let metrics = RegistryMetrics::new();
        let cancel = CancellationToken::new();
        let (registry, _task) = RegistryActor::spawn(
            Arc::clone(&engine) as Arc<dyn MediaEngine>,
            Arc::clone(&metrics),
            16,
            cancel.child_token(),
        );

        Self {
            registry,
            engine,
            metrics,
            cancel,
        }
    }

    fn deps(&self) -> ConnectionDeps {
        ConnectionDeps {
            registry: self.registry.clone(),
            verifier: Arc::new(MockIdentityVerifier::new()),
            metrics: Arc::clone(&self.metrics),
        }
    }

    /// Connect a client channel through a fresh duplex WebSocket pair.
    ///
    /// # Panics
    ///
    /// Panics if either side of the handshake fails.
    #[allow(clippy::panic)]
    pub async fn connect_channel(&self, config: ChannelConfig) -> Channel {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        let deps = self.deps();
        let conn_token = self.cancel.child_token();
        tokio::spawn(async move {
            match tokio_tungstenite::accept_async(server_io).await {
                Ok(ws) => serve_connection(ws, deps, conn_token).await,
                Err(e) => panic!("server-side handshake failed: {e}"),
            }
        });

        let (ws, _response) =
            tokio_tungstenite::client_async("ws://stagelink.test/signal", client_io)
                .await
                .expect("client-side handshake failed");

        Channel::from_stream(ws, config)
    }

    /// Shut the harness down, cancelling every connection and stage.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
