//! Media stack boundary.
//!
//! The client's actual media path (capture, encode, DTLS/ICE, playout) lives
//! in the platform's native RTC stack. These traits are the seam the
//! orchestrator drives; implementations wrap the real stack, tests use the
//! fakes from `stage-test-utils`.

use crate::errors::MediaError;

use async_trait::async_trait;
use stage_protocol::types::{
    ConsumerCreated, DtlsParameters, MediaKind, RtpCapabilities, RtpParameters, TransportOptions,
};
use std::sync::Arc;
use tokio::sync::watch;

/// A local capture track about to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub track_id: String,
    pub kind: MediaKind,
}

impl LocalTrack {
    #[must_use]
    pub fn new(track_id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            track_id: track_id.into(),
            kind,
        }
    }
}

/// A remote track handle delivered to the UI layer for playout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub track_id: String,
    pub kind: MediaKind,
}

/// Connection state reported by a local transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportConnectionState {
    /// Whether this state terminates the media session.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransportConnectionState::Disconnected
                | TransportConnectionState::Failed
                | TransportConnectionState::Closed
        )
    }
}

/// The local media stack (device) the orchestrator drives.
#[async_trait]
pub trait MediaStack: Send + Sync {
    /// Load the engine's router capabilities into the device. Must be
    /// called before any transport is created; failure is fatal to the
    /// media session.
    async fn load(&self, router_capabilities: RtpCapabilities) -> Result<(), MediaError>;

    /// The device's own capability set (valid after `load`).
    async fn rtp_capabilities(&self) -> Result<RtpCapabilities, MediaError>;

    /// Instantiate the local send transport from server parameters.
    async fn create_send_transport(
        &self,
        options: TransportOptions,
    ) -> Result<Arc<dyn SendTransport>, MediaError>;

    /// Instantiate the local receive transport from server parameters.
    async fn create_receive_transport(
        &self,
        options: TransportOptions,
    ) -> Result<Arc<dyn RecvTransport>, MediaError>;
}

/// Local send-direction transport.
#[async_trait]
pub trait SendTransport: Send + Sync {
    fn transport_id(&self) -> &str;

    /// Drive local negotiation until the transport emits its DTLS
    /// parameters. Fires exactly once per transport; the caller forwards
    /// the parameters as a connect request before any produce call.
    async fn negotiate(&self) -> Result<DtlsParameters, MediaError>;

    /// Attach a local track, yielding the RTP parameters to register
    /// server-side.
    async fn produce(&self, track: &LocalTrack) -> Result<RtpParameters, MediaError>;

    /// Watch the transport's connection state.
    fn connection_state(&self) -> watch::Receiver<TransportConnectionState>;

    async fn close(&self);
}

/// Local receive-direction transport.
#[async_trait]
pub trait RecvTransport: Send + Sync {
    fn transport_id(&self) -> &str;

    /// See [`SendTransport::negotiate`].
    async fn negotiate(&self) -> Result<DtlsParameters, MediaError>;

    /// Build the local consumer from server parameters. The consumer is
    /// created paused; the caller resumes it only after the server
    /// acknowledged `finish-consume`.
    async fn consume(&self, created: &ConsumerCreated) -> Result<Arc<dyn LocalConsumer>, MediaError>;

    /// Watch the transport's connection state.
    fn connection_state(&self) -> watch::Receiver<TransportConnectionState>;

    async fn close(&self);
}

/// A local consumer of one remote producer.
#[async_trait]
pub trait LocalConsumer: Send + Sync {
    fn consumer_id(&self) -> &str;

    /// Start media flow. Only valid after the finish-consume ack.
    async fn resume(&self) -> Result<(), MediaError>;

    /// The playable track handle for the UI layer.
    fn track(&self) -> RemoteTrack;

    async fn close(&self);
}
