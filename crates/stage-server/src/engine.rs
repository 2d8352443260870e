//! Media engine boundary.
//!
//! The packet-forwarding plane (RTP routing, congestion control, jitter
//! buffering) is an external concern. This module defines the control
//! surface the orchestration layer drives, plus `RtcEngine`: the in-process
//! resource manager that allocates transport parameters and tracks
//! producer/consumer state on the engine's behalf.
//!
//! Every close operation is idempotent: closing an already-closed resource
//! is a no-op, not an error.

use crate::config::Config;
use crate::errors::StageError;

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use stage_protocol::types::{
    CodecCapability, ConsumerCreated, DtlsParameters, IceCandidate, IceParameters, MediaKind,
    RtpCapabilities, RtpParameters, TransportOptions,
};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Default initial available outgoing bitrate (bps).
pub const DEFAULT_INITIAL_AVAILABLE_OUTGOING_BITRATE: u32 = 1_000_000;

/// Default cap on incoming bitrate per transport (bps).
pub const DEFAULT_MAX_INCOMING_BITRATE: u32 = 1_500_000;

/// Media engine failure.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine rejected or failed the call.
    #[error("engine call failed: {0}")]
    Failed(String),

    /// The referenced transport does not exist.
    #[error("unknown transport: {0}")]
    UnknownTransport(String),

    /// The referenced producer does not exist.
    #[error("unknown producer: {0}")]
    UnknownProducer(String),

    /// The referenced consumer does not exist.
    #[error("unknown consumer: {0}")]
    UnknownConsumer(String),

    /// The transport has not completed its connect handshake.
    #[error("transport not connected: {0}")]
    NotConnected(String),
}

impl From<EngineError> for StageError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::UnknownTransport(id) => StageError::TransportNotFound(id),
            EngineError::UnknownProducer(id) => StageError::ProducerNotFound(id),
            EngineError::UnknownConsumer(id) => StageError::ConsumerNotFound(id),
            EngineError::Failed(msg) => StageError::Engine(msg),
            EngineError::NotConnected(id) => {
                StageError::Engine(format!("transport not connected: {id}"))
            }
        }
    }
}

/// Control surface of the external media engine.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Capability set of the stage's router.
    async fn router_capabilities(&self, stage_id: &str) -> Result<RtpCapabilities, EngineError>;

    /// Allocate a transport and return its connection parameters.
    async fn create_transport(&self, stage_id: &str) -> Result<TransportOptions, EngineError>;

    /// Complete the transport's connect handshake with the client's DTLS
    /// parameters. Valid exactly once per transport.
    async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), EngineError>;

    /// Register a produced track on a connected transport.
    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<String, EngineError>;

    /// Create a paused consumer of `producer_id` on a connected transport.
    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerCreated, EngineError>;

    /// Resume a paused consumer; media flows after this returns.
    async fn resume_consumer(&self, consumer_id: &str) -> Result<(), EngineError>;

    /// Close a producer. Idempotent.
    async fn close_producer(&self, producer_id: &str) -> Result<(), EngineError>;

    /// Close a consumer. Idempotent.
    async fn close_consumer(&self, consumer_id: &str) -> Result<(), EngineError>;

    /// Close a transport and everything it owns. Idempotent.
    async fn close_transport(&self, transport_id: &str) -> Result<(), EngineError>;
}

/// Engine settings derived from server configuration.
#[derive(Debug, Clone)]
pub struct RtcEngineSettings {
    pub listen_ip: String,
    pub announced_ip: Option<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub media_codecs: Vec<CodecCapability>,
    pub initial_available_outgoing_bitrate: u32,
    pub max_incoming_bitrate: u32,
}

impl RtcEngineSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            listen_ip: config.rtc_listen_ip.clone(),
            announced_ip: config.rtc_announced_ip.clone(),
            rtc_min_port: config.rtc_min_port,
            rtc_max_port: config.rtc_max_port,
            media_codecs: config.media_codecs.clone(),
            initial_available_outgoing_bitrate: DEFAULT_INITIAL_AVAILABLE_OUTGOING_BITRATE,
            max_incoming_bitrate: DEFAULT_MAX_INCOMING_BITRATE,
        }
    }
}

#[derive(Debug)]
struct TransportState {
    stage_id: String,
    connected: bool,
}

#[derive(Debug)]
struct ProducerState {
    transport_id: String,
    #[allow(dead_code)]
    kind: MediaKind,
}

#[derive(Debug)]
struct ConsumerState {
    transport_id: String,
    #[allow(dead_code)]
    producer_id: String,
    paused: bool,
}

#[derive(Debug, Default)]
struct EngineState {
    transports: HashMap<String, TransportState>,
    producers: HashMap<String, ProducerState>,
    consumers: HashMap<String, ConsumerState>,
    next_port_offset: u16,
}

/// In-process engine resource manager.
///
/// Allocates ICE/DTLS connection parameters from the configured address and
/// port range and tracks resource lifecycles; the forwarding plane itself is
/// outside this layer.
pub struct RtcEngine {
    settings: RtcEngineSettings,
    state: Mutex<EngineState>,
}

impl RtcEngine {
    #[must_use]
    pub fn new(settings: RtcEngineSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(EngineState::default()),
        }
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, EngineState>, EngineError> {
        self.state
            .lock()
            .map_err(|_| EngineError::Failed("engine state lock poisoned".to_string()))
    }

    fn allocate_port(&self, state: &mut EngineState) -> u16 {
        let range =
            u32::from(self.settings.rtc_max_port) - u32::from(self.settings.rtc_min_port) + 1;
        let offset = u32::from(state.next_port_offset) % range;
        #[allow(clippy::cast_possible_truncation)] // offset < range <= u16::MAX + 1
        let port = self.settings.rtc_min_port + offset as u16;
        state.next_port_offset = state.next_port_offset.wrapping_add(1);
        port
    }

    fn candidate_ip(&self) -> &str {
        self.settings
            .announced_ip
            .as_deref()
            .unwrap_or(&self.settings.listen_ip)
    }

    /// Number of live transports (test/status introspection).
    #[must_use]
    pub fn live_transport_count(&self) -> usize {
        self.lock_state().map(|s| s.transports.len()).unwrap_or(0)
    }

    /// Whether a transport is still alive.
    #[must_use]
    pub fn transport_exists(&self, transport_id: &str) -> bool {
        self.lock_state()
            .map(|s| s.transports.contains_key(transport_id))
            .unwrap_or(false)
    }

    /// Whether a producer is still alive.
    #[must_use]
    pub fn producer_exists(&self, producer_id: &str) -> bool {
        self.lock_state()
            .map(|s| s.producers.contains_key(producer_id))
            .unwrap_or(false)
    }

    /// Paused state of a consumer, if it exists.
    #[must_use]
    pub fn consumer_paused(&self, consumer_id: &str) -> Option<bool> {
        self.lock_state()
            .ok()
            .and_then(|s| s.consumers.get(consumer_id).map(|c| c.paused))
    }
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn random_fingerprint() -> String {
    let bytes: Vec<String> = (0..32)
        .map(|_| format!("{:02X}", rand::thread_rng().gen::<u8>()))
        .collect();
    bytes.join(":")
}

#[async_trait]
impl MediaEngine for RtcEngine {
    async fn router_capabilities(&self, stage_id: &str) -> Result<RtpCapabilities, EngineError> {
        debug!(target: "stage.engine", stage_id = %stage_id, "Router capabilities requested");
        Ok(RtpCapabilities {
            codecs: self.settings.media_codecs.clone(),
            header_extensions: serde_json::Value::Null,
        })
    }

    async fn create_transport(&self, stage_id: &str) -> Result<TransportOptions, EngineError> {
        let mut state = self.lock_state()?;
        let transport_id = Uuid::new_v4().to_string();
        let port = self.allocate_port(&mut state);

        state.transports.insert(
            transport_id.clone(),
            TransportState {
                stage_id: stage_id.to_string(),
                connected: false,
            },
        );

        debug!(
            target: "stage.engine",
            stage_id = %stage_id,
            transport_id = %transport_id,
            port = port,
            "Transport allocated"
        );

        Ok(TransportOptions {
            transport_id,
            ice_parameters: IceParameters(serde_json::json!({
                "usernameFragment": random_string(8),
                "password": random_string(22),
                "iceLite": true,
            })),
            ice_candidates: vec![IceCandidate(serde_json::json!({
                "foundation": "udpcandidate",
                "priority": 1_076_302_079u32,
                "ip": self.candidate_ip(),
                "port": port,
                "protocol": "udp",
                "type": "host",
            }))],
            dtls_parameters: DtlsParameters(serde_json::json!({
                "role": "auto",
                "fingerprints": [{
                    "algorithm": "sha-256",
                    "value": random_fingerprint(),
                }],
            })),
        })
    }

    async fn connect_transport(
        &self,
        transport_id: &str,
        _dtls_parameters: &DtlsParameters,
    ) -> Result<(), EngineError> {
        let mut state = self.lock_state()?;
        let transport = state
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| EngineError::UnknownTransport(transport_id.to_string()))?;

        if transport.connected {
            return Err(EngineError::Failed(format!(
                "transport already connected: {transport_id}"
            )));
        }
        transport.connected = true;
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        _rtp_parameters: &RtpParameters,
    ) -> Result<String, EngineError> {
        let mut state = self.lock_state()?;
        let transport = state
            .transports
            .get(transport_id)
            .ok_or_else(|| EngineError::UnknownTransport(transport_id.to_string()))?;
        if !transport.connected {
            return Err(EngineError::NotConnected(transport_id.to_string()));
        }

        let producer_id = Uuid::new_v4().to_string();
        state.producers.insert(
            producer_id.clone(),
            ProducerState {
                transport_id: transport_id.to_string(),
                kind,
            },
        );
        Ok(producer_id)
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerCreated, EngineError> {
        let mut state = self.lock_state()?;
        let transport = state
            .transports
            .get(transport_id)
            .ok_or_else(|| EngineError::UnknownTransport(transport_id.to_string()))?;
        if !transport.connected {
            return Err(EngineError::NotConnected(transport_id.to_string()));
        }
        if rtp_capabilities.codecs.is_empty() {
            return Err(EngineError::Failed(
                "consumer capabilities share no codec with the router".to_string(),
            ));
        }

        let kind = state
            .producers
            .get(producer_id)
            .map(|p| p.kind)
            .ok_or_else(|| EngineError::UnknownProducer(producer_id.to_string()))?;

        let consumer_id = Uuid::new_v4().to_string();
        state.consumers.insert(
            consumer_id.clone(),
            ConsumerState {
                transport_id: transport_id.to_string(),
                producer_id: producer_id.to_string(),
                paused: true,
            },
        );

        Ok(ConsumerCreated {
            consumer_id,
            producer_id: producer_id.to_string(),
            kind,
            rtp_parameters: RtpParameters(serde_json::json!({
                "mid": null,
                "codecs": [],
                "encodings": [{ "ssrc": rand::thread_rng().gen::<u32>() }],
            })),
            paused: true,
        })
    }

    async fn resume_consumer(&self, consumer_id: &str) -> Result<(), EngineError> {
        let mut state = self.lock_state()?;
        let consumer = state
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| EngineError::UnknownConsumer(consumer_id.to_string()))?;
        consumer.paused = false;
        Ok(())
    }

    async fn close_producer(&self, producer_id: &str) -> Result<(), EngineError> {
        let mut state = self.lock_state()?;
        state.producers.remove(producer_id);
        Ok(())
    }

    async fn close_consumer(&self, consumer_id: &str) -> Result<(), EngineError> {
        let mut state = self.lock_state()?;
        state.consumers.remove(consumer_id);
        Ok(())
    }

    async fn close_transport(&self, transport_id: &str) -> Result<(), EngineError> {
        let mut state = self.lock_state()?;
        if state.transports.remove(transport_id).is_none() {
            return Ok(());
        }
        state.producers.retain(|_, p| p.transport_id != transport_id);
        state.consumers.retain(|_, c| c.transport_id != transport_id);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::config::default_media_codecs;

    fn test_settings() -> RtcEngineSettings {
        RtcEngineSettings {
            listen_ip: "127.0.0.1".to_string(),
            announced_ip: None,
            rtc_min_port: 40000,
            rtc_max_port: 40004,
            media_codecs: default_media_codecs(),
            initial_available_outgoing_bitrate: DEFAULT_INITIAL_AVAILABLE_OUTGOING_BITRATE,
            max_incoming_bitrate: DEFAULT_MAX_INCOMING_BITRATE,
        }
    }

    fn caps() -> RtpCapabilities {
        RtpCapabilities {
            codecs: default_media_codecs(),
            header_extensions: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_router_capabilities_reflect_configured_codecs() {
        let engine = RtcEngine::new(test_settings());
        let caps = engine.router_capabilities("stage-1").await.unwrap();
        assert_eq!(caps.codecs.len(), 2);
        assert_eq!(caps.codecs[0].mime_type, "audio/opus");
    }

    #[tokio::test]
    async fn test_transport_ports_stay_in_range() {
        let engine = RtcEngine::new(test_settings());
        for _ in 0..12 {
            let options = engine.create_transport("stage-1").await.unwrap();
            let port = options.ice_candidates[0].0["port"].as_u64().unwrap();
            assert!((40000..=40004).contains(&port));
        }
    }

    #[tokio::test]
    async fn test_produce_requires_connected_transport() {
        let engine = RtcEngine::new(test_settings());
        let options = engine.create_transport("stage-1").await.unwrap();

        let result = engine
            .produce(
                &options.transport_id,
                MediaKind::Audio,
                &RtpParameters::default(),
            )
            .await;
        assert!(matches!(result, Err(EngineError::NotConnected(_))));

        engine
            .connect_transport(&options.transport_id, &DtlsParameters::default())
            .await
            .unwrap();

        let producer_id = engine
            .produce(
                &options.transport_id,
                MediaKind::Audio,
                &RtpParameters::default(),
            )
            .await
            .unwrap();
        assert!(engine.producer_exists(&producer_id));
    }

    #[tokio::test]
    async fn test_double_connect_is_rejected() {
        let engine = RtcEngine::new(test_settings());
        let options = engine.create_transport("stage-1").await.unwrap();
        engine
            .connect_transport(&options.transport_id, &DtlsParameters::default())
            .await
            .unwrap();

        let result = engine
            .connect_transport(&options.transport_id, &DtlsParameters::default())
            .await;
        assert!(matches!(result, Err(EngineError::Failed(_))));
    }

    #[tokio::test]
    async fn test_consumer_created_paused_and_resumed() {
        let engine = RtcEngine::new(test_settings());
        let send = engine.create_transport("stage-1").await.unwrap();
        let recv = engine.create_transport("stage-1").await.unwrap();
        engine
            .connect_transport(&send.transport_id, &DtlsParameters::default())
            .await
            .unwrap();
        engine
            .connect_transport(&recv.transport_id, &DtlsParameters::default())
            .await
            .unwrap();

        let producer_id = engine
            .produce(&send.transport_id, MediaKind::Audio, &RtpParameters::default())
            .await
            .unwrap();

        let created = engine
            .consume(&recv.transport_id, &producer_id, &caps())
            .await
            .unwrap();
        assert!(created.paused);
        assert_eq!(engine.consumer_paused(&created.consumer_id), Some(true));

        engine.resume_consumer(&created.consumer_id).await.unwrap();
        assert_eq!(engine.consumer_paused(&created.consumer_id), Some(false));
    }

    #[tokio::test]
    async fn test_consume_unknown_producer_fails() {
        let engine = RtcEngine::new(test_settings());
        let recv = engine.create_transport("stage-1").await.unwrap();
        engine
            .connect_transport(&recv.transport_id, &DtlsParameters::default())
            .await
            .unwrap();

        let result = engine.consume(&recv.transport_id, "no-such", &caps()).await;
        assert!(matches!(result, Err(EngineError::UnknownProducer(_))));
    }

    #[tokio::test]
    async fn test_close_transport_cascades_and_is_idempotent() {
        let engine = RtcEngine::new(test_settings());
        let send = engine.create_transport("stage-1").await.unwrap();
        engine
            .connect_transport(&send.transport_id, &DtlsParameters::default())
            .await
            .unwrap();
        let producer_id = engine
            .produce(&send.transport_id, MediaKind::Video, &RtpParameters::default())
            .await
            .unwrap();

        engine.close_transport(&send.transport_id).await.unwrap();
        assert!(!engine.transport_exists(&send.transport_id));
        assert!(!engine.producer_exists(&producer_id));

        // Closing twice is a no-op, not an error.
        engine.close_transport(&send.transport_id).await.unwrap();
        engine.close_producer(&producer_id).await.unwrap();
    }
}
