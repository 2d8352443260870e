//! Mock media engine: a real resource manager plus failure injection and
//! call recording.

use async_trait::async_trait;
use stage_protocol::types::{
    ConsumerCreated, DtlsParameters, MediaKind, RtpCapabilities, RtpParameters, TransportOptions,
};
use stage_server::config::default_media_codecs;
use stage_server::engine::{
    EngineError, MediaEngine, RtcEngine, RtcEngineSettings,
    DEFAULT_INITIAL_AVAILABLE_OUTGOING_BITRATE, DEFAULT_MAX_INCOMING_BITRATE,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Wraps [`RtcEngine`] with scripted failures and a call log.
pub struct MockMediaEngine {
    inner: RtcEngine,
    fail_ops: Mutex<HashSet<&'static str>>,
    calls: Mutex<Vec<String>>,
}

impl MockMediaEngine {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RtcEngine::new(RtcEngineSettings {
                listen_ip: "127.0.0.1".to_string(),
                announced_ip: None,
                rtc_min_port: 40000,
                rtc_max_port: 40099,
                media_codecs: default_media_codecs(),
                initial_available_outgoing_bitrate: DEFAULT_INITIAL_AVAILABLE_OUTGOING_BITRATE,
                max_incoming_bitrate: DEFAULT_MAX_INCOMING_BITRATE,
            }),
            fail_ops: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Make every future call of `op` fail (e.g. `"produce"`, `"consume"`,
    /// `"router_capabilities"`).
    pub fn fail_on(&self, op: &'static str) {
        self.fail_ops.lock().unwrap().insert(op);
    }

    /// Stop failing `op`.
    pub fn recover(&self, op: &'static str) {
        self.fail_ops.lock().unwrap().remove(op);
    }

    /// Ordered list of engine calls seen so far.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of transports still alive in the engine.
    #[must_use]
    pub fn live_transport_count(&self) -> usize {
        self.inner.live_transport_count()
    }

    /// Whether a transport is still alive.
    #[must_use]
    pub fn transport_exists(&self, transport_id: &str) -> bool {
        self.inner.transport_exists(transport_id)
    }

    /// Whether a producer is still alive.
    #[must_use]
    pub fn producer_exists(&self, producer_id: &str) -> bool {
        self.inner.producer_exists(producer_id)
    }

    /// Paused state of a consumer, if it exists.
    #[must_use]
    pub fn consumer_paused(&self, consumer_id: &str) -> Option<bool> {
        self.inner.consumer_paused(consumer_id)
    }

    fn record(&self, op: &'static str, detail: &str) -> Result<(), EngineError> {
        self.calls.lock().unwrap().push(format!("{op}:{detail}"));
        if self.fail_ops.lock().unwrap().contains(op) {
            return Err(EngineError::Failed(format!("injected {op} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaEngine for MockMediaEngine {
    async fn router_capabilities(&self, stage_id: &str) -> Result<RtpCapabilities, EngineError> {
        self.record("router_capabilities", stage_id)?;
        self.inner.router_capabilities(stage_id).await
    }

    async fn create_transport(&self, stage_id: &str) -> Result<TransportOptions, EngineError> {
        self.record("create_transport", stage_id)?;
        self.inner.create_transport(stage_id).await
    }

    async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), EngineError> {
        self.record("connect_transport", transport_id)?;
        self.inner.connect_transport(transport_id, dtls_parameters).await
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<String, EngineError> {
        self.record("produce", transport_id)?;
        self.inner.produce(transport_id, kind, rtp_parameters).await
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerCreated, EngineError> {
        self.record("consume", producer_id)?;
        self.inner
            .consume(transport_id, producer_id, rtp_capabilities)
            .await
    }

    async fn resume_consumer(&self, consumer_id: &str) -> Result<(), EngineError> {
        self.record("resume_consumer", consumer_id)?;
        self.inner.resume_consumer(consumer_id).await
    }

    async fn close_producer(&self, producer_id: &str) -> Result<(), EngineError> {
        self.record("close_producer", producer_id)?;
        self.inner.close_producer(producer_id).await
    }

    async fn close_consumer(&self, consumer_id: &str) -> Result<(), EngineError> {
        self.record("close_consumer", consumer_id)?;
        self.inner.close_consumer(consumer_id).await
    }

    async fn close_transport(&self, transport_id: &str) -> Result<(), EngineError> {
        self.record("close_transport", transport_id)?;
        self.inner.close_transport(transport_id).await
    }
}
