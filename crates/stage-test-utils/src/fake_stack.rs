//! Fake client media stack.
//!
//! Implements the `stage-client` media boundary with inert objects and full
//! introspection, standing in for the platform's native RTC stack.

use async_trait::async_trait;
use serde_json::json;
use stage_client::errors::MediaError;
use stage_client::media::{
    LocalConsumer, LocalTrack, MediaStack, RecvTransport, RemoteTrack, SendTransport,
    TransportConnectionState,
};
use stage_protocol::types::{
    ConsumerCreated, DtlsParameters, MediaKind, RtpCapabilities, RtpParameters, TransportOptions,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

#[derive(Debug, Clone)]
struct ConsumerState {
    resumed: bool,
    kind: MediaKind,
    track_id: String,
}

#[derive(Default)]
struct StackState {
    loaded: Option<RtpCapabilities>,
    fail_next_load: bool,
    negotiated: Vec<String>,
    produced: Vec<(String, String)>,
    consumers: HashMap<String, ConsumerState>,
    transport_states: HashMap<String, watch::Sender<TransportConnectionState>>,
}

/// Fake [`MediaStack`] with shared introspectable state.
pub struct FakeMediaStack {
    state: Arc<Mutex<StackState>>,
}

impl FakeMediaStack {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(StackState::default())),
        })
    }

    /// Whether `load` ran.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.state.lock().unwrap().loaded.is_some()
    }

    /// Make the next `load` call fail (fatal capability exchange).
    pub fn fail_next_load(&self) {
        self.state.lock().unwrap().fail_next_load = true;
    }

    /// Transport ids that completed their one-shot negotiation.
    #[must_use]
    pub fn negotiated(&self) -> Vec<String> {
        self.state.lock().unwrap().negotiated.clone()
    }

    /// `(track_id, transport_id)` pairs produced so far.
    #[must_use]
    pub fn produced(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().produced.clone()
    }

    /// `(consumer_id, resumed)` for every local consumer created so far.
    #[must_use]
    pub fn consumer_states(&self) -> Vec<(String, bool)> {
        self.state
            .lock()
            .unwrap()
            .consumers
            .iter()
            .map(|(id, c)| (id.clone(), c.resumed))
            .collect()
    }

    /// Resumed state of a local consumer, if it exists.
    #[must_use]
    pub fn consumer_resumed(&self, consumer_id: &str) -> Option<bool> {
        self.state
            .lock()
            .unwrap()
            .consumers
            .get(consumer_id)
            .map(|c| c.resumed)
    }

    /// Push a connection state change into a transport's watchers.
    pub fn set_transport_state(&self, transport_id: &str, state: TransportConnectionState) {
        if let Some(sender) = self
            .state
            .lock()
            .unwrap()
            .transport_states
            .get(transport_id)
        {
            let _ = sender.send(state);
        }
    }
}

#[async_trait]
impl MediaStack for FakeMediaStack {
    async fn load(&self, router_capabilities: RtpCapabilities) -> Result<(), MediaError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_next_load {
            state.fail_next_load = false;
            return Err(MediaError::Failed("injected load failure".to_string()));
        }
        state.loaded = Some(router_capabilities);
        Ok(())
    }

    async fn rtp_capabilities(&self) -> Result<RtpCapabilities, MediaError> {
        self.state
            .lock()
            .unwrap()
            .loaded
            .clone()
            .ok_or_else(|| MediaError::InvalidState("device not loaded".to_string()))
    }

    async fn create_send_transport(
        &self,
        options: TransportOptions,
    ) -> Result<Arc<dyn SendTransport>, MediaError> {
        let (state_tx, state_rx) = watch::channel(TransportConnectionState::New);
        self.state
            .lock()
            .unwrap()
            .transport_states
            .insert(options.transport_id.clone(), state_tx);
        Ok(Arc::new(FakeSendTransport {
            transport_id: options.transport_id,
            negotiated: AtomicBool::new(false),
            state: Arc::clone(&self.state),
            state_rx,
        }))
    }

    async fn create_receive_transport(
        &self,
        options: TransportOptions,
    ) -> Result<Arc<dyn RecvTransport>, MediaError> {
        let (state_tx, state_rx) = watch::channel(TransportConnectionState::New);
        self.state
            .lock()
            .unwrap()
            .transport_states
            .insert(options.transport_id.clone(), state_tx);
        Ok(Arc::new(FakeRecvTransport {
            transport_id: options.transport_id,
            negotiated: AtomicBool::new(false),
            state: Arc::clone(&self.state),
            state_rx,
        }))
    }
}

fn negotiate_once(
    negotiated: &AtomicBool,
    transport_id: &str,
    state: &Arc<Mutex<StackState>>,
) -> Result<DtlsParameters, MediaError> {
    if negotiated.swap(true, Ordering::SeqCst) {
        return Err(MediaError::InvalidState(format!(
            "transport {transport_id} already negotiated"
        )));
    }
    state
        .lock()
        .unwrap()
        .negotiated
        .push(transport_id.to_string());
    Ok(DtlsParameters(json!({
        "role": "client",
        "fingerprints": [{ "algorithm": "sha-256", "value": "FA:KE" }],
    })))
}

struct FakeSendTransport {
    transport_id: String,
    negotiated: AtomicBool,
    state: Arc<Mutex<StackState>>,
    state_rx: watch::Receiver<TransportConnectionState>,
}

#[async_trait]
impl SendTransport for FakeSendTransport {
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    async fn negotiate(&self) -> Result<DtlsParameters, MediaError> {
        negotiate_once(&self.negotiated, &self.transport_id, &self.state)
    }

    async fn produce(&self, track: &LocalTrack) -> Result<RtpParameters, MediaError> {
        self.state
            .lock()
            .unwrap()
            .produced
            .push((track.track_id.clone(), self.transport_id.clone()));
        Ok(RtpParameters(json!({ "trackId": track.track_id })))
    }

    fn connection_state(&self) -> watch::Receiver<TransportConnectionState> {
        self.state_rx.clone()
    }

    async fn close(&self) {}
}

struct FakeRecvTransport {
    transport_id: String,
    negotiated: AtomicBool,
    state: Arc<Mutex<StackState>>,
    state_rx: watch::Receiver<TransportConnectionState>,
}

#[async_trait]
impl RecvTransport for FakeRecvTransport {
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    async fn negotiate(&self) -> Result<DtlsParameters, MediaError> {
        negotiate_once(&self.negotiated, &self.transport_id, &self.state)
    }

    async fn consume(
        &self,
        created: &ConsumerCreated,
    ) -> Result<Arc<dyn LocalConsumer>, MediaError> {
        let track_id = format!("remote-{}", created.producer_id);
        self.state.lock().unwrap().consumers.insert(
            created.consumer_id.clone(),
            ConsumerState {
                resumed: false,
                kind: created.kind,
                track_id: track_id.clone(),
            },
        );
        Ok(Arc::new(FakeConsumer {
            consumer_id: created.consumer_id.clone(),
            kind: created.kind,
            track_id,
            state: Arc::clone(&self.state),
        }))
    }

    fn connection_state(&self) -> watch::Receiver<TransportConnectionState> {
        self.state_rx.clone()
    }

    async fn close(&self) {}
}

struct FakeConsumer {
    consumer_id: String,
    kind: MediaKind,
    track_id: String,
    state: Arc<Mutex<StackState>>,
}

#[async_trait]
impl LocalConsumer for FakeConsumer {
    fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    async fn resume(&self) -> Result<(), MediaError> {
        let mut state = self.state.lock().unwrap();
        match state.consumers.get_mut(&self.consumer_id) {
            Some(consumer) => {
                consumer.resumed = true;
                Ok(())
            }
            None => Err(MediaError::InvalidState(format!(
                "unknown consumer {}",
                self.consumer_id
            ))),
        }
    }

    fn track(&self) -> RemoteTrack {
        RemoteTrack {
            track_id: self.track_id.clone(),
            kind: self.kind,
        }
    }

    async fn close(&self) {}
}
