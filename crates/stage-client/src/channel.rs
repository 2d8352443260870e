//! Signaling channel.
//!
//! One WebSocket connection carrying both correlated request/response pairs
//! and fire-and-forget events in either direction. A single driver task owns
//! the socket, which preserves per-connection ordering; unsolicited server
//! events fan out over a broadcast channel, and responses complete their
//! pending request by correlation id.
//!
//! Closing the channel is idempotent and fails every pending request with a
//! connection error; it never cancels work the server already committed.

use crate::errors::SessionError;

use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use stage_protocol::envelope::{self, ClientEnvelope, ServerEnvelope};
use stage_protocol::messages::{ClientMessage, ServerMessage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default per-request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffer size for the server-event broadcast.
const EVENT_CHANNEL_BUFFER: usize = 256;

/// Channel configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Deadline applied to every request unless overridden per call.
    pub request_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<Result<Value, SessionError>>>>;

struct ChannelInner {
    outbound: mpsc::UnboundedSender<ClientEnvelope>,
    pending: PendingMap,
    next_id: AtomicU64,
    events: broadcast::Sender<ServerMessage>,
    closed: CancellationToken,
    request_timeout: Duration,
}

impl ChannelInner {
    /// Fail every pending request with a cancellation error.
    fn fail_pending(&self) {
        let senders: Vec<_> = match self.pending.lock() {
            Ok(mut pending) => pending.drain().map(|(_, tx)| tx).collect(),
            Err(_) => return,
        };
        for tx in senders {
            let _ = tx.send(Err(SessionError::Connection(
                "channel closed before response".to_string(),
            )));
        }
    }
}

/// A connected signaling channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Open a channel to the given `wss://` endpoint.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Connection` if the socket or WebSocket
    /// handshake fails.
    pub async fn connect(endpoint: &str, config: ChannelConfig) -> Result<Self, SessionError> {
        let (ws, _response) = connect_async(endpoint)
            .await
            .map_err(|e| SessionError::Connection(format!("connect to {endpoint} failed: {e}")))?;
        Ok(Self::from_stream(ws, config))
    }

    /// Build a channel over an already-established WebSocket stream.
    ///
    /// Used by tests to run the real protocol over in-memory pipes.
    pub fn from_stream<S>(ws: WebSocketStream<S>, config: ChannelConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_BUFFER);

        let inner = Arc::new(ChannelInner {
            outbound: outbound_tx,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            events: events_tx,
            closed: CancellationToken::new(),
            request_timeout: config.request_timeout,
        });

        tokio::spawn(drive(ws, outbound_rx, Arc::clone(&inner)));

        Self { inner }
    }

    /// Issue a request and await its single correlated response.
    ///
    /// # Errors
    ///
    /// `SessionError::Timeout` if no response arrives within the configured
    /// deadline, `SessionError::Connection` if the channel closes first, or
    /// the typed error the server responded with.
    pub async fn request<T: DeserializeOwned>(
        &self,
        message: ClientMessage,
    ) -> Result<T, SessionError> {
        self.request_with_timeout(message, self.inner.request_timeout)
            .await
    }

    /// Issue a request with an explicit per-call deadline.
    ///
    /// # Errors
    ///
    /// See [`Channel::request`].
    pub async fn request_with_timeout<T: DeserializeOwned>(
        &self,
        message: ClientMessage,
        deadline: Duration,
    ) -> Result<T, SessionError> {
        if self.inner.closed.is_cancelled() {
            return Err(SessionError::Connection("channel is closed".to_string()));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self
                .inner
                .pending
                .lock()
                .map_err(|_| SessionError::Connection("pending map poisoned".to_string()))?;
            pending.insert(id, tx);
        }

        if self
            .inner
            .outbound
            .send(ClientEnvelope::request(id, message))
            .is_err()
        {
            self.remove_pending(id);
            return Err(SessionError::Connection("channel is closed".to_string()));
        }

        let value = match tokio::time::timeout(deadline, rx).await {
            Err(_) => {
                // Timed out with no other failure first.
                self.remove_pending(id);
                return Err(SessionError::Timeout);
            }
            Ok(Err(_)) => {
                return Err(SessionError::Connection(
                    "channel closed before response".to_string(),
                ))
            }
            Ok(Ok(result)) => result?,
        };

        serde_json::from_value(value)
            .map_err(|e| SessionError::Protocol(format!("unexpected response shape: {e}")))
    }

    /// Send a fire-and-forget event.
    ///
    /// # Errors
    ///
    /// `SessionError::Connection` if the channel is closed.
    pub fn emit(&self, message: ClientMessage) -> Result<(), SessionError> {
        if self.inner.closed.is_cancelled() {
            return Err(SessionError::Connection("channel is closed".to_string()));
        }
        self.inner
            .outbound
            .send(ClientEnvelope::event(message))
            .map_err(|_| SessionError::Connection("channel is closed".to_string()))
    }

    /// Subscribe to unsolicited server events (broadcasts and relays).
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.inner.events.subscribe()
    }

    /// Token cancelled once the channel is down (either direction).
    #[must_use]
    pub fn closed_token(&self) -> CancellationToken {
        self.inner.closed.clone()
    }

    /// Whether the channel has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Close the channel. Idempotent and safe from a shutdown hook; all
    /// pending requests fail with a cancellation error.
    pub fn close(&self) {
        self.inner.closed.cancel();
        self.inner.fail_pending();
    }

    fn remove_pending(&self, id: u64) {
        if let Ok(mut pending) = self.inner.pending.lock() {
            pending.remove(&id);
        }
    }
}

/// Driver task: owns the socket, serializes all traffic.
async fn drive<S>(
    mut ws: WebSocketStream<S>,
    mut outbound_rx: mpsc::UnboundedReceiver<ClientEnvelope>,
    inner: Arc<ChannelInner>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        tokio::select! {
            () = inner.closed.cancelled() => {
                let _ = ws.close(None).await;
                break;
            }

            envelope = outbound_rx.recv() => {
                match envelope {
                    Some(envelope) => {
                        let text = match envelope::encode(&envelope) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!(
                                    target: "stage.client.channel",
                                    error = %e,
                                    "Failed to encode outbound envelope"
                                );
                                continue;
                            }
                        };
                        if ws.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            frame = ws.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => handle_incoming(text.as_str(), &inner),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(
                            target: "stage.client.channel",
                            error = %e,
                            "WebSocket read failed"
                        );
                        break;
                    }
                }
            }
        }
    }

    inner.closed.cancel();
    inner.fail_pending();
    debug!(target: "stage.client.channel", "Channel driver stopped");
}

/// Route one incoming frame: correlated responses complete their pending
/// request, everything else fans out to subscribers.
fn handle_incoming(text: &str, inner: &Arc<ChannelInner>) {
    let ServerEnvelope { id, message, .. } = match envelope::decode_server(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(
                target: "stage.client.channel",
                error = %e,
                "Dropping malformed server frame"
            );
            return;
        }
    };

    match id {
        Some(id) => {
            let waiter = match inner.pending.lock() {
                Ok(mut pending) => pending.remove(&id),
                Err(_) => None,
            };
            let Some(waiter) = waiter else {
                // Response for a timed-out or cancelled request.
                debug!(
                    target: "stage.client.channel",
                    correlation_id = id,
                    "Dropping response with no pending request"
                );
                return;
            };

            let result = match message {
                ServerMessage::Response(payload) => {
                    payload.into_result().map_err(SessionError::from)
                }
                other => Err(SessionError::Protocol(format!(
                    "correlated frame is not a response: {}",
                    other.event_name()
                ))),
            };
            let _ = waiter.send(result);
        }
        None => {
            // No subscribers is fine; events are droppable.
            let _ = inner.events.send(message);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use stage_protocol::messages::ResponsePayload;
    use stage_protocol::types::{Ack, ParticipantInfo, ParticipantRole, RtpCapabilities};
    use stage_protocol::{ErrorCode, ErrorPayload};
    use tokio::io::DuplexStream;

    /// A scripted server side speaking real WebSocket over a duplex pipe.
    struct FakeServer {
        ws: WebSocketStream<DuplexStream>,
    }

    impl FakeServer {
        async fn recv_client(&mut self) -> ClientEnvelope {
            loop {
                let frame = self
                    .ws
                    .next()
                    .await
                    .expect("stream ended")
                    .expect("frame error");
                if let Message::Text(text) = frame {
                    return envelope::decode_client(text.as_str()).expect("decode client frame");
                }
            }
        }

        async fn send_server(&mut self, envelope: ServerEnvelope) {
            let text = envelope::encode(&envelope).expect("encode");
            self.ws
                .send(Message::Text(text.into()))
                .await
                .expect("send");
        }
    }

    async fn connected_pair(config: ChannelConfig) -> (Channel, FakeServer) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        let server = tokio::spawn(async move {
            tokio_tungstenite::accept_async(server_io)
                .await
                .expect("server handshake")
        });
        let (client_ws, _) = tokio_tungstenite::client_async("ws://stagelink.test/signal", client_io)
            .await
            .expect("client handshake");

        let channel = Channel::from_stream(client_ws, config);
        let ws = server.await.expect("server task");
        (channel, FakeServer { ws })
    }

    #[tokio::test]
    async fn test_request_resolves_with_correlated_response() {
        let (channel, mut server) = connected_pair(ChannelConfig::default()).await;

        let request = tokio::spawn({
            let channel = channel.clone();
            async move {
                channel
                    .request::<RtpCapabilities>(ClientMessage::GetRtpCapabilities)
                    .await
            }
        });

        let envelope = server.recv_client().await;
        let id = envelope.id.expect("request id");
        assert!(matches!(envelope.message, ClientMessage::GetRtpCapabilities));

        server
            .send_server(ServerEnvelope::response(
                id,
                ServerMessage::Response(
                    ResponsePayload::ok(&RtpCapabilities::default()).expect("payload"),
                ),
            ))
            .await;

        let caps = request.await.expect("join").expect("request should succeed");
        assert!(caps.codecs.is_empty());
    }

    #[tokio::test]
    async fn test_server_error_maps_to_typed_error() {
        let (channel, mut server) = connected_pair(ChannelConfig::default()).await;

        let request = tokio::spawn({
            let channel = channel.clone();
            async move { channel.request::<Ack>(ClientMessage::LeaveStage).await }
        });

        let envelope = server.recv_client().await;
        let id = envelope.id.expect("request id");
        server
            .send_server(ServerEnvelope::response(
                id,
                ServerMessage::Response(ResponsePayload::err(ErrorPayload::new(
                    ErrorCode::NotFound,
                    "Stage not found",
                ))),
            ))
            .await;

        let result = request.await.expect("join");
        assert!(matches!(result, Err(SessionError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_request_times_out_without_response() {
        let (channel, _server) = connected_pair(ChannelConfig {
            request_timeout: Duration::from_millis(50),
        })
        .await;

        let result = channel
            .request::<Ack>(ClientMessage::GetRtpCapabilities)
            .await;
        assert!(matches!(result, Err(SessionError::Timeout)));
    }

    #[tokio::test]
    async fn test_close_fails_pending_requests() {
        let (channel, _server) = connected_pair(ChannelConfig::default()).await;

        let request = tokio::spawn({
            let channel = channel.clone();
            async move {
                channel
                    .request::<Ack>(ClientMessage::GetRtpCapabilities)
                    .await
            }
        });

        // Give the request a moment to register, then close.
        tokio::time::sleep(Duration::from_millis(20)).await;
        channel.close();

        let result = request.await.expect("join");
        assert!(matches!(result, Err(SessionError::Connection(_))));
        assert!(channel.is_closed());

        // Idempotent.
        channel.close();
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn test_requests_fail_fast_after_close() {
        let (channel, _server) = connected_pair(ChannelConfig::default()).await;
        channel.close();

        let result = channel
            .request::<Ack>(ClientMessage::GetRtpCapabilities)
            .await;
        assert!(matches!(result, Err(SessionError::Connection(_))));
        assert!(matches!(
            channel.emit(ClientMessage::LeaveStage),
            Err(SessionError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_unsolicited_events_reach_subscribers() {
        let (channel, mut server) = connected_pair(ChannelConfig::default()).await;
        let mut events = channel.subscribe();

        let info = ParticipantInfo {
            participant_id: "p2".to_string(),
            connection_id: "c2".to_string(),
            name: "Bob".to_string(),
            role: ParticipantRole::Actor,
        };
        server
            .send_server(ServerEnvelope::event(ServerMessage::ParticipantJoined(
                info.clone(),
            )))
            .await;

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("timed out")
            .expect("event");
        match event {
            ServerMessage::ParticipantJoined(received) => assert_eq!(received, info),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_emit_sends_envelope_without_id() {
        let (channel, mut server) = connected_pair(ChannelConfig::default()).await;

        channel
            .emit(ClientMessage::LeaveStage)
            .expect("emit should succeed");

        let envelope = server.recv_client().await;
        assert_eq!(envelope.id, None);
        assert!(matches!(envelope.message, ClientMessage::LeaveStage));
    }

    #[tokio::test]
    async fn test_server_side_close_cancels_channel() {
        let (channel, server) = connected_pair(ChannelConfig::default()).await;
        drop(server);

        tokio::time::timeout(Duration::from_secs(1), channel.closed_token().cancelled())
            .await
            .expect("channel should observe the close");
        assert!(channel.is_closed());
    }
}
