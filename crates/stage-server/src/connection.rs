//! Per-connection WebSocket handling.
//!
//! Each accepted WebSocket gets a reader loop (this function) and a writer
//! task. The reader decodes envelopes and dispatches: requests are answered
//! with a correlated response, events are fire-and-forget. Stage actors push
//! broadcasts into the writer through the connection's `ConnectionHandle`.
//!
//! Session state is an explicit context object created on a successful
//! create/join, not captured closure state; until it exists only
//! `create-stage` and `join-stage` are accepted.

use crate::actors::messages::{ConnectionHandle, RelayPayload};
use crate::actors::registry::RegistryActorHandle;
use crate::actors::stage::StageActorHandle;
use crate::auth::IdentityVerifier;
use crate::errors::StageError;
use crate::observability::metrics::RegistryMetrics;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use stage_protocol::envelope::{self, ClientEnvelope, ServerEnvelope};
use stage_protocol::messages::{ClientMessage, ResponsePayload, ServerMessage};
use stage_protocol::types::{Ack, StageCreated, StageJoined, TrackSent, TransportDirection};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Buffer size for the outbound (server-to-client) queue.
const OUTBOUND_CHANNEL_BUFFER: usize = 200;

/// Shared dependencies handed to every connection task.
#[derive(Clone)]
pub struct ConnectionDeps {
    pub registry: RegistryActorHandle,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub metrics: Arc<RegistryMetrics>,
}

/// Per-connection session context, created on a successful create/join.
struct SessionContext {
    stage: StageActorHandle,
    participant_id: String,
}

/// Serve one WebSocket connection until it closes or the server shuts down.
#[instrument(skip_all, name = "stage.connection", fields(connection_id))]
pub async fn serve_connection<S>(
    ws: WebSocketStream<S>,
    deps: ConnectionDeps,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let connection_id = Uuid::new_v4().to_string();
    tracing::Span::current().record("connection_id", tracing::field::display(&connection_id));

    deps.metrics.connection_opened();
    info!(target: "stage.connection", connection_id = %connection_id, "Connection opened");

    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerEnvelope>(OUTBOUND_CHANNEL_BUFFER);
    let outbound = ConnectionHandle::new(connection_id.clone(), out_tx);

    // Writer task: drains the outbound queue in order. Responses and
    // broadcasts share it, so per-connection ordering is preserved.
    let writer_connection_id = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(envelope) = out_rx.recv().await {
            match envelope::encode(&envelope) {
                Ok(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(
                        target: "stage.connection",
                        connection_id = %writer_connection_id,
                        error = %e,
                        "Failed to encode outbound envelope"
                    );
                }
            }
        }
        let _ = sink.close().await;
    });

    let mut session: Option<SessionContext> = None;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!(
                    target: "stage.connection",
                    connection_id = %connection_id,
                    "Connection cancelled by shutdown"
                );
                break;
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        deps.metrics.message_processed();
                        handle_frame(
                            text.as_str(),
                            &connection_id,
                            &outbound,
                            &deps,
                            &mut session,
                        )
                        .await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Binary/ping/pong frames carry no signaling.
                    }
                    Some(Err(e)) => {
                        debug!(
                            target: "stage.connection",
                            connection_id = %connection_id,
                            error = %e,
                            "WebSocket read failed"
                        );
                        break;
                    }
                }
            }
        }
    }

    // Exactly one teardown notification per joined connection.
    if let Some(ctx) = session.take() {
        let _ = ctx
            .stage
            .connection_closed(ctx.participant_id, connection_id.clone())
            .await;
    }

    // Dropping our ConnectionHandle lets the writer finish once stage
    // actors have released their clones.
    drop(outbound);
    let _ = writer.await;

    deps.metrics.connection_closed();
    info!(target: "stage.connection", connection_id = %connection_id, "Connection closed");
}

/// Decode and dispatch a single text frame.
async fn handle_frame(
    text: &str,
    connection_id: &str,
    outbound: &ConnectionHandle,
    deps: &ConnectionDeps,
    session: &mut Option<SessionContext>,
) {
    let ClientEnvelope { id, message, .. } = match envelope::decode_client(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(
                target: "stage.connection",
                connection_id = %connection_id,
                error = %e,
                "Dropping malformed frame"
            );
            return;
        }
    };

    match id {
        Some(id) => {
            let event = message.event_name();
            let payload = match dispatch_request(message, connection_id, outbound, deps, session)
                .await
            {
                Ok(result) => ResponsePayload {
                    result: Some(result),
                    error: None,
                },
                Err(e) => {
                    debug!(
                        target: "stage.connection",
                        connection_id = %connection_id,
                        event = event,
                        error = %e,
                        "Request failed"
                    );
                    ResponsePayload::err(e.to_payload())
                }
            };
            let _ = outbound
                .send(ServerEnvelope::response(id, ServerMessage::Response(payload)))
                .await;
        }
        None => dispatch_event(message, connection_id, session).await,
    }
}

fn json<T: serde::Serialize>(value: &T) -> Result<Value, StageError> {
    serde_json::to_value(value).map_err(|e| StageError::Internal(format!("serialize: {e}")))
}

fn current_session<'a>(
    session: &'a Option<SessionContext>,
) -> Result<&'a SessionContext, StageError> {
    session
        .as_ref()
        .ok_or_else(|| StageError::Conflict("Not in a stage".to_string()))
}

/// Handle a correlated request, returning its result payload.
async fn dispatch_request(
    message: ClientMessage,
    connection_id: &str,
    outbound: &ConnectionHandle,
    deps: &ConnectionDeps,
    session: &mut Option<SessionContext>,
) -> Result<Value, StageError> {
    match message {
        ClientMessage::CreateStage {
            identity_token,
            stage_name,
            kind,
            mode,
            password,
        } => {
            if session.is_some() {
                return Err(StageError::Conflict("Already in a stage".to_string()));
            }
            // Identity check happens before the registry is consulted.
            let identity = deps.verifier.verify(&identity_token).await?;
            let creation = deps
                .registry
                .create_stage(
                    identity,
                    connection_id.to_string(),
                    stage_name,
                    kind,
                    mode,
                    password,
                    outbound.clone(),
                )
                .await?;

            let result = json(&StageCreated {
                stage_id: creation.stage_id,
                participant_id: creation.participant_id.clone(),
            })?;
            *session = Some(SessionContext {
                stage: creation.handle,
                participant_id: creation.participant_id,
            });
            Ok(result)
        }

        ClientMessage::JoinStage {
            identity_token,
            stage_id,
            password,
        } => {
            if session.is_some() {
                return Err(StageError::Conflict("Already in a stage".to_string()));
            }
            let identity = deps.verifier.verify(&identity_token).await?;
            let stage = deps.registry.get_stage(stage_id).await?;
            let joined = stage
                .join(
                    identity,
                    connection_id.to_string(),
                    password,
                    outbound.clone(),
                )
                .await?;

            let result = json(&StageJoined {
                participant_id: joined.participant_id.clone(),
                snapshot: joined.snapshot,
            })?;
            *session = Some(SessionContext {
                stage,
                participant_id: joined.participant_id,
            });
            Ok(result)
        }

        ClientMessage::LeaveStage => {
            let ctx = session
                .take()
                .ok_or_else(|| StageError::Conflict("Not in a stage".to_string()))?;
            ctx.stage.leave(ctx.participant_id).await?;
            json(&Ack {})
        }

        ClientMessage::GetRtpCapabilities => {
            let ctx = current_session(session)?;
            let capabilities = ctx.stage.router_capabilities().await?;
            json(&capabilities)
        }

        ClientMessage::CreateSendTransport { rtp_capabilities } => {
            let ctx = current_session(session)?;
            let options = ctx
                .stage
                .create_transport(
                    ctx.participant_id.clone(),
                    TransportDirection::Send,
                    rtp_capabilities,
                )
                .await?;
            json(&options)
        }

        ClientMessage::CreateReceiveTransport { rtp_capabilities } => {
            let ctx = current_session(session)?;
            let options = ctx
                .stage
                .create_transport(
                    ctx.participant_id.clone(),
                    TransportDirection::Receive,
                    rtp_capabilities,
                )
                .await?;
            json(&options)
        }

        ClientMessage::ConnectTransport {
            transport_id,
            dtls_parameters,
        } => {
            let ctx = current_session(session)?;
            ctx.stage
                .connect_transport(ctx.participant_id.clone(), transport_id, dtls_parameters)
                .await?;
            json(&Ack {})
        }

        ClientMessage::SendTrack {
            transport_id,
            kind,
            rtp_parameters,
        } => {
            let ctx = current_session(session)?;
            let producer_id = ctx
                .stage
                .send_track(
                    ctx.participant_id.clone(),
                    transport_id,
                    kind,
                    rtp_parameters,
                )
                .await?;
            json(&TrackSent { producer_id })
        }

        ClientMessage::Consume {
            producer_id,
            transport_id,
            rtp_capabilities,
        } => {
            let ctx = current_session(session)?;
            let created = ctx
                .stage
                .consume(
                    ctx.participant_id.clone(),
                    producer_id,
                    transport_id,
                    rtp_capabilities,
                )
                .await?;
            json(&created)
        }

        ClientMessage::FinishConsume { consumer_id } => {
            let ctx = current_session(session)?;
            ctx.stage
                .finish_consume(ctx.participant_id.clone(), consumer_id)
                .await?;
            json(&Ack {})
        }

        ClientMessage::CloseProducer { producer_id } => {
            let ctx = current_session(session)?;
            ctx.stage
                .close_producer(ctx.participant_id.clone(), producer_id)
                .await?;
            json(&Ack {})
        }

        ClientMessage::MakeOffer {
            target_connection_id,
            offer,
        } => {
            let ctx = current_session(session)?;
            ctx.stage
                .relay(
                    ctx.participant_id.clone(),
                    connection_id.to_string(),
                    RelayPayload::Offer {
                        target_connection_id,
                        offer,
                    },
                )
                .await?;
            json(&Ack {})
        }

        ClientMessage::MakeAnswer {
            target_connection_id,
            answer,
        } => {
            let ctx = current_session(session)?;
            ctx.stage
                .relay(
                    ctx.participant_id.clone(),
                    connection_id.to_string(),
                    RelayPayload::Answer {
                        target_connection_id,
                        answer,
                    },
                )
                .await?;
            json(&Ack {})
        }

        ClientMessage::SendCandidate {
            target_connection_id,
            candidate,
        } => {
            let ctx = current_session(session)?;
            ctx.stage
                .relay(
                    ctx.participant_id.clone(),
                    connection_id.to_string(),
                    RelayPayload::Candidate {
                        target_connection_id,
                        candidate,
                    },
                )
                .await?;
            json(&Ack {})
        }
    }
}

/// Handle a fire-and-forget event.
async fn dispatch_event(
    message: ClientMessage,
    connection_id: &str,
    session: &mut Option<SessionContext>,
) {
    let event = message.event_name();
    let result = match message {
        ClientMessage::LeaveStage => match session.take() {
            Some(ctx) => ctx.stage.leave(ctx.participant_id).await,
            None => Err(StageError::Conflict("Not in a stage".to_string())),
        },

        ClientMessage::CloseProducer { producer_id } => match session.as_ref() {
            Some(ctx) => {
                ctx.stage
                    .close_producer(ctx.participant_id.clone(), producer_id)
                    .await
            }
            None => Err(StageError::Conflict("Not in a stage".to_string())),
        },

        ClientMessage::MakeOffer {
            target_connection_id,
            offer,
        } => {
            relay_event(
                session,
                connection_id,
                RelayPayload::Offer {
                    target_connection_id,
                    offer,
                },
            )
            .await
        }

        ClientMessage::MakeAnswer {
            target_connection_id,
            answer,
        } => {
            relay_event(
                session,
                connection_id,
                RelayPayload::Answer {
                    target_connection_id,
                    answer,
                },
            )
            .await
        }

        ClientMessage::SendCandidate {
            target_connection_id,
            candidate,
        } => {
            relay_event(
                session,
                connection_id,
                RelayPayload::Candidate {
                    target_connection_id,
                    candidate,
                },
            )
            .await
        }

        other => {
            warn!(
                target: "stage.connection",
                connection_id = %connection_id,
                event = other.event_name(),
                "Request event sent without correlation id, dropping"
            );
            Ok(())
        }
    };

    if let Err(e) = result {
        debug!(
            target: "stage.connection",
            connection_id = %connection_id,
            event = event,
            error = %e,
            "Event handling failed"
        );
    }
}

async fn relay_event(
    session: &Option<SessionContext>,
    connection_id: &str,
    payload: RelayPayload,
) -> Result<(), StageError> {
    let ctx = session
        .as_ref()
        .ok_or_else(|| StageError::Conflict("Not in a stage".to_string()))?;
    ctx.stage
        .relay(ctx.participant_id.clone(), connection_id.to_string(), payload)
        .await
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::actors::registry::RegistryActor;
    use crate::auth::Identity;
    use crate::config::default_media_codecs;
    use crate::engine::{
        MediaEngine, RtcEngine, RtcEngineSettings, DEFAULT_INITIAL_AVAILABLE_OUTGOING_BITRATE,
        DEFAULT_MAX_INCOMING_BITRATE,
    };

    use async_trait::async_trait;
    use futures_util::stream::{SplitSink, SplitStream};
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::time::timeout;
    use tokio_tungstenite::{client_async, WebSocketStream};

    /// Accepts tokens of the form `valid-<identity>`.
    struct PrefixVerifier;

    #[async_trait]
    impl IdentityVerifier for PrefixVerifier {
        async fn verify(&self, token: &str) -> Result<Identity, StageError> {
            token
                .strip_prefix("valid-")
                .map(|id| Identity {
                    identity_id: id.to_string(),
                    display_name: format!("User {id}"),
                })
                .ok_or_else(|| StageError::Authentication("unknown token".to_string()))
        }
    }

    type ClientWs = WebSocketStream<DuplexStream>;

    async fn connect() -> (
        SplitSink<ClientWs, Message>,
        SplitStream<ClientWs>,
        CancellationToken,
    ) {
        let engine: Arc<dyn MediaEngine> = Arc::new(RtcEngine::new(RtcEngineSettings {
            listen_ip: "127.0.0.1".to_string(),
            announced_ip: None,
            rtc_min_port: 40000,
            rtc_max_port: 40099,
            media_codecs: default_media_codecs(),
            initial_available_outgoing_bitrate: DEFAULT_INITIAL_AVAILABLE_OUTGOING_BITRATE,
            max_incoming_bitrate: DEFAULT_MAX_INCOMING_BITRATE,
        }));
        let metrics = RegistryMetrics::new();
        let cancel = CancellationToken::new();
        let (registry, _task) = RegistryActor::spawn(
            engine,
            Arc::clone(&metrics),
            16,
            cancel.child_token(),
        );

        let deps = ConnectionDeps {
            registry,
            verifier: Arc::new(PrefixVerifier),
            metrics,
        };

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server_cancel = cancel.child_token();
        tokio::spawn(async move {
            let ws = tokio_tungstenite::accept_async(server_io)
                .await
                .expect("server handshake");
            serve_connection(ws, deps, server_cancel).await;
        });

        let (ws, _response) = client_async("ws://stagelink.test/signal", client_io)
            .await
            .expect("client handshake");
        let (sink, stream) = ws.split();
        (sink, stream, cancel)
    }

    async fn send_raw(sink: &mut SplitSink<ClientWs, Message>, value: serde_json::Value) {
        sink.send(Message::Text(value.to_string().into()))
            .await
            .expect("send frame");
    }

    async fn recv_response(stream: &mut SplitStream<ClientWs>) -> (u64, ResponsePayload) {
        loop {
            let frame = timeout(Duration::from_secs(2), stream.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("frame error");
            if let Message::Text(text) = frame {
                let envelope = envelope::decode_server(text.as_str()).expect("decode");
                if let ServerMessage::Response(payload) = envelope.message {
                    return (envelope.id.expect("response id"), payload);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_create_stage_over_websocket() {
        let (mut sink, mut stream, _cancel) = connect().await;

        send_raw(
            &mut sink,
            json!({
                "id": 1,
                "event": "create-stage",
                "payload": {
                    "identity_token": "valid-alice",
                    "stage_name": "opening",
                    "kind": "theater",
                    "mode": "sfu"
                }
            }),
        )
        .await;

        let (id, payload) = recv_response(&mut stream).await;
        assert_eq!(id, 1);
        let result = payload.into_result().expect("create should succeed");
        assert!(result["stage_id"].is_string());
        assert!(result["participant_id"].is_string());
    }

    #[tokio::test]
    async fn test_invalid_token_is_rejected_before_registry() {
        let (mut sink, mut stream, _cancel) = connect().await;

        send_raw(
            &mut sink,
            json!({
                "id": 7,
                "event": "create-stage",
                "payload": {
                    "identity_token": "bogus",
                    "stage_name": "opening",
                    "kind": "theater",
                    "mode": "sfu"
                }
            }),
        )
        .await;

        let (id, payload) = recv_response(&mut stream).await;
        assert_eq!(id, 7);
        let error = payload.into_result().expect_err("create should fail");
        assert_eq!(error.code, stage_protocol::ErrorCode::Authentication);
    }

    #[tokio::test]
    async fn test_media_request_requires_session() {
        let (mut sink, mut stream, _cancel) = connect().await;

        send_raw(
            &mut sink,
            json!({ "id": 3, "event": "get-rtp-capabilities" }),
        )
        .await;

        let (_, payload) = recv_response(&mut stream).await;
        let error = payload.into_result().expect_err("should fail");
        assert_eq!(error.code, stage_protocol::ErrorCode::Conflict);
    }

    #[tokio::test]
    async fn test_second_create_on_same_connection_conflicts() {
        let (mut sink, mut stream, _cancel) = connect().await;

        for id in [1u64, 2] {
            send_raw(
                &mut sink,
                json!({
                    "id": id,
                    "event": "create-stage",
                    "payload": {
                        "identity_token": "valid-alice",
                        "stage_name": "opening",
                        "kind": "theater",
                        "mode": "sfu"
                    }
                }),
            )
            .await;
        }

        let (_, first) = recv_response(&mut stream).await;
        assert!(first.into_result().is_ok());
        let (_, second) = recv_response(&mut stream).await;
        let error = second.into_result().expect_err("second create must fail");
        assert_eq!(error.code, stage_protocol::ErrorCode::Conflict);
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped_not_fatal() {
        let (mut sink, mut stream, _cancel) = connect().await;

        sink.send(Message::Text("{not json".to_string().into()))
            .await
            .expect("send frame");

        // The connection stays usable.
        send_raw(
            &mut sink,
            json!({
                "id": 9,
                "event": "create-stage",
                "payload": {
                    "identity_token": "valid-alice",
                    "stage_name": "still alive",
                    "kind": "music",
                    "mode": "sfu"
                }
            }),
        )
        .await;

        let (id, payload) = recv_response(&mut stream).await;
        assert_eq!(id, 9);
        assert!(payload.into_result().is_ok());
    }
}
