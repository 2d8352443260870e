//! Stagelink signaling server.
//!
//! Stateful WebSocket signaling server for stage orchestration.
//!
//! # Servers
//!
//! - TLS WebSocket listener for client signaling (default: 0.0.0.0:4443)
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Initialize the media engine resource manager
//! 4. Spawn the registry actor
//! 5. Start the health HTTP server (liveness, readiness, metrics)
//! 6. Start the TLS signaling listener
//! 7. Wait for shutdown signal, then drain

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use stage_server::actors::registry::RegistryActor;
use stage_server::auth::JwtIdentityVerifier;
use stage_server::config::Config;
use stage_server::connection::{serve_connection, ConnectionDeps};
use stage_server::engine::{RtcEngine, RtcEngineSettings};
use stage_server::observability::{health_router, HealthState, RegistryMetrics};
use stage_server::tls::load_server_config;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Deadline for draining stage actors on shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stage_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Stagelink server");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        signaling_bind_address = %config.signaling_bind_address,
        health_bind_address = %config.health_bind_address,
        rtc_min_port = config.rtc_min_port,
        rtc_max_port = config.rtc_max_port,
        media_codecs = config.media_codecs.len(),
        max_participants_per_stage = config.max_participants_per_stage,
        "Configuration loaded successfully"
    );

    // Initialize Prometheus metrics recorder before any metrics are recorded
    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| {
            error!(error = %e, "Failed to install Prometheus metrics recorder");
            e
        })
        .context("install Prometheus metrics recorder")?;
    info!("Prometheus metrics recorder initialized");

    // Initialize health state
    let health_state = Arc::new(HealthState::new());

    // Media engine resource manager
    let engine = Arc::new(RtcEngine::new(RtcEngineSettings::from_config(&config)));
    info!("Media engine initialized");

    // Identity verification
    let verifier = Arc::new(JwtIdentityVerifier::new(&config.identity_token_secret));

    // Actor system
    let metrics = RegistryMetrics::new();
    let root_token = CancellationToken::new();
    let (registry, registry_task) = RegistryActor::spawn(
        engine,
        Arc::clone(&metrics),
        config.max_participants_per_stage,
        root_token.child_token(),
    );
    info!("Registry actor started");

    let deps = ConnectionDeps {
        registry: registry.clone(),
        verifier,
        metrics: Arc::clone(&metrics),
    };

    // Start health HTTP server (must succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config
        .health_bind_address
        .parse()
        .with_context(|| format!("invalid health bind address {}", config.health_bind_address))?;

    let app = health_router(Arc::clone(&health_state))
        .merge(Router::new().route(
            "/metrics",
            axum::routing::get(move || {
                let handle = prometheus_handle.clone();
                async move { handle.render() }
            }),
        ))
        .layer(tower_http::trace::TraceLayer::new_for_http());

    // Bind before spawning to fail fast on bind errors
    let health_listener = TcpListener::bind(health_addr)
        .await
        .with_context(|| format!("failed to bind health server to {health_addr}"))?;
    info!(addr = %health_addr, "Health server bound successfully");

    let health_shutdown_token = root_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // TLS signaling listener
    let tls_config = load_server_config(&config.tls_cert_path, &config.tls_key_path)?;
    let acceptor = TlsAcceptor::from(tls_config);

    let signaling_addr: SocketAddr = config.signaling_bind_address.parse().with_context(|| {
        format!(
            "invalid signaling bind address {}",
            config.signaling_bind_address
        )
    })?;
    let signaling_listener = TcpListener::bind(signaling_addr)
        .await
        .with_context(|| format!("failed to bind signaling listener to {signaling_addr}"))?;
    info!(addr = %signaling_addr, "Signaling listener bound successfully");

    let accept_token = root_token.child_token();
    tokio::spawn(run_signaling_listener(
        signaling_listener,
        acceptor,
        deps,
        accept_token,
    ));

    health_state.set_ready();
    info!("Stagelink server running - press Ctrl+C to shutdown");

    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");
    health_state.set_not_ready();

    // Drain stages first so teardown broadcasts still reach clients, then
    // cancel everything else.
    if let Err(e) = registry.shutdown(SHUTDOWN_DEADLINE).await {
        warn!(error = %e, "Registry shutdown error");
    }
    root_token.cancel();

    let _ = tokio::time::timeout(Duration::from_secs(2), registry_task).await;

    info!("Stagelink server shutdown complete");
    Ok(())
}

/// Accept loop for the TLS signaling listener.
async fn run_signaling_listener(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    deps: ConnectionDeps,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!("Signaling listener shutting down");
                break;
            }

            accepted = listener.accept() => {
                let (tcp, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "TCP accept failed");
                        continue;
                    }
                };

                let acceptor = acceptor.clone();
                let deps = deps.clone();
                let conn_token = cancel.child_token();

                tokio::spawn(async move {
                    let tls = match acceptor.accept(tcp).await {
                        Ok(tls) => tls,
                        Err(e) => {
                            debug!(peer = %peer_addr, error = %e, "TLS handshake failed");
                            return;
                        }
                    };

                    let ws = match tokio_tungstenite::accept_async(tls).await {
                        Ok(ws) => ws,
                        Err(e) => {
                            debug!(peer = %peer_addr, error = %e, "WebSocket handshake failed");
                            return;
                        }
                    };

                    serve_connection(ws, deps, conn_token).await;
                });
            }
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
