//! Interest Relay
//!
//! Pairs WebSocket clients by shared interest and relays text messages
//! between partners.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Spawn the `CoordinatorActor`
//! 4. Bind the listener (WebSocket, health and metrics on one port)
//! 5. Mark ready and serve until a shutdown signal arrives
//!
//! # Shutdown Flow
//!
//! 1. Mark not ready
//! 2. Coordinator stops accepting registrations and closes every session
//! 3. Connection actors unwind; the server drains for up to the grace period

#![warn(clippy::pedantic)]

use std::net::SocketAddr;
use std::sync::Arc;

use relay_service::actors::{ActorMetrics, ActorType, CoordinatorActor};
use relay_service::config::Config;
use relay_service::observability::{init_metrics_recorder, metrics as prom, HealthState};
use relay_service::routes::{build_routes, AppState};
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Interest Relay");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        relay_id = %config.relay_id,
        bind_address = %config.bind_address,
        ws_path = %config.ws_path,
        outbound_queue = config.outbound_queue,
        coordinator_queue = config.coordinator_queue,
        max_frame_bytes = config.max_frame_bytes,
        shutdown_grace_seconds = config.shutdown_grace_seconds,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());

    // Initialize actor system
    let actor_metrics = ActorMetrics::new();
    let (coordinator, mut coordinator_task) = CoordinatorActor::spawn(
        config.relay_id.clone(),
        config.coordinator_queue,
        CancellationToken::new(),
        Arc::clone(&actor_metrics),
    );
    info!("Coordinator started");

    // Connections and the server stop when the coordinator does
    let shutdown_token = coordinator.child_token();

    let bind_addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid bind address");
        format!("Invalid bind address: {e}")
    })?;

    let state = Arc::new(AppState {
        coordinator: coordinator.clone(),
        config: config.clone(),
        metrics: Arc::clone(&actor_metrics),
        shutdown_token: shutdown_token.clone(),
    });
    let app = build_routes(state, Arc::clone(&health_state), prometheus_handle);

    // Bind listener BEFORE spawning to fail fast on bind errors
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %bind_addr, "Failed to bind listener");
            format!("Failed to bind listener to {bind_addr}: {e}")
        })?;
    info!(addr = %bind_addr, "Listener bound successfully");

    let server_token = shutdown_token.child_token();
    let mut server_task = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            server_token.cancelled().await;
            info!("HTTP server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "HTTP server failed");
        }
    });

    health_state.set_ready();
    info!(addr = %bind_addr, ws_path = %config.ws_path, "Interest Relay running");

    tokio::select! {
        () = shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown...");
        }
        result = &mut coordinator_task => {
            health_state.mark_failed();
            shutdown_token.cancel();
            if let Err(e) = result {
                if e.is_panic() {
                    actor_metrics.record_panic(ActorType::Coordinator);
                    prom::record_actor_panic(ActorType::Coordinator.as_str());
                }
            }
            error!("Coordinator stopped unexpectedly");
            return Err("Coordinator stopped unexpectedly".into());
        }
        _ = &mut server_task => {
            health_state.mark_failed();
            coordinator.cancel();
            error!("HTTP server stopped unexpectedly");
            return Err("HTTP server stopped unexpectedly".into());
        }
    }

    // Mark as not ready immediately so load balancers stop sending traffic
    health_state.set_not_ready();

    if let Err(e) = coordinator.shutdown().await {
        warn!(error = %e, "Coordinator shutdown error");
    }
    shutdown_token.cancel();

    wait_for_task("HTTP server", server_task, &config).await;
    wait_for_coordinator(coordinator_task, &actor_metrics, &config).await;

    info!(
        matches_made = actor_metrics.matches_made(),
        messages_relayed = actor_metrics.messages_relayed(),
        "Interest Relay shutdown complete"
    );
    Ok(())
}

/// Wait up to the grace period for a task to finish.
async fn wait_for_task(name: &str, task: JoinHandle<()>, config: &Config) {
    if tokio::time::timeout(config.shutdown_grace(), task).await.is_err() {
        warn!(
            task = name,
            grace_seconds = config.shutdown_grace_seconds,
            "Task did not stop within grace period"
        );
    }
}

/// Wait for the coordinator to stop, recording a panic if it had one.
async fn wait_for_coordinator(
    task: JoinHandle<()>,
    metrics: &Arc<ActorMetrics>,
    config: &Config,
) {
    match tokio::time::timeout(config.shutdown_grace(), task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_panic() => {
            metrics.record_panic(ActorType::Coordinator);
            prom::record_actor_panic(ActorType::Coordinator.as_str());
        }
        Ok(Err(e)) => warn!(error = %e, "Coordinator task failed"),
        Err(_) => warn!(
            grace_seconds = config.shutdown_grace_seconds,
            "Coordinator did not stop within grace period"
        ),
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
