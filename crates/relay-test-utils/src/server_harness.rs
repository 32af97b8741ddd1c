//! Test server harness for E2E testing
//!
//! Provides `TestRelayServer` for spawning real relay instances in tests.

use crate::ws_client::TestClient;

use metrics_exporter_prometheus::PrometheusBuilder;
use relay_service::actors::{ActorMetrics, CoordinatorActor, CoordinatorActorHandle};
use relay_service::config::Config;
use relay_service::observability::HealthState;
use relay_service::routes::{self, AppState};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Test harness for spawning the relay in E2E tests.
///
/// # Example
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_health_e2e() -> Result<(), anyhow::Error> {
///     let server = TestRelayServer::spawn().await?;
///
///     let response = reqwest::get(format!("{}/health", server.url())).await?;
///
///     assert_eq!(response.status(), 200);
///     Ok(())
/// }
/// ```
pub struct TestRelayServer {
    addr: SocketAddr,
    config: Config,
    coordinator: CoordinatorActorHandle,
    metrics: Arc<ActorMetrics>,
    health: Arc<HealthState>,
    _handle: JoinHandle<()>,
}

impl TestRelayServer {
    /// Spawn a relay with default configuration.
    pub async fn spawn() -> Result<Self, anyhow::Error> {
        Self::spawn_with(HashMap::new()).await
    }

    /// Spawn a relay with configuration overrides (e.g.
    /// `RELAY_OUTBOUND_QUEUE`).
    ///
    /// The server will:
    /// - Bind to a random available port (127.0.0.1:0)
    /// - Spawn its own coordinator
    /// - Start the HTTP server in the background, marked ready
    pub async fn spawn_with(overrides: HashMap<String, String>) -> Result<Self, anyhow::Error> {
        let mut vars = HashMap::from([
            ("RELAY_BIND_ADDRESS".to_string(), "127.0.0.1:0".to_string()),
            ("RELAY_ID".to_string(), "relay-test".to_string()),
        ]);
        vars.extend(overrides);

        let config = Config::from_vars(&vars)
            .map_err(|e| anyhow::anyhow!("Failed to create config: {}", e))?;

        let metrics = ActorMetrics::new();
        let (coordinator, _coordinator_task) = CoordinatorActor::spawn(
            config.relay_id.clone(),
            config.coordinator_queue,
            CancellationToken::new(),
            Arc::clone(&metrics),
        );

        let state = Arc::new(AppState {
            coordinator: coordinator.clone(),
            config: config.clone(),
            metrics: Arc::clone(&metrics),
            shutdown_token: coordinator.child_token(),
        });

        let health = Arc::new(HealthState::new());

        // A per-server recorder handle; nothing is installed globally
        let metrics_handle = PrometheusBuilder::new().build_recorder().handle();

        // Build routes using the relay's real route builder
        let app = routes::build_routes(state, Arc::clone(&health), metrics_handle);

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("Test server error: {}", e);
            }
        });

        health.set_ready();

        Ok(Self {
            addr,
            config,
            coordinator,
            metrics,
            health,
            _handle: handle,
        })
    }

    /// Get the base HTTP URL of the test server.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Get the WebSocket URL clients connect to.
    pub fn ws_url(&self) -> String {
        format!("ws://{}{}", self.addr, self.config.ws_path)
    }

    /// Get the socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get reference to the server configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the coordinator handle (status and partner queries).
    pub fn coordinator(&self) -> &CoordinatorActorHandle {
        &self.coordinator
    }

    /// Get the shared actor metrics.
    pub fn metrics(&self) -> &Arc<ActorMetrics> {
        &self.metrics
    }

    /// Get the health state.
    pub fn health(&self) -> &Arc<HealthState> {
        &self.health
    }

    /// Open a WebSocket connection to this server.
    pub async fn connect(&self) -> Result<TestClient, anyhow::Error> {
        TestClient::connect(&self.ws_url()).await
    }

    /// Wait until the coordinator reports `expected` registered sessions.
    ///
    /// Registration is asynchronous from the client's point of view; tests
    /// that register unmatched sessions use this to sequence their steps.
    pub async fn wait_for_sessions(&self, expected: usize) -> Result<(), anyhow::Error> {
        for _ in 0..200 {
            let status = self
                .coordinator
                .get_status()
                .await
                .map_err(|e| anyhow::anyhow!("Coordinator status failed: {}", e))?;
            if status.session_count == expected {
                return Ok(());
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        anyhow::bail!("session count never reached {expected}")
    }
}

impl Drop for TestRelayServer {
    fn drop(&mut self) {
        // Abort the HTTP server and stop the coordinator (closes every session)
        self._handle.abort();
        self.coordinator.cancel();
    }
}
