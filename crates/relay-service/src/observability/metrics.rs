//! Prometheus metric definitions for the relay.
//!
//! All metrics follow Prometheus naming conventions:
//! - `relay_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded by enums in code:
//! - `reason`: rejection/drop reasons (< 10 values)
//! - `actor_type`: 2 values (coordinator, connection)
//!
//! Identities and interests are never used as labels.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus metrics recorder and return the handle used
/// to render `/metrics`.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("relay_command".to_string()),
            &[
                0.0001, 0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250,
            ],
        )
        .map_err(|e| format!("Failed to set command latency buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Full("relay_session_duration_seconds".to_string()),
            &[1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0],
        )
        .map_err(|e| format!("Failed to set session duration buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Registry & Match Table (Gauges)
// ============================================================================

/// Metric: `relay_sessions_active` - registered sessions.
pub fn set_sessions_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("relay_sessions_active").set(count as f64);
}

/// Metric: `relay_matches_active` - currently paired sessions / 2.
pub fn set_matches_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("relay_matches_active").set(count as f64);
}

/// Metric: `relay_connections_active` - open WebSocket connections.
pub fn set_connections_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("relay_connections_active").set(count as f64);
}

/// Metric: `relay_actor_mailbox_depth{actor_type}`.
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("relay_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Counters
// ============================================================================

/// Metric: `relay_matches_total`.
pub fn record_match() {
    counter!("relay_matches_total").increment(1);
}

/// Metric: `relay_messages_relayed_total`.
pub fn record_message_relayed() {
    counter!("relay_messages_relayed_total").increment(1);
}

/// Metric: `relay_messages_dropped_total{reason}`.
///
/// Reasons: `no_partner`, `not_registered`, `queue_full`, `partner_closed`.
pub fn record_message_dropped(reason: &str) {
    counter!("relay_messages_dropped_total", "reason" => reason.to_string()).increment(1);
}

/// Metric: `relay_registrations_rejected_total{reason}`.
pub fn record_registration_rejected(reason: &str) {
    counter!("relay_registrations_rejected_total", "reason" => reason.to_string()).increment(1);
}

/// Metric: `relay_sessions_evicted_total` - slow consumers disconnected.
pub fn record_session_evicted() {
    counter!("relay_sessions_evicted_total").increment(1);
}

/// Metric: `relay_actor_panics_total{actor_type}`.
///
/// ALERT: Any non-zero value indicates a bug.
pub fn record_actor_panic(actor_type: &str) {
    counter!("relay_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}

// ============================================================================
// Histograms
// ============================================================================

/// Metric: `relay_command_latency_seconds{command}` - coordinator time per
/// command.
pub fn record_command_latency(command: &str, duration: Duration) {
    histogram!("relay_command_latency_seconds", "command" => command.to_string())
        .record(duration.as_secs_f64());
}

/// Metric: `relay_session_duration_seconds` - registration to teardown.
pub fn record_session_duration(duration: Duration) {
    histogram!("relay_session_duration_seconds").record(duration.as_secs_f64());
}
