//! Observability for the relay service.
//!
//! Instrumentation uses `#[instrument(skip_all)]` with explicit safe fields.
//! Message text and interest tags are never logged; only counts and lengths.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `relay_sessions_active` | Gauge | none |
//! | `relay_matches_active` | Gauge | none |
//! | `relay_connections_active` | Gauge | none |
//! | `relay_actor_mailbox_depth` | Gauge | `actor_type` |
//! | `relay_matches_total` | Counter | none |
//! | `relay_messages_relayed_total` | Counter | none |
//! | `relay_messages_dropped_total` | Counter | `reason` |
//! | `relay_registrations_rejected_total` | Counter | `reason` |
//! | `relay_sessions_evicted_total` | Counter | none |
//! | `relay_actor_panics_total` | Counter | `actor_type` |
//! | `relay_command_latency_seconds` | Histogram | `command` |
//! | `relay_session_duration_seconds` | Histogram | none |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
