//! Metrics collection and export for Veil.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use async_trait::async_trait;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use veil_core::{Relay, RelayError, Relayed};

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "veil_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "veil_connections_active";
    pub const FRAMES_TOTAL: &str = "veil_frames_total";
    pub const FRAMES_BYTES: &str = "veil_frames_bytes";
    pub const MESSAGES_RELAYED: &str = "veil_messages_relayed_total";
    pub const RELAY_FAILURES: &str = "veil_relay_failures_total";
    pub const RELAY_INBOUND: &str = "veil_relay_inbound_total";
    pub const RELAY_DELETIONS: &str = "veil_relay_deletions_total";
    pub const ACKS_TOTAL: &str = "veil_acks_total";
    pub const ROOMS_ACTIVE: &str = "veil_rooms_active";
    pub const DISPATCH_SECONDS: &str = "veil_dispatch_seconds";
    pub const ERRORS_TOTAL: &str = "veil_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of protocol frames");
    metrics::describe_counter!(names::FRAMES_BYTES, "Total bytes of protocol frames");
    metrics::describe_counter!(
        names::MESSAGES_RELAYED,
        "Messages parked on the external relay"
    );
    metrics::describe_counter!(
        names::RELAY_FAILURES,
        "Messages delivered live only because the relay failed"
    );
    metrics::describe_counter!(
        names::RELAY_INBOUND,
        "Webhook deliveries from the relay, by outcome"
    );
    metrics::describe_counter!(
        names::RELAY_DELETIONS,
        "Relayed messages deleted after full acknowledgement"
    );
    metrics::describe_counter!(names::ACKS_TOTAL, "Acknowledgements received");
    metrics::describe_gauge!(
        names::ROOMS_ACTIVE,
        "Rooms with members on this instance"
    );
    metrics::describe_histogram!(
        names::DISPATCH_SECONDS,
        "Inbound frame dispatch latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Error frames sent, by code");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a frame crossing the socket.
pub fn record_frame(kind: &'static str, bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "type" => kind, "direction" => direction).increment(1);
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record inbound dispatch latency.
pub fn record_dispatch(seconds: f64) {
    histogram!(names::DISPATCH_SECONDS).record(seconds);
}

/// Record a message parked on the relay.
pub fn record_relayed() {
    counter!(names::MESSAGES_RELAYED).increment(1);
}

/// Record a relay failure.
pub fn record_relay_failure() {
    counter!(names::RELAY_FAILURES).increment(1);
}

/// Record a webhook delivery.
pub fn record_relay_inbound(outcome: &'static str) {
    counter!(names::RELAY_INBOUND, "outcome" => outcome).increment(1);
}

/// Record a relay deletion.
pub fn record_relay_deletion() {
    counter!(names::RELAY_DELETIONS).increment(1);
}

/// Record an acknowledgement.
pub fn record_ack() {
    counter!(names::ACKS_TOTAL).increment(1);
}

/// Update active room count.
pub fn set_active_rooms(count: usize) {
    gauge!(names::ROOMS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

/// Relay wrapper counting relayed messages, failures and deletions.
pub struct MeteredRelay<R> {
    inner: R,
}

impl<R: Relay> MeteredRelay<R> {
    /// Wrap a relay.
    #[must_use]
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R: Relay> Relay for MeteredRelay<R> {
    async fn relay(&self, room_id: &str, payload: &str) -> Result<Relayed, RelayError> {
        let result = self.inner.relay(room_id, payload).await;
        match result {
            Ok(_) => record_relayed(),
            Err(_) => record_relay_failure(),
        }
        result
    }

    async fn delete_relayed(&self, location: &str, relay_msg_id: &str) -> bool {
        let deleted = self.inner.delete_relayed(location, relay_msg_id).await;
        if deleted {
            record_relay_deletion();
        }
        deleted
    }
}
