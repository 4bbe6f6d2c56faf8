//! Prometheus Metrics Module
//!
//! Client-side metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Messages**: Server messages received by kind, decode failures
//! - **Connection**: Connect attempts, reconnects, heartbeat timeouts, open sessions
//! - **Snapshots**: Query outcomes and latency
//!
//! Recording is a no-op until [`init_metrics`] installs a recorder.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder, or return the one already installed.
///
/// # Errors
///
/// Returns an error if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "pfs_quotes_messages_received_total",
        "Server messages received, by kind"
    );
    describe_counter!(
        "pfs_quotes_decode_errors_total",
        "Frames or elements skipped because they failed to decode"
    );

    describe_counter!(
        "pfs_quotes_connect_attempts_total",
        "WebSocket connection attempts"
    );
    describe_counter!(
        "pfs_quotes_reconnects_total",
        "Reconnections scheduled after a lost connection"
    );
    describe_counter!(
        "pfs_quotes_heartbeat_timeouts_total",
        "Connections dropped because heartbeats went unanswered"
    );
    describe_counter!("pfs_quotes_sessions_opened_total", "Sessions acknowledged");
    describe_gauge!(
        "pfs_quotes_session_open",
        "1 while a session is open, 0 otherwise"
    );

    describe_counter!(
        "pfs_quotes_snapshots_total",
        "Snapshot queries, by outcome"
    );
    describe_histogram!(
        "pfs_quotes_snapshot_seconds",
        "Time from snapshot query to result"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Metric labels for server message kinds.
#[derive(Debug, Clone, Copy)]
pub enum MessageKind {
    /// Session acknowledgement.
    Init,
    /// Heartbeat reply.
    Ping,
    /// Session finished by a newer login.
    Finish,
    /// Streaming quote.
    Quote,
    /// Last price.
    LastPrice,
    /// Trade print.
    Trade,
    /// Result notice.
    Result,
    /// Snapshot response.
    MarketData,
}

impl MessageKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Ping => "ping",
            Self::Finish => "finish",
            Self::Quote => "quote",
            Self::LastPrice => "last_price",
            Self::Trade => "trade",
            Self::Result => "result",
            Self::MarketData => "market_data",
        }
    }
}

/// Metric labels for snapshot query outcomes.
#[derive(Debug, Clone, Copy)]
pub enum SnapshotOutcome {
    /// Answered by the server.
    Completed,
    /// No answer within the timeout.
    TimedOut,
    /// Client stopped while waiting.
    Cancelled,
    /// Failed for another reason.
    Failed,
}

impl SnapshotOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

/// Record a decoded server message.
pub fn record_message_received(kind: MessageKind) {
    counter!(
        "pfs_quotes_messages_received_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record a skipped frame or element.
pub fn record_decode_error() {
    counter!("pfs_quotes_decode_errors_total").increment(1);
}

/// Record a connection attempt.
pub fn record_connect_attempt() {
    counter!("pfs_quotes_connect_attempts_total").increment(1);
}

/// Record a scheduled reconnection.
pub fn record_reconnect() {
    counter!("pfs_quotes_reconnects_total").increment(1);
}

/// Record a heartbeat timeout.
pub fn record_heartbeat_timeout() {
    counter!("pfs_quotes_heartbeat_timeouts_total").increment(1);
}

/// Record a session acknowledgement and mark the session open.
pub fn record_session_opened() {
    counter!("pfs_quotes_sessions_opened_total").increment(1);
    gauge!("pfs_quotes_session_open").set(1.0);
}

/// Mark the session as no longer open.
pub fn record_session_closed() {
    gauge!("pfs_quotes_session_open").set(0.0);
}

/// Record a finished snapshot query.
pub fn record_snapshot(outcome: SnapshotOutcome, elapsed: Duration) {
    counter!(
        "pfs_quotes_snapshots_total",
        "outcome" => outcome.as_str()
    )
    .increment(1);
    histogram!(
        "pfs_quotes_snapshot_seconds",
        "outcome" => outcome.as_str()
    )
    .record(elapsed.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================
