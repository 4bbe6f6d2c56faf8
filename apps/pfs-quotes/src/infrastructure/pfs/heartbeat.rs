//! Heartbeat Manager
//!
//! Keeps an open session honest. A ticker task asks the session driver to
//! send an application `ping` carrying an increasing id every
//! `ping_interval`; the driver records replies here. If a ping stays
//! unanswered for longer than `pong_timeout` the manager reports a timeout
//! and the driver drops the connection.
//!
//! Transport-level WebSocket pongs count as liveness too.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::config::ConnectionSettings;

/// Shortest ping period the ticker accepts; smaller values are raised to it.
pub const MIN_PING_INTERVAL: Duration = Duration::from_millis(10);

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between pings.
    pub ping_interval: Duration,
    /// How long a ping may stay unanswered.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(5),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(ping_interval: Duration, pong_timeout: Duration) -> Self {
        Self {
            ping_interval,
            pong_timeout,
        }
    }

    /// Build from connection settings.
    #[must_use]
    pub const fn from_settings(settings: &ConnectionSettings) -> Self {
        Self {
            ping_interval: settings.heartbeat_interval,
            pong_timeout: settings.heartbeat_timeout,
        }
    }
}

/// Events emitted by the heartbeat manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Time to send a ping.
    SendPing,
    /// The last ping went unanswered for too long.
    Timeout(Duration),
}

/// Liveness bookkeeping shared by the manager and the session driver.
#[derive(Debug)]
pub struct HeartbeatState {
    last_reply: RwLock<Instant>,
    waiting_for_reply: AtomicBool,
    next_ping_id: AtomicU64,
    outstanding: Mutex<Option<(String, Instant)>>,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Create new heartbeat state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_reply: RwLock::new(Instant::now()),
            waiting_for_reply: AtomicBool::new(false),
            next_ping_id: AtomicU64::new(1),
            outstanding: Mutex::new(None),
        }
    }

    /// Allocate the id for a ping about to be sent and start waiting for its reply.
    ///
    /// Ids increase for the life of the state, across [`HeartbeatState::reset`].
    pub fn begin_ping(&self) -> String {
        let id = self.next_ping_id.fetch_add(1, Ordering::Relaxed).to_string();
        *self.outstanding.lock() = Some((id.clone(), Instant::now()));
        // A ping already in flight keeps its deadline.
        if !self.waiting_for_reply.swap(true, Ordering::SeqCst) {
            *self.last_reply.write() = Instant::now();
        }
        id
    }

    /// Record a server ping reply.
    ///
    /// Returns the round-trip time when `ping_id` matches the latest ping sent.
    pub fn record_reply(&self, ping_id: &str) -> Option<Duration> {
        self.mark_alive();
        let mut outstanding = self.outstanding.lock();
        match outstanding.as_ref() {
            Some((id, sent_at)) if id == ping_id => {
                let rtt = sent_at.elapsed();
                *outstanding = None;
                Some(rtt)
            }
            _ => None,
        }
    }

    /// Record a transport-level pong.
    pub fn record_transport_pong(&self) {
        self.mark_alive();
    }

    /// Whether a ping is awaiting its reply.
    #[must_use]
    pub fn is_waiting_for_reply(&self) -> bool {
        self.waiting_for_reply.load(Ordering::SeqCst)
    }

    /// Time since the last sign of life (or since the pending ping was sent).
    #[must_use]
    pub fn time_since_reply(&self) -> Duration {
        self.last_reply.read().elapsed()
    }

    /// Start fresh for a newly opened session.
    pub fn reset(&self) {
        self.mark_alive();
        *self.outstanding.lock() = None;
    }

    fn mark_alive(&self) {
        *self.last_reply.write() = Instant::now();
        self.waiting_for_reply.store(false, Ordering::SeqCst);
    }
}

/// Ticker task that drives pings and detects timeouts.
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatManager {
    /// Create a new heartbeat manager.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<HeartbeatState>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled, the receiver goes away, or a timeout is reported.
    pub async fn run(self) {
        let period = self.config.ping_interval.max(MIN_PING_INTERVAL);
        if period != self.config.ping_interval {
            tracing::warn!(
                configured_ms = u64::try_from(self.config.ping_interval.as_millis()).unwrap_or(u64::MAX),
                period_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
                "Heartbeat interval too small, using minimum"
            );
        }
        let start = tokio::time::Instant::now() + period;
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Heartbeat manager cancelled");
                    break;
                }
                _ = interval.tick() => {
                    if self.tick().await.is_break() {
                        break;
                    }
                }
            }
        }
    }

    async fn tick(&self) -> ControlFlow<()> {
        if let Err(HeartbeatError::Timeout(elapsed)) = self.check() {
            tracing::warn!(
                elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                timeout_ms = u64::try_from(self.config.pong_timeout.as_millis()).unwrap_or(u64::MAX),
                "Heartbeat timeout detected"
            );
            let _ = self.event_tx.send(HeartbeatEvent::Timeout(elapsed)).await;
            return ControlFlow::Break(());
        }

        if self.event_tx.send(HeartbeatEvent::SendPing).await.is_err() {
            tracing::debug!("Heartbeat receiver gone, stopping");
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    /// Check whether the pending ping has overrun its deadline.
    ///
    /// # Errors
    ///
    /// Returns [`HeartbeatError::Timeout`] with the elapsed wait.
    pub fn check(&self) -> Result<(), HeartbeatError> {
        if !self.state.is_waiting_for_reply() {
            return Ok(());
        }
        let elapsed = self.state.time_since_reply();
        if elapsed > self.config.pong_timeout {
            return Err(HeartbeatError::Timeout(elapsed));
        }
        Ok(())
    }
}

/// Error type for heartbeat operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeartbeatError {
    /// A ping went unanswered.
    #[error("heartbeat timeout after {0:?}")]
    Timeout(Duration),
}
