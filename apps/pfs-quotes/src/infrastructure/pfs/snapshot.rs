//! Snapshot Query Engine
//!
//! Correlates one outstanding `snapshot` request with the `marketdata`
//! frame that answers it. Owned by the session driver.
//!
//! # Lifecycle
//!
//! ```text
//! Queued ──(session open)──► Sent ──(marketdata)──► Completed
//!   ▲                          │
//!   └──── connection lost ─────┘
//! ```
//!
//! Timeouts and cancellation are enforced by the caller awaiting the
//! reply; a request whose caller has gone away is discarded here.

use std::time::Instant;

use tokio::sync::oneshot;

use crate::domain::error::ClientError;
use crate::domain::streaming::MarketDatum;

/// Reply channel for a snapshot query.
pub type SnapshotReply = oneshot::Sender<Result<Vec<MarketDatum>, ClientError>>;

/// Where the outstanding request stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotPhase {
    /// Waiting for an open session.
    Queued,
    /// Written to the socket; awaiting `marketdata`.
    Sent,
}

#[derive(Debug)]
struct PendingSnapshot {
    tickers: Vec<String>,
    reply: SnapshotReply,
    phase: SnapshotPhase,
    queued_at: Instant,
}

impl PendingSnapshot {
    fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }
}

/// Single-slot request tracker.
#[derive(Debug, Default)]
pub struct SnapshotEngine {
    pending: Option<PendingSnapshot>,
}

impl SnapshotEngine {
    /// Create an idle engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a new request.
    ///
    /// A previous request whose caller stopped waiting is replaced. A live
    /// one makes the new request fail with [`ClientError::SnapshotInProgress`].
    pub fn begin(&mut self, tickers: Vec<String>, reply: SnapshotReply) {
        if let Some(existing) = &self.pending {
            if !existing.is_abandoned() {
                tracing::warn!("Rejecting snapshot query while another is in flight");
                let _ = reply.send(Err(ClientError::SnapshotInProgress));
                return;
            }
            tracing::debug!(
                waited_ms = u64::try_from(existing.queued_at.elapsed().as_millis()).unwrap_or(u64::MAX),
                "Discarding abandoned snapshot query"
            );
        }

        self.pending = Some(PendingSnapshot {
            tickers,
            reply,
            phase: SnapshotPhase::Queued,
            queued_at: Instant::now(),
        });
    }

    /// Tickers of a queued request that should be written now; marks it sent.
    ///
    /// Returns `None` when there is nothing to send. Abandoned requests are dropped.
    pub fn take_unsent(&mut self) -> Option<Vec<String>> {
        if self.pending.as_ref().is_some_and(PendingSnapshot::is_abandoned) {
            self.pending = None;
            return None;
        }
        let pending = self.pending.as_mut()?;
        if pending.phase != SnapshotPhase::Queued {
            return None;
        }
        pending.phase = SnapshotPhase::Sent;
        Some(pending.tickers.clone())
    }

    /// The transport dropped: a sent request must be re-sent after reopen.
    pub fn connection_lost(&mut self) {
        if let Some(pending) = self.pending.as_mut() {
            pending.phase = SnapshotPhase::Queued;
        }
    }

    /// Resolve the sent request with a `marketdata` payload.
    ///
    /// Rows are filtered to the requested tickers, first row per ticker wins.
    /// Returns the number of rows delivered, or `None` if nothing was waiting.
    pub fn complete(&mut self, rows: Vec<MarketDatum>) -> Option<usize> {
        if self.phase() != Some(SnapshotPhase::Sent) {
            tracing::warn!(rows = rows.len(), "Unsolicited market data ignored");
            return None;
        }
        let pending = self.pending.take()?;

        let mut delivered: Vec<MarketDatum> = Vec::with_capacity(pending.tickers.len());
        for row in rows {
            if pending.tickers.contains(&row.ticker)
                && !delivered.iter().any(|d| d.ticker == row.ticker)
            {
                delivered.push(row);
            }
        }

        let count = delivered.len();
        if count < pending.tickers.len() {
            tracing::debug!(
                requested = pending.tickers.len(),
                returned = count,
                "Partial snapshot result"
            );
        }
        let _ = pending.reply.send(Ok(delivered));
        Some(count)
    }

    /// Fail the outstanding request, if any.
    pub fn fail(&mut self, error: ClientError) {
        if let Some(pending) = self.pending.take() {
            let _ = pending.reply.send(Err(error));
        }
    }

    /// Phase of the outstanding request.
    #[must_use]
    pub fn phase(&self) -> Option<SnapshotPhase> {
        self.pending.as_ref().map(|p| p.phase)
    }

    /// Whether a request is outstanding.
    #[must_use]
    pub const fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}
