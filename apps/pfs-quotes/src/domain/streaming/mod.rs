//! Market Data Records
//!
//! Value types delivered to observers: streaming quotes, last prices,
//! trades, heartbeat replies, server result notices, and snapshot rows.
//! These types are wire-agnostic; the protocol adapter converts into them.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Display format used for timestamps in human-readable output.
const DISPLAY_TIME_FORMAT: &str = "%d.%m.%Y %H:%M:%S";

// =============================================================================
// Streaming Updates
// =============================================================================

/// A two-sided price update for one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    /// Instrument identifier (e.g. `"gold"`, `"JPYRUB"`).
    pub ticker: String,
    /// Bid price.
    pub bid: Decimal,
    /// Ask price.
    pub ask: Decimal,
    /// Server-side UTC timestamp of the update.
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    /// Difference between ask and bid.
    #[must_use]
    pub fn spread(&self) -> Decimal {
        self.ask - self.bid
    }

    /// Midpoint between bid and ask.
    #[must_use]
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }
}

impl fmt::Display for Quote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {}, {}, {}",
            self.ticker,
            self.bid,
            self.ask,
            self.timestamp.format(DISPLAY_TIME_FORMAT)
        )
    }
}

/// Most recent traded price for an instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastPrice {
    /// Instrument identifier.
    pub ticker: String,
    /// Last traded price.
    pub price: Decimal,
    /// Server-side UTC timestamp.
    pub timestamp: DateTime<Utc>,
}

/// An executed trade print.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    /// Instrument identifier.
    pub ticker: String,
    /// Execution price.
    pub price: Decimal,
    /// Executed volume, when the server reports one.
    pub volume: Option<Decimal>,
    /// Server-side UTC timestamp.
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Session Notices
// =============================================================================

/// Heartbeat reply received from the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// Ping identifier echoed by the server.
    pub ping_id: String,
    /// Round-trip time, when the reply matches the last ping sent.
    pub round_trip: Option<Duration>,
    /// Local receive time.
    pub received_at: DateTime<Utc>,
}

/// Result notice for a previously issued request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultMessage {
    /// Numeric result code; zero means success.
    pub code: i32,
    /// Optional human-readable description.
    pub text: String,
}

impl ResultMessage {
    /// Whether the server reported success.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code == 0
    }
}

impl fmt::Display for ResultMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.text.is_empty() {
            write!(f, "result {}", self.code)
        } else {
            write!(f, "result {}: {}", self.code, self.text)
        }
    }
}

// =============================================================================
// Snapshot Rows
// =============================================================================

/// Point-in-time market data for one ticker, returned by a snapshot query.
///
/// Every price field is optional: the server only fills in what it has.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketDatum {
    /// Instrument identifier.
    pub ticker: String,
    /// Bid price.
    pub bid: Option<Decimal>,
    /// Ask price.
    pub ask: Option<Decimal>,
    /// Last traded price.
    pub last: Option<Decimal>,
    /// Server-side UTC timestamp.
    pub timestamp: Option<DateTime<Utc>>,
}

impl MarketDatum {
    /// Row with only a ticker and no prices.
    #[must_use]
    pub fn empty(ticker: impl Into<String>) -> Self {
        Self {
            ticker: ticker.into(),
            bid: None,
            ask: None,
            last: None,
            timestamp: None,
        }
    }

    /// Whether the server supplied any price at all.
    #[must_use]
    pub const fn has_prices(&self) -> bool {
        self.bid.is_some() || self.ask.is_some() || self.last.is_some()
    }
}

// =============================================================================
// Tests
// =============================================================================
