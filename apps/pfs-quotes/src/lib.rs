#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! PFS Quotes - Streaming Market Data Client
//!
//! A WebSocket client for the PFS quote server. It keeps one session open,
//! reconnects with backoff when the transport drops, restores the ticker
//! subscription set after every reconnect, and answers one-shot snapshot
//! queries.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core types and rules, no I/O
//!   - `streaming`: Market data records (quotes, last prices, trades)
//!   - `session`: Session lifecycle state machine
//!   - `subscription`: Desired ticker set
//!   - `error`: Client error taxonomy
//!
//! - **Application**: How events leave the client
//!   - `ports`: `QuoteListener` observer interface
//!   - `services`: Event bus with ordered fan-out
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `pfs`: WebSocket codec, heartbeat, reconnect, session driver, client
//!   - `config`: Configuration from code or environment
//!   - `metrics`: Prometheus instrumentation
//!   - `telemetry`: Logging and OpenTelemetry
//!
//! # Data Flow
//!
//! ```text
//!                       commands                    frames
//! QuoteClient ──────────────────► SessionDriver ◄──────────── PFS server
//!   │  set_tickers                   │     │
//!   │  query_snapshot ◄── oneshot ───┘     │ events
//!   │                                      ▼
//!   └─ add_listener ─────────────────► EventBus ──► listeners, events()
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core session types with no I/O.
pub mod domain;

/// Application layer - Observer port and event fan-out.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Client
pub use infrastructure::pfs::{QuoteClient, SessionStatus};

// Domain types
pub use domain::error::ClientError;
pub use domain::session::SessionState;
pub use domain::streaming::{LastPrice, MarketDatum, Ping, Quote, ResultMessage, Trade};
pub use domain::subscription::{SubscriptionChanges, Ticker};

// Observers
pub use application::ports::QuoteListener;
pub use application::services::{ClientEvent, EventBus, ListenerId};

// Configuration
pub use infrastructure::config::{AccessId, ClientConfig, ConfigError, ConnectionSettings};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
