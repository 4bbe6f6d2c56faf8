//! Domain Layer - Core session types and business rules.
//!
//! This layer holds the market data records, the session lifecycle state
//! machine, the subscription registry, and the client error taxonomy.
//! Nothing here performs I/O.

/// Client error taxonomy.
pub mod error;

/// Session lifecycle state machine.
pub mod session;

/// Market data records (quotes, last prices, trades, snapshot rows).
pub mod streaming;

/// Ticker subscription registry.
pub mod subscription;
