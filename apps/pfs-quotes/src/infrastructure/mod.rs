//! Infrastructure Layer - Adapters and external integrations.
//!
//! The WebSocket protocol adapter plus the ambient concerns around it.

/// PFS WebSocket client (codec, heartbeat, reconnect, session driver).
pub mod pfs;

/// Configuration loading.
pub mod config;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Logging and OpenTelemetry tracing.
pub mod telemetry;
