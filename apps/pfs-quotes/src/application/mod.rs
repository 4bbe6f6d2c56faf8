//! Application Layer - Observer contract and event fan-out.
//!
//! This layer defines how events leave the client: the listener port
//! callers implement, and the bus that delivers to every listener.

/// Observer port implemented by callers.
pub mod ports;

/// Event bus service.
pub mod services;
