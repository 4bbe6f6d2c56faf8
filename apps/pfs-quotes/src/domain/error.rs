//! Client Error Taxonomy
//!
//! Errors surfaced to callers and observers. Payloads are owned strings so
//! the same error value can be fanned out to every observer and stored as
//! the terminal reason of a finished session.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the quote client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// Transport-level failure: connect refused, socket dropped, bad handshake.
    #[error("connection error: {0}")]
    Connection(String),

    /// The server stopped answering heartbeats.
    #[error("heartbeat timeout: no reply within {0:?}")]
    HeartbeatTimeout(Duration),

    /// Reconnect attempts ran out; the session is over.
    #[error("reconnect attempts exhausted after {attempts} attempts: {last_error}")]
    ReconnectExhausted {
        /// Number of reconnect attempts made.
        attempts: u32,
        /// Description of the last connection failure.
        last_error: String,
    },

    /// The server ended this session because the same access id logged in elsewhere.
    #[error("session finished by a new login with the same access id")]
    SessionSuperseded,

    /// A server frame could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// A snapshot query received no answer in time.
    #[error("snapshot query timed out after {0:?}")]
    SnapshotTimeout(Duration),

    /// A second snapshot request reached the session while one was in flight.
    #[error("a snapshot query is already in flight")]
    SnapshotInProgress,

    /// The client was stopped while the operation was pending.
    #[error("operation cancelled: client stopped")]
    Cancelled,

    /// `start` was called on a client whose session is still running.
    #[error("client already started")]
    AlreadyStarted,

    /// The client has been stopped and can no longer be used.
    #[error("client disposed")]
    Disposed,

    /// A ticker failed validation.
    #[error("invalid ticker: {0:?}")]
    InvalidTicker(String),

    /// No async runtime was available to drive the session.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),
}

impl ClientError {
    /// Whether the session will try to recover from this error by reconnecting.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::HeartbeatTimeout(_))
    }

    /// Whether this error ends the session for good.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ReconnectExhausted { .. } | Self::SessionSuperseded | Self::Disposed
        )
    }
}
