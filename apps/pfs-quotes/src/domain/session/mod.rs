//! Session Lifecycle
//!
//! Pure state machine for one logical quote session. The session survives
//! transport reconnects: a dropped socket moves it back to `Connecting`,
//! and every fresh `init` acknowledgement opens a new server-side session
//! with a new id.
//!
//! # Transitions
//!
//! ```text
//!            start             transport up          init(sid)
//! Closed ───────────► Connecting ───────────► Opening ──────────► Open
//!                        ▲                       │                 │
//!                        └──── connection lost ──┴─────────────────┘
//!
//! any non-terminal state ── finish ──► Finished (terminal, no reconnect)
//! any state ── stop / give up ──► Closed
//! ```

use std::fmt;

use thiserror::Error;

// =============================================================================
// State
// =============================================================================

/// Lifecycle state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Not running: never started, stopped, or given up.
    #[default]
    Closed,

    /// Establishing (or re-establishing) the transport.
    Connecting,

    /// Transport is up; open request sent, awaiting the server's `init`.
    Opening,

    /// Server acknowledged the session; market data flows.
    Open,

    /// The server finished the session because of a newer login. Terminal.
    Finished,
}

impl SessionState {
    /// Whether market data may be delivered in this state.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Whether the session ended for good on the server's request.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        matches!(self, Self::Finished)
    }

    /// Whether a transport is being set up or is live.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Opening | Self::Open)
    }

    /// Stable lowercase name, used in logs and metrics labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Connecting => "connecting",
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Finished => "finished",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Rejected session transitions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The event is not valid in the current state.
    #[error("cannot handle {event} while session is {from}")]
    InvalidTransition {
        /// State at the time of the event.
        from: SessionState,
        /// Name of the rejected event.
        event: &'static str,
    },

    /// A second `init` arrived for a session that is already open.
    #[error("session already open as {current}, ignoring init for {received}")]
    AlreadyOpen {
        /// Id of the session that is open.
        current: String,
        /// Id carried by the duplicate acknowledgement.
        received: String,
    },

    /// The server acknowledged with an empty session id.
    #[error("server acknowledged the session with an empty id")]
    EmptySessionId,
}

// =============================================================================
// Session Manager
// =============================================================================

/// Tracks session state and the current server-assigned session id.
///
/// Owned by the task that drives the connection; it performs no I/O.
#[derive(Debug, Default)]
pub struct SessionManager {
    state: SessionState,
    session_id: Option<String>,
    opened_count: u64,
}

impl SessionManager {
    /// Create a manager in the `Closed` state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Server-assigned id of the open session, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Whether the session is open.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.state.is_open()
    }

    /// Number of times a session has been opened (first open plus reopens).
    #[must_use]
    pub const fn opened_count(&self) -> u64 {
        self.opened_count
    }

    /// A connection attempt is starting.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is finished or a transport is already up.
    pub fn begin_connect(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Closed | SessionState::Connecting => {
                self.state = SessionState::Connecting;
                Ok(())
            }
            from => Err(SessionError::InvalidTransition {
                from,
                event: "connect",
            }),
        }
    }

    /// The transport is up and the open request is about to be sent.
    ///
    /// # Errors
    ///
    /// Returns an error unless the session is `Connecting`.
    pub fn transport_connected(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Connecting {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                event: "transport connected",
            });
        }
        self.state = SessionState::Opening;
        Ok(())
    }

    /// The server acknowledged the session with `session_id`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::AlreadyOpen`] for a duplicate acknowledgement
    /// and [`SessionError::InvalidTransition`] when no open request is pending.
    pub fn open(&mut self, session_id: impl Into<String>) -> Result<(), SessionError> {
        let session_id = session_id.into();
        match self.state {
            SessionState::Opening => {
                if session_id.is_empty() {
                    return Err(SessionError::EmptySessionId);
                }
                self.state = SessionState::Open;
                self.session_id = Some(session_id);
                self.opened_count += 1;
                Ok(())
            }
            SessionState::Open => Err(SessionError::AlreadyOpen {
                current: self.session_id.clone().unwrap_or_default(),
                received: session_id,
            }),
            from => Err(SessionError::InvalidTransition {
                from,
                event: "init",
            }),
        }
    }

    /// The transport dropped.
    ///
    /// Returns `true` when the session should reconnect, which is the case
    /// for every state that had a transport in progress.
    pub fn connection_lost(&mut self) -> bool {
        if !self.state.is_active() {
            return false;
        }
        self.state = SessionState::Connecting;
        self.session_id = None;
        true
    }

    /// The server finished the session because of a newer login.
    pub fn finish(&mut self) {
        self.state = SessionState::Finished;
        self.session_id = None;
    }

    /// The session is stopped or abandoned.
    ///
    /// A finished session stays finished so the terminal reason is preserved.
    /// Returns `true` if the state changed.
    pub fn close(&mut self) -> bool {
        if matches!(self.state, SessionState::Closed | SessionState::Finished) {
            return false;
        }
        self.state = SessionState::Closed;
        self.session_id = None;
        true
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn opened(id: &str) -> SessionManager {
        let mut session = SessionManager::new();
        session.begin_connect().unwrap();
        session.transport_connected().unwrap();
        session.open(id).unwrap();
        session
    }

    #[test]
    fn starts_closed() {
        let session = SessionManager::new();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.session_id().is_none());
        assert_eq!(session.opened_count(), 0);
    }

    #[test]
    fn full_open_sequence() {
        let session = opened("S1");
        assert!(session.is_open());
        assert_eq!(session.session_id(), Some("S1"));
        assert_eq!(session.opened_count(), 1);
    }

    #[test]
    fn duplicate_init_is_rejected_without_changing_session() {
        let mut session = opened("S1");

        let err = session.open("S2").unwrap_err();

        assert_eq!(
            err,
            SessionError::AlreadyOpen {
                current: "S1".to_string(),
                received: "S2".to_string(),
            }
        );
        assert_eq!(session.session_id(), Some("S1"));
        assert_eq!(session.opened_count(), 1);
    }

    #[test]
    fn init_before_transport_is_invalid() {
        let mut session = SessionManager::new();
        session.begin_connect().unwrap();

        let err = session.open("S1").unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidTransition {
                from: SessionState::Connecting,
                ..
            }
        ));
    }

    #[test]
    fn empty_session_id_is_rejected() {
        let mut session = SessionManager::new();
        session.begin_connect().unwrap();
        session.transport_connected().unwrap();

        assert_eq!(session.open(""), Err(SessionError::EmptySessionId));
        assert_eq!(session.state(), SessionState::Opening);
    }

    #[test]
    fn connection_lost_reconnects_and_reopens_with_new_id() {
        let mut session = opened("S1");

        assert!(session.connection_lost());
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(session.session_id().is_none());

        session.begin_connect().unwrap();
        session.transport_connected().unwrap();
        session.open("S2").unwrap();
        assert_eq!(session.session_id(), Some("S2"));
        assert_eq!(session.opened_count(), 2);
    }

    #[test]
    fn connection_lost_while_opening_reconnects() {
        let mut session = SessionManager::new();
        session.begin_connect().unwrap();
        session.transport_connected().unwrap();

        assert!(session.connection_lost());
        assert_eq!(session.state(), SessionState::Connecting);
    }

    #[test]
    fn finished_session_never_reconnects() {
        let mut session = opened("S1");
        session.finish();

        assert!(session.state().is_finished());
        assert!(!session.connection_lost());
        assert!(session.begin_connect().is_err());
        assert!(!session.close());
        assert!(session.state().is_finished());
    }

    #[test]
    fn closed_session_does_not_reconnect() {
        let mut session = opened("S1");
        assert!(session.close());
        assert!(!session.connection_lost());
        assert!(!session.close());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn begin_connect_rejected_while_open() {
        let mut session = opened("S1");
        assert!(session.begin_connect().is_err());
    }
}
