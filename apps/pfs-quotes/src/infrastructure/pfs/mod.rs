//! PFS WebSocket Adapter
//!
//! Client side of the PFS quote protocol:
//!
//! - **messages / codec**: JSON wire format, one object or an array per frame
//! - **reconnect / heartbeat**: backoff policy and liveness checks
//! - **snapshot**: the single outstanding snapshot query
//! - **session**: the driver task that owns the socket
//! - **client**: the public `QuoteClient` facade

pub mod client;
pub mod codec;
pub mod heartbeat;
pub mod messages;
pub mod reconnect;
pub mod session;
pub mod snapshot;

pub use client::QuoteClient;
pub use codec::{CodecError, FrameCodec, JsonCodec};
pub use heartbeat::{
    HeartbeatConfig, HeartbeatError, HeartbeatEvent, HeartbeatManager, HeartbeatState,
};
pub use messages::{ClientRequest, ServerMessage, SessionMode, parse_utcdt};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectPolicy};
pub use session::{SessionCommand, SessionContext, SessionDriver, SessionStatus};
pub use snapshot::{SnapshotEngine, SnapshotPhase, SnapshotReply};
