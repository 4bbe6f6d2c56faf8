//! Application Services
//!
//! Services that sit between the session driver and the caller.
//!
//! - `EventBus`: observer registry with ordered fan-out and a broadcast stream

mod event_bus;

pub use event_bus::{ClientEvent, DEFAULT_EVENT_CAPACITY, EventBus, ListenerId};
