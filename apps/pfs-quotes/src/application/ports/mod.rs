//! Port Interfaces
//!
//! The observer contract the client publishes to. Applications implement
//! [`QuoteListener`] and register it with the client; every method has a
//! no-op default so a listener only overrides what it cares about.
//!
//! ## Delivery guarantees
//!
//! - Callbacks run on the session task, in the order frames arrive.
//!   `on_disposed` runs on the thread that stopped the client, after any
//!   callback already in progress has returned.
//! - Listeners are called in registration order.
//! - A slow callback delays later events; hand heavy work off to a channel.

use crate::domain::error::ClientError;
use crate::domain::streaming::{LastPrice, Ping, Quote, ResultMessage, Trade};

/// Observer of session and market data events.
#[cfg_attr(test, mockall::automock)]
pub trait QuoteListener: Send + Sync {
    /// A connection attempt is starting.
    fn on_start_connect(&self) {}

    /// The transport is up; the session open request follows.
    fn on_connected(&self) {}

    /// The server acknowledged a session.
    fn on_opened(&self, _session_id: &str) {}

    /// Extra tickers to subscribe after the session `session_id` opened.
    ///
    /// Called right after [`QuoteListener::on_opened`]. Returned tickers are
    /// merged into the subscription set; `None` leaves it unchanged.
    fn resubscribe_tickers(&self, _session_id: &str) -> Option<Vec<String>> {
        None
    }

    /// The transport dropped or a connection attempt failed.
    fn on_connection_lost(&self, _error: &ClientError) {}

    /// Reconnect attempts are exhausted; the session is over.
    fn on_reconnect_failed(&self, _error: &ClientError) {}

    /// The server finished the session because of a newer login.
    fn on_session_finished_by_new_login(&self) {}

    /// The client was stopped. Delivered exactly once, last.
    fn on_disposed(&self) {}

    /// A streaming quote.
    fn on_quote(&self, _quote: &Quote) {}

    /// A last-price update.
    fn on_last_price(&self, _last_price: &LastPrice) {}

    /// A trade print.
    fn on_trade(&self, _trade: &Trade) {}

    /// A heartbeat reply.
    fn on_ping(&self, _ping: &Ping) {}

    /// A result notice from the server.
    fn on_result(&self, _result: &ResultMessage) {}

    /// A frame or message could not be decoded and was skipped.
    fn on_decode_error(&self, _error: &ClientError) {}
}
