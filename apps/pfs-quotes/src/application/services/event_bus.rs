//! Event Bus
//!
//! Fans client events out to registered [`QuoteListener`]s (in registration
//! order) and to a tokio broadcast channel for consumers that prefer a
//! stream. After [`EventBus::dispose`] nothing else is delivered.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{ReentrantMutex, RwLock};
use tokio::sync::broadcast;

use crate::application::ports::QuoteListener;
use crate::domain::error::ClientError;
use crate::domain::streaming::{LastPrice, Ping, Quote, ResultMessage, Trade};

/// Default capacity of the broadcast event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1_024;

// =============================================================================
// Events
// =============================================================================

/// Every event the client publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A connection attempt is starting.
    StartConnect,
    /// The transport is up.
    Connected,
    /// The server acknowledged a session.
    Opened {
        /// Server-assigned session id.
        session_id: String,
    },
    /// The transport dropped or a connection attempt failed.
    ConnectionLost {
        /// What went wrong.
        error: ClientError,
    },
    /// Reconnect attempts are exhausted.
    ReconnectFailed {
        /// Terminal error.
        error: ClientError,
    },
    /// The server finished the session because of a newer login.
    SessionFinishedByNewLogin,
    /// The client was stopped. Always the last event.
    Disposed,
    /// A streaming quote.
    Quote(Quote),
    /// A last-price update.
    LastPrice(LastPrice),
    /// A trade print.
    Trade(Trade),
    /// A heartbeat reply.
    Ping(Ping),
    /// A result notice.
    Result(ResultMessage),
    /// A frame or message was skipped because it could not be decoded.
    DecodeError {
        /// Decode failure.
        error: ClientError,
    },
}

impl ClientEvent {
    /// Short event name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::StartConnect => "start_connect",
            Self::Connected => "connected",
            Self::Opened { .. } => "opened",
            Self::ConnectionLost { .. } => "connection_lost",
            Self::ReconnectFailed { .. } => "reconnect_failed",
            Self::SessionFinishedByNewLogin => "session_finished_by_new_login",
            Self::Disposed => "disposed",
            Self::Quote(_) => "quote",
            Self::LastPrice(_) => "last_price",
            Self::Trade(_) => "trade",
            Self::Ping(_) => "ping",
            Self::Result(_) => "result",
            Self::DecodeError { .. } => "decode_error",
        }
    }

    fn deliver(&self, listener: &dyn QuoteListener) {
        match self {
            Self::StartConnect => listener.on_start_connect(),
            Self::Connected => listener.on_connected(),
            Self::Opened { session_id } => listener.on_opened(session_id),
            Self::ConnectionLost { error } => listener.on_connection_lost(error),
            Self::ReconnectFailed { error } => listener.on_reconnect_failed(error),
            Self::SessionFinishedByNewLogin => listener.on_session_finished_by_new_login(),
            Self::Disposed => listener.on_disposed(),
            Self::Quote(quote) => listener.on_quote(quote),
            Self::LastPrice(last_price) => listener.on_last_price(last_price),
            Self::Trade(trade) => listener.on_trade(trade),
            Self::Ping(ping) => listener.on_ping(ping),
            Self::Result(result) => listener.on_result(result),
            Self::DecodeError { error } => listener.on_decode_error(error),
        }
    }
}

// =============================================================================
// Event Bus
// =============================================================================

/// Handle returned by [`EventBus::register`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Observer registry plus broadcast stream.
pub struct EventBus {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn QuoteListener>)>>,
    next_id: AtomicU64,
    events_tx: broadcast::Sender<ClientEvent>,
    disposed: AtomicBool,
    // Held for a whole delivery so `Disposed` cannot overtake an event in flight.
    delivery: ReentrantMutex<()>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .field("stream_receivers", &self.events_tx.receiver_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    /// Create a bus whose broadcast stream buffers `capacity` events per receiver.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            events_tx: broadcast::channel(capacity.max(1)).0,
            disposed: AtomicBool::new(false),
            delivery: ReentrantMutex::new(()),
        }
    }

    /// Register a listener. It receives events published from now on.
    pub fn register(&self, listener: Arc<dyn QuoteListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    /// Unregister a listener. Returns `false` if it was not registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        before != listeners.len()
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Subscribe to the event stream.
    ///
    /// A receiver that falls more than the channel capacity behind observes
    /// `RecvError::Lagged` and skips ahead.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events_tx.subscribe()
    }

    /// Whether [`EventBus::dispose`] has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Deliver `event` to every listener, then to the stream.
    ///
    /// Events published after disposal are dropped. A concurrent
    /// [`EventBus::dispose`] waits until this delivery has finished.
    pub fn publish(&self, event: ClientEvent) {
        let _delivery = self.delivery.lock();
        if self.is_disposed() {
            tracing::trace!(event = event.name(), "Dropping event after dispose");
            return;
        }
        self.deliver(event);
    }

    /// Ask every listener for extra tickers after `session_id` opened.
    ///
    /// Lists are concatenated in registration order; duplicates are left for
    /// the subscription registry to drop.
    #[must_use]
    pub fn collect_resubscriptions(&self, session_id: &str) -> Vec<String> {
        self.snapshot_listeners()
            .iter()
            .filter_map(|listener| listener.resubscribe_tickers(session_id))
            .flatten()
            .collect()
    }

    /// Mark the bus disposed and deliver [`ClientEvent::Disposed`].
    ///
    /// Only the first call delivers; returns whether this call did. Called
    /// from inside a callback, the event being delivered goes no further.
    pub fn dispose(&self) -> bool {
        let _delivery = self.delivery.lock();
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.deliver(ClientEvent::Disposed);
        true
    }

    fn deliver(&self, event: ClientEvent) {
        let is_final = event == ClientEvent::Disposed;
        // Callbacks run without the listener lock so listeners may (un)register from inside one.
        for listener in self.snapshot_listeners() {
            if !is_final && self.is_disposed() {
                return;
            }
            event.deliver(listener.as_ref());
        }
        if !is_final && self.is_disposed() {
            return;
        }
        // No receivers is fine.
        let _ = self.events_tx.send(event);
    }

    fn snapshot_listeners(&self) -> Vec<Arc<dyn QuoteListener>> {
        self.listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::MockQuoteListener;
    use mockall::Sequence;
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl QuoteListener for Recorder {
        fn on_opened(&self, session_id: &str) {
            self.log.lock().push(format!("{}:opened:{session_id}", self.name));
        }

        fn on_disposed(&self) {
            self.log.lock().push(format!("{}:disposed", self.name));
        }
    }

    #[test]
    fn fan_out_follows_registration_order() {
        let bus = EventBus::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            bus.register(Arc::new(Recorder {
                name,
                log: Arc::clone(&log),
            }));
        }

        bus.publish(ClientEvent::Opened {
            session_id: "S1".to_string(),
        });

        assert_eq!(
            *log.lock(),
            vec!["first:opened:S1", "second:opened:S1", "third:opened:S1"]
        );
    }

    #[test]
    fn unregistered_listener_stops_receiving() {
        let bus = EventBus::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = bus.register(Arc::new(Recorder {
            name: "gone",
            log: Arc::clone(&log),
        }));

        assert!(bus.unregister(id));
        assert!(!bus.unregister(id));
        bus.publish(ClientEvent::Opened {
            session_id: "S1".to_string(),
        });

        assert!(log.lock().is_empty());
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn dispose_delivers_once_and_silences_bus() {
        let bus = EventBus::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.register(Arc::new(Recorder {
            name: "l",
            log: Arc::clone(&log),
        }));

        assert!(bus.dispose());
        assert!(!bus.dispose());
        bus.publish(ClientEvent::Opened {
            session_id: "late".to_string(),
        });

        assert_eq!(*log.lock(), vec!["l:disposed"]);
        assert!(bus.is_disposed());
    }

    /// Parks inside `on_opened` until released.
    struct Gate {
        entered: std::sync::mpsc::Sender<()>,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl QuoteListener for Gate {
        fn on_opened(&self, _session_id: &str) {
            let _ = self.entered.send(());
            let _ = self
                .release
                .lock()
                .recv_timeout(std::time::Duration::from_secs(5));
        }
    }

    #[test]
    fn dispose_waits_for_event_in_flight() {
        let bus = Arc::new(EventBus::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        bus.register(Arc::new(Gate {
            entered: entered_tx,
            release: Mutex::new(release_rx),
        }));
        bus.register(Arc::new(Recorder {
            name: "b",
            log: Arc::clone(&log),
        }));

        let publisher = {
            let bus = Arc::clone(&bus);
            std::thread::spawn(move || {
                bus.publish(ClientEvent::Opened {
                    session_id: "S1".to_string(),
                });
            })
        };
        entered_rx.recv().unwrap();

        let disposer = {
            let bus = Arc::clone(&bus);
            std::thread::spawn(move || bus.dispose())
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        release_tx.send(()).unwrap();

        publisher.join().unwrap();
        assert!(disposer.join().unwrap());
        assert_eq!(*log.lock(), vec!["b:opened:S1", "b:disposed"]);
    }

    /// Disposes the bus from inside `on_opened`.
    struct StopOnOpen(std::sync::Weak<EventBus>);

    impl QuoteListener for StopOnOpen {
        fn on_opened(&self, _session_id: &str) {
            if let Some(bus) = self.0.upgrade() {
                bus.dispose();
            }
        }
    }

    #[tokio::test]
    async fn dispose_from_callback_ends_current_delivery() {
        let bus = Arc::new(EventBus::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut rx = bus.subscribe();
        bus.register(Arc::new(StopOnOpen(Arc::downgrade(&bus))));
        bus.register(Arc::new(Recorder {
            name: "b",
            log: Arc::clone(&log),
        }));

        bus.publish(ClientEvent::Opened {
            session_id: "S1".to_string(),
        });

        assert_eq!(*log.lock(), vec!["b:disposed"]);
        assert_eq!(rx.recv().await.unwrap(), ClientEvent::Disposed);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn resubscriptions_concatenate_in_order() {
        let bus = EventBus::default();

        let mut first = MockQuoteListener::new();
        first
            .expect_resubscribe_tickers()
            .withf(|id| id == "S7")
            .returning(|_| Some(vec!["gold".to_string(), "silver".to_string()]));
        let mut silent = MockQuoteListener::new();
        silent.expect_resubscribe_tickers().returning(|_| None);
        let mut last = MockQuoteListener::new();
        last.expect_resubscribe_tickers()
            .returning(|_| Some(vec!["JPYRUB".to_string()]));

        bus.register(Arc::new(first));
        bus.register(Arc::new(silent));
        bus.register(Arc::new(last));

        assert_eq!(
            bus.collect_resubscriptions("S7"),
            vec!["gold", "silver", "JPYRUB"]
        );
    }

    #[test]
    fn connection_events_reach_mock_in_sequence() {
        let bus = EventBus::default();
        let mut seq = Sequence::new();
        let mut listener = MockQuoteListener::new();
        listener
            .expect_on_start_connect()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        listener
            .expect_on_connected()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        listener
            .expect_on_connection_lost()
            .withf(|error| error.is_transient())
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        bus.register(Arc::new(listener));

        bus.publish(ClientEvent::StartConnect);
        bus.publish(ClientEvent::Connected);
        bus.publish(ClientEvent::ConnectionLost {
            error: ClientError::Connection("reset by peer".to_string()),
        });
    }

    #[tokio::test]
    async fn stream_receives_events_in_publish_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(ClientEvent::StartConnect);
        bus.publish(ClientEvent::Connected);
        bus.dispose();

        assert_eq!(rx.recv().await.unwrap(), ClientEvent::StartConnect);
        assert_eq!(rx.recv().await.unwrap(), ClientEvent::Connected);
        assert_eq!(rx.recv().await.unwrap(), ClientEvent::Disposed);
    }
}
