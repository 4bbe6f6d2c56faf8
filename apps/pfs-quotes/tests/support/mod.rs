//! In-process quote server and helpers shared by the integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pfs_quotes::{ClientConfig, ClientEvent, ConnectionSettings};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

/// Upper bound on any single wait in a test.
pub const WAIT: Duration = Duration::from_secs(5);

/// Access id every test client uses.
pub const ACCESS_ID: &str = "access-1";

/// Connection settings tuned for fast tests: tiny backoff, no jitter,
/// heartbeats effectively off.
pub fn fast_settings() -> ConnectionSettings {
    ConnectionSettings {
        heartbeat_interval: Duration::from_secs(60),
        heartbeat_timeout: Duration::from_secs(30),
        reconnect_delay_initial: Duration::from_millis(20),
        reconnect_delay_max: Duration::from_millis(100),
        reconnect_jitter: 0.0,
        max_reconnect_attempts: 5,
        connect_timeout: Duration::from_secs(2),
        open_timeout: Duration::from_secs(2),
        snapshot_timeout: Duration::from_secs(2),
        ..ConnectionSettings::default()
    }
}

/// Client configuration pointing at `url`.
pub fn config(url: &str, snapshot_mode: bool, settings: ConnectionSettings) -> ClientConfig {
    ClientConfig::new(url, ACCESS_ID, snapshot_mode)
        .unwrap()
        .with_connection(settings)
}

/// A URL nothing listens on.
pub async fn refused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{addr}")
}

/// Quote payload for `ticker`.
pub fn quote(ticker: &str, bid: &str, ask: &str) -> Value {
    json!({
        "msg": "quote",
        "ticker": ticker,
        "bid": bid,
        "ask": ask,
        "utcdt": "18-10-2026 10:15:00.250000"
    })
}

// =============================================================================
// Mock Server
// =============================================================================

/// WebSocket server on an ephemeral localhost port.
pub struct MockServer {
    listener: TcpListener,
    addr: SocketAddr,
}

impl MockServer {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        Self { listener, addr }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Accept the next client connection, failing the test after [`WAIT`].
    pub async fn accept(&self) -> MockConnection {
        self.try_accept(WAIT)
            .await
            .expect("client did not connect in time")
    }

    /// Accept a connection if one arrives within `wait`.
    pub async fn try_accept(&self, wait: Duration) -> Option<MockConnection> {
        let (stream, _) = timeout(wait, self.listener.accept()).await.ok()?.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (mut write, mut read) = ws.split();

        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        let reader = tokio::spawn(async move {
            while let Some(Ok(message)) = read.next().await {
                if let Message::Text(text) = message
                    && let Ok(value) = serde_json::from_str::<Value>(text.as_str())
                    && inbound_tx.send(value).is_err()
                {
                    break;
                }
            }
        });
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if write.send(message).await.is_err() {
                    break;
                }
            }
        });

        Some(MockConnection {
            inbound,
            outbound,
            tasks: vec![reader, writer],
        })
    }
}

/// One accepted client connection.
pub struct MockConnection {
    inbound: mpsc::UnboundedReceiver<Value>,
    outbound: mpsc::UnboundedSender<Message>,
    tasks: Vec<JoinHandle<()>>,
}

impl MockConnection {
    /// Next request whose `msg` is `kind`. Heartbeat pings are skipped
    /// unless `kind` is `"ping"`.
    pub async fn expect_request(&mut self, kind: &str) -> Value {
        loop {
            let request = timeout(WAIT, self.inbound.recv())
                .await
                .unwrap_or_else(|_| panic!("no '{kind}' request in time"))
                .unwrap_or_else(|| panic!("connection closed waiting for '{kind}'"));
            let msg = request["msg"].as_str().unwrap_or_default();
            if msg == kind {
                return request;
            }
            assert_eq!(msg, "ping", "expected '{kind}', got {request}");
        }
    }

    /// Next non-ping request, if one arrives within `wait`.
    pub async fn try_request(&mut self, wait: Duration) -> Option<Value> {
        loop {
            let request = timeout(wait, self.inbound.recv()).await.ok()??;
            if request["msg"] != "ping" {
                return Some(request);
            }
        }
    }

    /// Expect the open request, acknowledge it as `session_id`, and return it.
    pub async fn open_session(&mut self, session_id: &str) -> Value {
        let open = self.expect_request("open").await;
        self.send_json(&json!({"msg": "init", "sid": session_id}));
        open
    }

    pub fn send_json(&self, value: &Value) {
        self.send_raw(&value.to_string());
    }

    pub fn send_raw(&self, text: &str) {
        self.outbound.send(Message::Text(text.to_string().into())).unwrap();
    }

    /// Drop the socket without a close handshake.
    pub fn kill(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.kill();
    }
}

// =============================================================================
// Event Helpers
// =============================================================================

/// Collect events until one matches `done`, inclusive.
pub async fn events_until(
    rx: &mut broadcast::Receiver<ClientEvent>,
    done: impl Fn(&ClientEvent) -> bool,
) -> Vec<ClientEvent> {
    let mut seen = Vec::new();
    loop {
        let event = timeout(WAIT, rx.recv())
            .await
            .unwrap_or_else(|_| panic!("event not seen in time; got {seen:?}"))
            .unwrap();
        let finished = done(&event);
        seen.push(event);
        if finished {
            return seen;
        }
    }
}

/// Names of `events`, for compact sequence assertions.
pub fn names(events: &[ClientEvent]) -> Vec<&'static str> {
    events.iter().map(ClientEvent::name).collect()
}

/// Tickers listed in an `update` or `snapshot` request.
pub fn tickers_of(request: &Value) -> Vec<String> {
    request["tickers"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t.as_str().unwrap().to_string())
        .collect()
}
