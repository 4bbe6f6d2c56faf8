//! Session Driver
//!
//! The one task that owns the WebSocket. It connects, opens a session,
//! keeps it alive with heartbeats, restores subscriptions after every
//! open, answers snapshot queries, and reconnects with backoff when the
//! transport drops. Callers talk to it through [`SessionCommand`]s and
//! observe it through the event bus and a [`SessionStatus`] watch.
//!
//! # Epochs
//!
//! Each connection attempt is one epoch:
//!
//! ```text
//! StartConnect → connect → Connected → open → init(sid) → Opened → stream...
//!       ▲                                                            │
//!       └──── backoff ◄──── ConnectionLost ◄──── error / timeout ◄───┘
//! ```
//!
//! `finish` from the server and exhausted reconnect attempts end the driver
//! for good; cancellation ends it quietly.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use super::codec::FrameCodec;
use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
use super::messages::{ClientRequest, ServerMessage, SessionMode};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use super::snapshot::{SnapshotEngine, SnapshotReply};
use crate::application::services::{ClientEvent, EventBus};
use crate::domain::error::ClientError;
use crate::domain::session::{SessionError, SessionManager, SessionState};
use crate::domain::streaming::{MarketDatum, Ping};
use crate::domain::subscription::SubscriptionRegistry;
use crate::infrastructure::config::ConnectionSettings;
use crate::infrastructure::metrics::{self, MessageKind};

impl From<tungstenite::Error> for ClientError {
    fn from(error: tungstenite::Error) -> Self {
        Self::Connection(error.to_string())
    }
}

impl From<SessionError> for ClientError {
    fn from(error: SessionError) -> Self {
        Self::Connection(error.to_string())
    }
}

/// Bound on the WebSocket close handshake when a session ends.
const CLOSE_WAIT: Duration = Duration::from_secs(1);

// =============================================================================
// Commands & Status
// =============================================================================

/// Requests from the client facade to the driver.
#[derive(Debug)]
pub enum SessionCommand {
    /// The subscription registry changed; push the full set if open.
    SyncTickers,
    /// Run a snapshot query.
    Snapshot {
        /// Requested tickers, already normalized.
        tickers: Vec<String>,
        /// Where the result goes.
        reply: SnapshotReply,
    },
}

/// Read-only view of the driver, published on every transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStatus {
    /// Lifecycle state.
    pub state: SessionState,
    /// Id of the open session.
    pub session_id: Option<String>,
    /// Why the driver stopped for good, if it did.
    pub terminal: Option<ClientError>,
}

/// How an epoch ended without a transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EpochEnd {
    Cancelled,
    Superseded,
}

// =============================================================================
// Driver
// =============================================================================

/// Everything a driver needs, shared with the client facade.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// WebSocket endpoint.
    pub url: String,
    /// Access id sent in the open request.
    pub access_id: String,
    /// Label sent in the open request.
    pub client_label: String,
    /// Streaming or query-only.
    pub mode: SessionMode,
    /// Timeouts and backoff.
    pub settings: ConnectionSettings,
    /// Frame codec.
    pub codec: Arc<dyn FrameCodec>,
    /// Event fan-out.
    pub bus: Arc<EventBus>,
    /// Desired tickers.
    pub subscriptions: Arc<SubscriptionRegistry>,
    /// Status publisher.
    pub status: Arc<watch::Sender<SessionStatus>>,
}

/// Connection owner for one logical session.
pub struct SessionDriver {
    ctx: SessionContext,
    reconnect: ReconnectConfig,
    heartbeat: HeartbeatConfig,
    cancel: CancellationToken,
}

/// Per-driver mutable state, threaded through each epoch.
struct DriverState {
    session: SessionManager,
    snapshots: SnapshotEngine,
    policy: ReconnectPolicy,
    heartbeat: Arc<HeartbeatState>,
}

impl SessionDriver {
    /// Create a driver. Nothing happens until [`SessionDriver::run`].
    #[must_use]
    pub fn new(ctx: SessionContext, cancel: CancellationToken) -> Self {
        Self {
            reconnect: ReconnectConfig::from_settings(&ctx.settings),
            heartbeat: HeartbeatConfig::from_settings(&ctx.settings),
            ctx,
            cancel,
        }
    }

    /// Drive the session until cancelled or a terminal error.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ReconnectExhausted`] or
    /// [`ClientError::SessionSuperseded`] when the session ends for good.
    pub async fn run(
        self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Result<(), ClientError> {
        let mut state = DriverState {
            session: SessionManager::new(),
            snapshots: SnapshotEngine::new(),
            policy: ReconnectPolicy::new(self.reconnect.clone()),
            heartbeat: Arc::new(HeartbeatState::new()),
        };

        loop {
            if self.cancel.is_cancelled() {
                self.close(&mut state);
                return Ok(());
            }

            state.session.begin_connect()?;
            self.publish_status(&state.session, None);
            self.ctx.bus.publish(ClientEvent::StartConnect);
            metrics::record_connect_attempt();

            let error = match self.connect_and_run(&mut state, &mut commands).await {
                Ok(EpochEnd::Cancelled) => {
                    self.close(&mut state);
                    return Ok(());
                }
                Ok(EpochEnd::Superseded) => {
                    tracing::warn!("Session finished by a new login; not reconnecting");
                    state.session.finish();
                    state.snapshots.fail(ClientError::SessionSuperseded);
                    metrics::record_session_closed();
                    self.publish_status(&state.session, Some(ClientError::SessionSuperseded));
                    self.ctx.bus.publish(ClientEvent::SessionFinishedByNewLogin);
                    return Err(ClientError::SessionSuperseded);
                }
                Err(error) => error,
            };

            if self.cancel.is_cancelled() {
                self.close(&mut state);
                return Ok(());
            }

            tracing::warn!(error = %error, "Connection lost");
            state.session.connection_lost();
            state.snapshots.connection_lost();
            metrics::record_session_closed();
            self.publish_status(&state.session, None);
            self.ctx.bus.publish(ClientEvent::ConnectionLost {
                error: error.clone(),
            });

            match state.policy.next_delay() {
                Ok(delay) => {
                    let attempt = state.policy.attempt_count();
                    tracing::info!(
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Reconnecting to quote server"
                    );
                    metrics::record_reconnect();

                    tokio::select! {
                        () = self.cancel.cancelled() => {
                            tracing::info!("Cancelled during reconnect delay");
                            self.close(&mut state);
                            return Ok(());
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(exhausted) => {
                    let terminal = ClientError::ReconnectExhausted {
                        attempts: state.policy.attempt_count(),
                        last_error: error.to_string(),
                    };
                    tracing::error!(error = %exhausted, last_error = %error, "Giving up on quote server");
                    state.session.close();
                    state.snapshots.fail(terminal.clone());
                    self.publish_status(&state.session, Some(terminal.clone()));
                    self.ctx.bus.publish(ClientEvent::ReconnectFailed {
                        error: terminal.clone(),
                    });
                    return Err(terminal);
                }
            }
        }
    }

    /// One epoch: connect, open, and pump frames until something ends it.
    async fn connect_and_run(
        &self,
        state: &mut DriverState,
        commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Result<EpochEnd, ClientError> {
        tracing::info!(url = %self.ctx.url, "Connecting to quote server");

        let connect = tokio::time::timeout(
            self.ctx.settings.connect_timeout,
            tokio_tungstenite::connect_async(self.ctx.url.as_str()),
        );
        let (ws_stream, _response) = tokio::select! {
            () = self.cancel.cancelled() => return Ok(EpochEnd::Cancelled),
            result = connect => result.map_err(|_| {
                ClientError::Connection(format!(
                    "connect timed out after {:?}",
                    self.ctx.settings.connect_timeout
                ))
            })??,
        };

        let (mut write, mut read) = ws_stream.split();

        state.session.transport_connected()?;
        self.publish_status(&state.session, None);
        self.ctx.bus.publish(ClientEvent::Connected);

        let open = ClientRequest::Open {
            sid: self.ctx.access_id.clone(),
            client: self.ctx.client_label.clone(),
            mode: self.ctx.mode,
        };
        self.send(&mut write, &open).await?;
        tracing::debug!(mode = ?self.ctx.mode, "Open request sent");

        state.heartbeat.reset();
        let heartbeat_cancel = self.cancel.child_token();
        let _heartbeat_guard = heartbeat_cancel.clone().drop_guard();
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel::<HeartbeatEvent>(10);
        tokio::spawn(
            HeartbeatManager::new(
                self.heartbeat.clone(),
                Arc::clone(&state.heartbeat),
                heartbeat_tx,
                heartbeat_cancel,
            )
            .run(),
        );
        let mut heartbeat_alive = true;

        let open_deadline = tokio::time::sleep(self.ctx.settings.open_timeout);
        tokio::pin!(open_deadline);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    self.close_transport(&mut write, &state.session).await;
                    return Ok(EpochEnd::Cancelled);
                }
                () = &mut open_deadline, if !state.session.is_open() => {
                    return Err(ClientError::Connection(format!(
                        "session not acknowledged within {:?}",
                        self.ctx.settings.open_timeout
                    )));
                }
                event = heartbeat_rx.recv(), if heartbeat_alive => {
                    match event {
                        Some(HeartbeatEvent::SendPing) => {
                            if let Some(sid) = state.session.session_id() {
                                let ping = ClientRequest::Ping {
                                    sid: sid.to_string(),
                                    pid: state.heartbeat.begin_ping(),
                                };
                                self.send(&mut write, &ping).await?;
                            }
                        }
                        Some(HeartbeatEvent::Timeout(elapsed)) => {
                            metrics::record_heartbeat_timeout();
                            tracing::warn!(
                                elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                                "No heartbeat reply, dropping connection"
                            );
                            return Err(ClientError::HeartbeatTimeout(self.heartbeat.pong_timeout));
                        }
                        None => {
                            tracing::debug!("Heartbeat channel closed");
                            heartbeat_alive = false;
                        }
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command, state, &mut write).await?,
                        None => {
                            tracing::debug!("Command channel closed");
                            self.close_transport(&mut write, &state.session).await;
                            return Ok(EpochEnd::Cancelled);
                        }
                    }
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(end) = self.handle_frame(text.as_str(), state, &mut write).await? {
                                return Ok(end);
                            }
                        }
                        Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                            Ok(text) => {
                                if let Some(end) = self.handle_frame(text, state, &mut write).await? {
                                    return Ok(end);
                                }
                            }
                            Err(e) => self.report_decode_error(format!("binary frame is not UTF-8: {e}")),
                        },
                        Some(Ok(Message::Pong(_))) => {
                            state.heartbeat.record_transport_pong();
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame.map_or_else(
                                || "no reason".to_string(),
                                |f| format!("{} {}", f.code, f.reason),
                            );
                            tracing::info!(reason = %reason, "Server sent close frame");
                            return Err(ClientError::Connection(format!("server closed connection: {reason}")));
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            tracing::info!("WebSocket stream ended");
                            return Err(ClientError::Connection("stream ended".to_string()));
                        }
                    }
                }
            }
        }
    }

    async fn handle_command<W>(
        &self,
        command: SessionCommand,
        state: &mut DriverState,
        write: &mut W,
    ) -> Result<(), ClientError>
    where
        W: SinkExt<Message> + Unpin,
        W::Error: Display,
    {
        match command {
            SessionCommand::SyncTickers => {
                if state.session.is_open() {
                    self.send_subscriptions(write, &state.session).await?;
                }
            }
            SessionCommand::Snapshot { tickers, reply } => {
                tracing::debug!(tickers = ?tickers, "Snapshot query queued");
                state.snapshots.begin(tickers, reply);
                self.flush_snapshot(write, state).await?;
            }
        }
        Ok(())
    }

    /// Decode and dispatch one frame, in element order.
    async fn handle_frame<W>(
        &self,
        text: &str,
        state: &mut DriverState,
        write: &mut W,
    ) -> Result<Option<EpochEnd>, ClientError>
    where
        W: SinkExt<Message> + Unpin,
        W::Error: Display,
    {
        for decoded in self.ctx.codec.decode(text) {
            let message = match decoded {
                Ok(message) => message,
                Err(e) => {
                    self.report_decode_error(e.to_string());
                    continue;
                }
            };

            match message {
                ServerMessage::Init(init) => {
                    metrics::record_message_received(MessageKind::Init);
                    self.on_session_open(init.sid, state, write).await?;
                }
                ServerMessage::Finish => {
                    metrics::record_message_received(MessageKind::Finish);
                    return Ok(Some(EpochEnd::Superseded));
                }
                ServerMessage::Ping(ping) => {
                    metrics::record_message_received(MessageKind::Ping);
                    let round_trip = state.heartbeat.record_reply(&ping.pid);
                    self.ctx.bus.publish(ClientEvent::Ping(Ping {
                        ping_id: ping.pid,
                        round_trip,
                        received_at: Utc::now(),
                    }));
                }
                ServerMessage::Quote(quote) => {
                    metrics::record_message_received(MessageKind::Quote);
                    if accepts_market_data(&state.session, "quote") {
                        self.ctx.bus.publish(ClientEvent::Quote(quote.into()));
                    }
                }
                ServerMessage::LastPrice(last) => {
                    metrics::record_message_received(MessageKind::LastPrice);
                    if accepts_market_data(&state.session, "lastprice") {
                        self.ctx.bus.publish(ClientEvent::LastPrice(last.into()));
                    }
                }
                ServerMessage::Trade(trade) => {
                    metrics::record_message_received(MessageKind::Trade);
                    if accepts_market_data(&state.session, "trade") {
                        self.ctx.bus.publish(ClientEvent::Trade(trade.into()));
                    }
                }
                ServerMessage::Result(result) => {
                    metrics::record_message_received(MessageKind::Result);
                    tracing::debug!(code = result.code, "Result notice");
                    self.ctx.bus.publish(ClientEvent::Result(result.into()));
                }
                ServerMessage::MarketData(data) => {
                    metrics::record_message_received(MessageKind::MarketData);
                    let rows: Vec<MarketDatum> = data.data.into_iter().map(Into::into).collect();
                    if let Some(count) = state.snapshots.complete(rows) {
                        tracing::debug!(rows = count, "Snapshot query answered");
                    }
                }
            }
        }

        Ok(None)
    }

    async fn on_session_open<W>(
        &self,
        session_id: String,
        state: &mut DriverState,
        write: &mut W,
    ) -> Result<(), ClientError>
    where
        W: SinkExt<Message> + Unpin,
        W::Error: Display,
    {
        if let Err(e) = state.session.open(session_id.clone()) {
            tracing::warn!(error = %e, "Ignoring session acknowledgement");
            return Ok(());
        }

        tracing::info!(session_id = %session_id, "Session opened");
        state.policy.reset();
        state.heartbeat.reset();
        metrics::record_session_opened();
        self.publish_status(&state.session, None);
        self.ctx.bus.publish(ClientEvent::Opened {
            session_id: session_id.clone(),
        });

        let requested = self.ctx.bus.collect_resubscriptions(&session_id);
        if !requested.is_empty() {
            match self.ctx.subscriptions.subscribe(&requested) {
                Ok(changes) if !changes.added.is_empty() => {
                    tracing::debug!(added = ?changes.added, "Listeners added tickers on open");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Ignoring listener resubscription list"),
            }
        }

        self.send_subscriptions(write, &state.session).await?;
        self.flush_snapshot(write, state).await
    }

    /// Send the full subscription set. Streaming sessions only.
    async fn send_subscriptions<W>(
        &self,
        write: &mut W,
        session: &SessionManager,
    ) -> Result<(), ClientError>
    where
        W: SinkExt<Message> + Unpin,
        W::Error: Display,
    {
        if self.ctx.mode == SessionMode::Snapshot {
            return Ok(());
        }
        let Some(sid) = session.session_id() else {
            return Ok(());
        };

        let tickers = self.ctx.subscriptions.tickers();
        tracing::debug!(tickers = ?tickers, "Sending subscription set");
        self.send(
            write,
            &ClientRequest::Update {
                sid: sid.to_string(),
                tickers,
            },
        )
        .await
    }

    /// Write a queued snapshot request if the session is open.
    async fn flush_snapshot<W>(&self, write: &mut W, state: &mut DriverState) -> Result<(), ClientError>
    where
        W: SinkExt<Message> + Unpin,
        W::Error: Display,
    {
        let Some(sid) = state.session.session_id().map(str::to_string) else {
            return Ok(());
        };
        if let Some(tickers) = state.snapshots.take_unsent() {
            self.send(write, &ClientRequest::Snapshot { sid, tickers })
                .await?;
        }
        Ok(())
    }

    async fn send<W>(&self, write: &mut W, request: &ClientRequest) -> Result<(), ClientError>
    where
        W: SinkExt<Message> + Unpin,
        W::Error: Display,
    {
        let frame = self
            .ctx
            .codec
            .encode(request)
            .map_err(|e| ClientError::Connection(format!("failed to encode {}: {e}", request.kind())))?;

        write.send(Message::Text(frame.into())).await.map_err(|e| {
            ClientError::Connection(format!("failed to send {}: {e}", request.kind()))
        })
    }

    /// Best-effort orderly shutdown of the socket.
    async fn close_transport<W>(&self, write: &mut W, session: &SessionManager)
    where
        W: SinkExt<Message> + Unpin,
        W::Error: Display,
    {
        if let Some(sid) = session.session_id() {
            let close = ClientRequest::Close {
                sid: sid.to_string(),
            };
            if let Err(e) = self.send(write, &close).await {
                tracing::debug!(error = %e, "Close request not delivered");
            }
        }
        close_sink(write, CLOSE_WAIT).await;
    }

    fn report_decode_error(&self, detail: String) {
        tracing::warn!(error = %detail, "Skipping undecodable message");
        metrics::record_decode_error();
        self.ctx.bus.publish(ClientEvent::DecodeError {
            error: ClientError::Decode(detail),
        });
    }

    fn close(&self, state: &mut DriverState) {
        state.snapshots.fail(ClientError::Cancelled);
        if state.session.close() {
            metrics::record_session_closed();
        }
        self.publish_status(&state.session, None);
        tracing::info!("Session driver stopped");
    }

    fn publish_status(&self, session: &SessionManager, terminal: Option<ClientError>) {
        self.ctx.status.send_replace(SessionStatus {
            state: session.state(),
            session_id: session.session_id().map(str::to_string),
            terminal,
        });
    }
}

/// Market data only counts once the session is open.
fn accepts_market_data(session: &SessionManager, kind: &str) -> bool {
    if session.is_open() {
        return true;
    }
    tracing::debug!(kind, state = %session.state(), "Dropping market data before session open");
    false
}

/// Close the write half, waiting at most `wait`. Returns whether it closed cleanly.
async fn close_sink<W>(write: &mut W, wait: Duration) -> bool
where
    W: SinkExt<Message> + Unpin,
    W::Error: Display,
{
    match tokio::time::timeout(wait, write.close()).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "WebSocket close failed");
            false
        }
        Err(_) => {
            tracing::debug!(
                wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                "WebSocket close timed out"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Sink whose close either fails or never completes.
    struct BrokenSink {
        fail: bool,
    }

    impl futures_util::Sink<Message> for BrokenSink {
        type Error = String;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), String>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, _item: Message) -> Result<(), String> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), String>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), String>> {
            if self.fail {
                Poll::Ready(Err("broken pipe".to_string()))
            } else {
                Poll::Pending
            }
        }
    }

    #[tokio::test]
    async fn close_sink_reports_failure_and_stall() {
        let wait = Duration::from_millis(20);
        assert!(!close_sink(&mut BrokenSink { fail: true }, wait).await);
        assert!(!close_sink(&mut BrokenSink { fail: false }, wait).await);
        assert!(close_sink(&mut futures_util::sink::drain(), wait).await);
    }

    #[test]
    fn transport_errors_map_to_connection() {
        let error: ClientError = tungstenite::Error::ConnectionClosed.into();
        assert!(matches!(error, ClientError::Connection(_)));
        assert!(error.is_transient());
    }

    #[test]
    fn invalid_transition_is_transient() {
        let error: ClientError = SessionError::EmptySessionId.into();
        assert!(error.is_transient());
    }

    #[test]
    fn market_data_requires_open_session() {
        let mut session = SessionManager::new();
        session.begin_connect().unwrap();
        session.transport_connected().unwrap();
        assert!(!accepts_market_data(&session, "quote"));

        session.open("S1").unwrap();
        assert!(accepts_market_data(&session, "quote"));
    }

    #[test]
    fn default_status_is_closed() {
        let status = SessionStatus::default();
        assert_eq!(status.state, SessionState::Closed);
        assert!(status.session_id.is_none());
        assert!(status.terminal.is_none());
    }
}
