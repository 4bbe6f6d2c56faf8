//! Quote Client
//!
//! Public facade over the session driver. Constructing a client acquires
//! nothing; [`QuoteClient::start`] spawns the driver onto the current tokio
//! runtime and [`QuoteClient::stop`] tears everything down.
//!
//! # Example
//!
//! ```ignore
//! let client = QuoteClient::new(ClientConfig::from_env()?);
//! client.add_listener(Arc::new(MyListener));
//! client.set_tickers(["gold", "silver"])?;
//! client.start("desk-7")?;
//!
//! let rows = client.query_snapshot(["gold"]).await?;
//! client.shutdown().await;
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::codec::{FrameCodec, JsonCodec};
use super::messages::SessionMode;
use super::session::{SessionCommand, SessionContext, SessionDriver, SessionStatus};
use crate::application::ports::QuoteListener;
use crate::application::services::{ClientEvent, EventBus, ListenerId};
use crate::domain::error::ClientError;
use crate::domain::session::SessionState;
use crate::domain::streaming::MarketDatum;
use crate::domain::subscription::{
    SubscriptionChanges, SubscriptionRegistry, Ticker, TickerError, normalize_tickers,
};
use crate::infrastructure::config::ClientConfig;
use crate::infrastructure::metrics::{self, SnapshotOutcome};

/// Label sent by transient query-only sessions.
const SNAPSHOT_CLIENT_LABEL: &str = "pfs-quotes-snapshot";

/// How long [`QuoteClient::shutdown`] waits for the driver to close the socket.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

impl From<TickerError> for ClientError {
    fn from(error: TickerError) -> Self {
        Self::InvalidTicker(error.to_string())
    }
}

/// A spawned driver and the handles to reach it.
struct RunningSession {
    commands: mpsc::UnboundedSender<SessionCommand>,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), ClientError>>,
}

/// Streaming quote client.
pub struct QuoteClient {
    config: ClientConfig,
    codec: Arc<dyn FrameCodec>,
    bus: Arc<EventBus>,
    subscriptions: Arc<SubscriptionRegistry>,
    status: Arc<watch::Sender<SessionStatus>>,
    running: Mutex<Option<RunningSession>>,
    snapshot_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for QuoteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuoteClient")
            .field("server_url", &self.config.server_url)
            .field("state", &self.session_state())
            .field("tickers", &self.subscriptions.len())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl QuoteClient {
    /// Create a client. No connection is made until [`QuoteClient::start`].
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self::with_codec(config, Arc::new(JsonCodec::new()))
    }

    /// Create a client with a custom frame codec.
    #[must_use]
    pub fn with_codec(config: ClientConfig, codec: Arc<dyn FrameCodec>) -> Self {
        let bus = Arc::new(EventBus::new(config.connection.event_capacity));
        let (status, _) = watch::channel(SessionStatus::default());

        Self {
            config,
            codec,
            bus,
            subscriptions: Arc::new(SubscriptionRegistry::new()),
            status: Arc::new(status),
            running: Mutex::new(None),
            snapshot_lock: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
        }
    }

    /// The configuration this client was built with.
    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start connecting in the background.
    ///
    /// A client whose previous session ended for good (superseded or out of
    /// reconnect attempts) may be started again.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Disposed`] after [`QuoteClient::stop`]
    /// - [`ClientError::NoRuntime`] outside a tokio runtime
    /// - [`ClientError::AlreadyStarted`] while a session is running
    pub fn start(&self, client_label: impl Into<String>) -> Result<(), ClientError> {
        if self.is_disposed() {
            return Err(ClientError::Disposed);
        }
        let runtime = Handle::try_current().map_err(|e| ClientError::NoRuntime(e.to_string()))?;

        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return Err(ClientError::AlreadyStarted);
        }

        let mode = SessionMode::from_snapshot_flag(self.config.snapshot_mode);
        let client_label = client_label.into();
        tracing::info!(
            url = %self.config.server_url,
            client = %client_label,
            mode = ?mode,
            "Starting quote client"
        );

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let cancel = self.cancel.child_token();
        let ctx = self.context(client_label, mode, Arc::clone(&self.bus), Arc::clone(&self.status));
        let task = runtime.spawn(SessionDriver::new(ctx, cancel.clone()).run(commands_rx));

        *running = Some(RunningSession {
            commands,
            cancel,
            task,
        });
        Ok(())
    }

    /// Stop the client. Idempotent and safe from any thread.
    ///
    /// Cancels the driver, unblocks a pending [`QuoteClient::query_snapshot`]
    /// with [`ClientError::Cancelled`] and delivers `Disposed` once. No
    /// events follow it.
    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(running) = self.running.lock().take() {
            running.cancel.cancel();
        }
        if self.bus.dispose() {
            tracing::info!("Quote client stopped");
        }
    }

    /// Stop and wait, bounded, for the driver to close the socket.
    pub async fn shutdown(&self) {
        let running = self.running.lock().take();
        self.stop();

        let Some(running) = running else {
            return;
        };
        match tokio::time::timeout(SHUTDOWN_GRACE, running.task).await {
            Ok(Ok(Ok(()))) => tracing::debug!("Session driver exited"),
            Ok(Ok(Err(e))) => tracing::debug!(error = %e, "Session driver had already failed"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Session driver task panicked"),
            Err(_) => tracing::warn!(
                grace_ms = u64::try_from(SHUTDOWN_GRACE.as_millis()).unwrap_or(u64::MAX),
                "Session driver did not exit in time"
            ),
        }
    }

    /// Whether [`QuoteClient::stop`] has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.bus.is_disposed()
    }

    /// Whether a driver task is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Replace the subscription set.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidTicker`] for a blank ticker; the set is
    /// left unchanged.
    pub fn set_tickers<I, S>(&self, tickers: I) -> Result<SubscriptionChanges, ClientError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let changes = self.subscriptions.set_tickers(tickers)?;
        self.sync_tickers(&changes);
        Ok(changes)
    }

    /// Add tickers to the subscription set.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidTicker`] for a blank ticker.
    pub fn subscribe<I, S>(&self, tickers: I) -> Result<SubscriptionChanges, ClientError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let changes = self.subscriptions.subscribe(tickers)?;
        self.sync_tickers(&changes);
        Ok(changes)
    }

    /// Remove tickers from the subscription set.
    pub fn unsubscribe<I, S>(&self, tickers: I) -> SubscriptionChanges
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let changes = self.subscriptions.unsubscribe(tickers);
        self.sync_tickers(&changes);
        changes
    }

    /// Current subscription set, in insertion order.
    #[must_use]
    pub fn tickers(&self) -> Vec<Ticker> {
        self.subscriptions.tickers()
    }

    fn sync_tickers(&self, changes: &SubscriptionChanges) {
        if changes.is_empty() {
            return;
        }
        tracing::debug!(added = ?changes.added, removed = ?changes.removed, "Subscriptions changed");
        if let Some(commands) = self.live_commands() {
            // A driver that already exited has nothing to sync.
            let _ = commands.send(SessionCommand::SyncTickers);
        }
    }

    // =========================================================================
    // Snapshot Queries
    // =========================================================================

    /// Fetch the current market data for `tickers`.
    ///
    /// Uses the running session if there is one, otherwise a transient
    /// query-only session that is closed afterwards. Queries run one at a
    /// time. Rows for tickers the server does not know are simply missing.
    ///
    /// # Errors
    ///
    /// - [`ClientError::InvalidTicker`] for a blank ticker
    /// - [`ClientError::Disposed`] after [`QuoteClient::stop`]
    /// - [`ClientError::Cancelled`] if the client stops while waiting
    /// - [`ClientError::SnapshotTimeout`] if no answer arrives in time
    /// - the session's terminal error if it ends while waiting
    pub async fn query_snapshot<I, S>(&self, tickers: I) -> Result<Vec<MarketDatum>, ClientError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tickers = normalize_tickers(tickers)?;
        if tickers.is_empty() {
            return Ok(Vec::new());
        }
        if self.is_disposed() || self.cancel.is_cancelled() {
            return Err(ClientError::Disposed);
        }

        let _serialized = tokio::select! {
            () = self.cancel.cancelled() => return Err(ClientError::Cancelled),
            guard = self.snapshot_lock.lock() => guard,
        };

        let started = Instant::now();
        let result = self.run_snapshot(tickers).await;

        let outcome = match &result {
            Ok(_) => SnapshotOutcome::Completed,
            Err(ClientError::SnapshotTimeout(_)) => SnapshotOutcome::TimedOut,
            Err(ClientError::Cancelled) => SnapshotOutcome::Cancelled,
            Err(_) => SnapshotOutcome::Failed,
        };
        metrics::record_snapshot(outcome, started.elapsed());

        match &result {
            Ok(rows) => tracing::debug!(rows = rows.len(), "Snapshot query finished"),
            Err(e) => tracing::warn!(error = %e, "Snapshot query failed"),
        }
        result
    }

    async fn run_snapshot(&self, tickers: Vec<Ticker>) -> Result<Vec<MarketDatum>, ClientError> {
        let (reply, reply_rx) = oneshot::channel();
        let command = SessionCommand::Snapshot { tickers, reply };

        let (status, _teardown) = match self.send_to_running(command) {
            Ok(()) => (Arc::clone(&self.status), None),
            Err(command) => {
                let (status, cancel) = self.spawn_transient(command)?;
                (status, Some(cancel.drop_guard()))
            }
        };

        let timeout = self.config.connection.snapshot_timeout;
        tokio::select! {
            () = self.cancel.cancelled() => Err(ClientError::Cancelled),
            outcome = tokio::time::timeout(timeout, reply_rx) => match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(terminal_error(&status)),
                Err(_) => Err(ClientError::SnapshotTimeout(timeout)),
            },
        }
    }

    /// Hand `command` to the running driver, or give it back.
    fn send_to_running(&self, command: SessionCommand) -> Result<(), SessionCommand> {
        match self.live_commands() {
            Some(commands) => commands.send(command).map_err(|e| e.0),
            None => Err(command),
        }
    }

    /// Spawn a query-only session carrying `command`.
    ///
    /// It has its own event bus and status so it stays invisible to
    /// listeners and to [`QuoteClient::session_state`].
    fn spawn_transient(
        &self,
        command: SessionCommand,
    ) -> Result<(Arc<watch::Sender<SessionStatus>>, CancellationToken), ClientError> {
        let runtime = Handle::try_current().map_err(|e| ClientError::NoRuntime(e.to_string()))?;
        tracing::debug!("Opening transient snapshot session");

        let (commands, commands_rx) = mpsc::unbounded_channel();
        commands
            .send(command)
            .map_err(|_| ClientError::Connection("snapshot session unavailable".to_string()))?;

        let status = Arc::new(watch::channel(SessionStatus::default()).0);
        let cancel = self.cancel.child_token();
        let ctx = self.context(
            SNAPSHOT_CLIENT_LABEL.to_string(),
            SessionMode::Snapshot,
            Arc::new(EventBus::new(1)),
            Arc::clone(&status),
        );
        let driver = SessionDriver::new(ctx, cancel.clone());

        runtime.spawn(async move {
            // Keep the sender alive so the driver does not read a closed channel.
            let _commands = commands;
            if let Err(e) = driver.run(commands_rx).await {
                tracing::debug!(error = %e, "Transient snapshot session ended");
            }
        });

        Ok((status, cancel))
    }

    // =========================================================================
    // Observers & Status
    // =========================================================================

    /// Register a listener; it receives events in registration order.
    pub fn add_listener(&self, listener: Arc<dyn QuoteListener>) -> ListenerId {
        self.bus.register(listener)
    }

    /// Unregister a listener. Returns `false` if it was unknown.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.bus.unregister(id)
    }

    /// Stream of every event published from now on.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.bus.subscribe()
    }

    /// Current session state.
    #[must_use]
    pub fn session_state(&self) -> SessionState {
        self.status.borrow().state
    }

    /// Id of the open session, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.status.borrow().session_id.clone()
    }

    /// Watch every status transition.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn live_commands(&self) -> Option<mpsc::UnboundedSender<SessionCommand>> {
        self.running
            .lock()
            .as_ref()
            .filter(|r| !r.task.is_finished())
            .map(|r| r.commands.clone())
    }

    fn context(
        &self,
        client_label: String,
        mode: SessionMode,
        bus: Arc<EventBus>,
        status: Arc<watch::Sender<SessionStatus>>,
    ) -> SessionContext {
        SessionContext {
            url: self.config.server_url.clone(),
            access_id: self.config.access_id.expose().to_string(),
            client_label,
            mode,
            settings: self.config.connection.clone(),
            codec: Arc::clone(&self.codec),
            bus,
            subscriptions: Arc::clone(&self.subscriptions),
            status,
        }
    }
}

/// Why a driver dropped a reply without answering.
fn terminal_error(status: &watch::Sender<SessionStatus>) -> ClientError {
    status
        .borrow()
        .terminal
        .clone()
        .unwrap_or(ClientError::Cancelled)
}

impl Drop for QuoteClient {
    fn drop(&mut self) {
        self.stop();
    }
}
