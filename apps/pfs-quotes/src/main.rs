//! PFS Quotes Binary
//!
//! Streams quotes for a ticker list, or prints a one-shot snapshot.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin pfs-quotes
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `PFS_URL`: Quote server WebSocket URL
//! - `PFS_ID`: Access id
//!
//! ## Optional
//! - `PFS_MODE`: online | snapshot (default: online)
//! - `PFS_TICKERS`: Comma-separated tickers (default: JPYRUB,gold,goldgrrub,silver)
//! - `PFS_CLIENT_LABEL`: Label sent when opening a session (default: pfs-quotes)
//! - `PFS_HEARTBEAT_INTERVAL_SECS`, `PFS_SNAPSHOT_TIMEOUT_SECS`, ...: see `ConnectionSettings`
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: false)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use pfs_quotes::infrastructure::telemetry;
use pfs_quotes::{
    ClientConfig, ClientError, LastPrice, Ping, Quote, QuoteClient, QuoteListener, ResultMessage,
    SessionStatus, Trade, init_metrics,
};
use tokio::signal;
use tokio::sync::watch;

/// Tickers used when `PFS_TICKERS` is unset.
const DEFAULT_TICKERS: &str = "JPYRUB,gold,goldgrrub,silver";

/// Label used when `PFS_CLIENT_LABEL` is unset.
const DEFAULT_CLIENT_LABEL: &str = "pfs-quotes";

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// What the binary does once configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    Online,
    Snapshot,
}

impl RunMode {
    fn parse(raw: Option<&str>) -> anyhow::Result<Self> {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            None | Some("" | "online") => Ok(Self::Online),
            Some("snapshot") => Ok(Self::Snapshot),
            Some(other) => anyhow::bail!("PFS_MODE must be 'online' or 'snapshot', got '{other}'"),
        }
    }
}

/// Logs every event and restores the configured tickers on each open.
struct LoggingListener {
    tickers: Vec<String>,
}

impl QuoteListener for LoggingListener {
    fn on_start_connect(&self) {
        tracing::info!("Connecting");
    }

    fn on_connected(&self) {
        tracing::info!("Connected, opening session");
    }

    fn on_opened(&self, session_id: &str) {
        tracing::info!(session_id, "Session open");
    }

    fn resubscribe_tickers(&self, _session_id: &str) -> Option<Vec<String>> {
        Some(self.tickers.clone())
    }

    fn on_connection_lost(&self, error: &ClientError) {
        tracing::warn!(error = %error, "Connection lost");
    }

    fn on_reconnect_failed(&self, error: &ClientError) {
        tracing::error!(error = %error, "Reconnect failed");
    }

    fn on_session_finished_by_new_login(&self) {
        tracing::warn!("Session finished: the access id logged in elsewhere");
    }

    fn on_disposed(&self) {
        tracing::info!("Client disposed");
    }

    fn on_quote(&self, quote: &Quote) {
        tracing::info!(quote = %quote, "Quote");
    }

    fn on_last_price(&self, last_price: &LastPrice) {
        tracing::info!(ticker = %last_price.ticker, price = %last_price.price, "Last price");
    }

    fn on_trade(&self, trade: &Trade) {
        tracing::info!(ticker = %trade.ticker, price = %trade.price, volume = ?trade.volume, "Trade");
    }

    fn on_ping(&self, ping: &Ping) {
        tracing::debug!(ping_id = %ping.ping_id, round_trip = ?ping.round_trip, "Ping");
    }

    fn on_result(&self, result: &ResultMessage) {
        tracing::info!(result = %result, "Result");
    }

    fn on_decode_error(&self, error: &ClientError) {
        tracing::warn!(error = %error, "Skipped message");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init().context("failed to initialize telemetry")?;

    tracing::info!("Starting PFS quote client");

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Metrics recorder not installed");
    }

    let config = ClientConfig::from_env().context("invalid client configuration")?;
    let mode = RunMode::parse(std::env::var("PFS_MODE").ok().as_deref())?;
    let tickers: Vec<String> = std::env::var("PFS_TICKERS")
        .unwrap_or_else(|_| DEFAULT_TICKERS.to_string())
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    let label =
        std::env::var("PFS_CLIENT_LABEL").unwrap_or_else(|_| DEFAULT_CLIENT_LABEL.to_string());

    tracing::info!(
        url = %config.server_url,
        mode = ?mode,
        tickers = ?tickers,
        client = %label,
        "Configuration loaded"
    );

    match mode {
        RunMode::Online => run_online(config, tickers, label).await,
        RunMode::Snapshot => run_snapshot(config, &tickers).await,
    }
}

/// Stream until a shutdown signal or a terminal session error.
async fn run_online(config: ClientConfig, tickers: Vec<String>, label: String) -> anyhow::Result<()> {
    let client = QuoteClient::new(config);
    client.add_listener(Arc::new(LoggingListener {
        tickers: tickers.clone(),
    }));
    client.set_tickers(&tickers)?;
    client.start(label)?;

    let status = client.watch_status();
    let outcome = tokio::select! {
        () = await_shutdown() => Ok(()),
        terminal = await_terminal(status) => Err(terminal),
    };

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, client.shutdown())
        .await
        .is_err()
    {
        tracing::warn!("Shutdown timed out");
    }

    outcome.map_err(anyhow::Error::from)
}

/// Query once and print the rows.
async fn run_snapshot(config: ClientConfig, tickers: &[String]) -> anyhow::Result<()> {
    let client = QuoteClient::new(config);
    let rows = client.query_snapshot(tickers).await?;

    tracing::info!(rows = rows.len(), "Snapshot received");
    for row in &rows {
        println!(
            "{}\tbid={}\task={}\tlast={}\t{}",
            row.ticker,
            display_opt(row.bid.as_ref()),
            display_opt(row.ask.as_ref()),
            display_opt(row.last.as_ref()),
            display_opt(row.timestamp.as_ref()),
        );
    }

    client.shutdown().await;
    Ok(())
}

fn display_opt<T: std::fmt::Display>(value: Option<&T>) -> String {
    value.map_or_else(|| "-".to_string(), ToString::to_string)
}

/// Resolve once the session ends for good.
async fn await_terminal(mut status: watch::Receiver<SessionStatus>) -> ClientError {
    loop {
        if let Some(terminal) = status.borrow_and_update().terminal.clone() {
            return terminal;
        }
        if status.changed().await.is_err() {
            return ClientError::Disposed;
        }
    }
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
