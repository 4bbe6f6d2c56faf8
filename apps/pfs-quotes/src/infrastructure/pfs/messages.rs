//! PFS WebSocket Message Types
//!
//! Wire format types for the quote server's JSON protocol. Every message
//! carries a `msg` discriminator; the server may batch several messages
//! into one JSON array per frame.
//!
//! # Message Types
//!
//! ## Client → Server
//! - `open`: Open a session for an access id
//! - `update`: Replace the streamed ticker set (always the full set)
//! - `ping`: Application heartbeat
//! - `snapshot`: One-shot market data query
//! - `close`: Orderly session shutdown
//!
//! ## Server → Client
//! - `init`: Session opened, carries the session id
//! - `ping`: Heartbeat reply
//! - `finish`: Session ended because of a newer login
//! - `quote`, `lastprice`, `trade`: Streaming market data
//! - `result`: Result notice
//! - `marketdata`: Snapshot response

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};

use crate::domain::streaming::{LastPrice, MarketDatum, Quote, ResultMessage, Trade};

/// Server timestamp layouts, tried in order before falling back to RFC 3339.
const UTCDT_FORMATS: [&str; 2] = ["%d-%m-%Y %H:%M:%S%.f", "%d-%m-%Y %H:%M:%S"];

// =============================================================================
// Client Requests
// =============================================================================

/// Session mode requested in the `open` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Streaming session.
    #[default]
    Online,
    /// Query-only session: no streaming updates.
    Snapshot,
}

impl SessionMode {
    /// Mode from the `snapshot_mode` flag.
    #[must_use]
    pub const fn from_snapshot_flag(snapshot_mode: bool) -> Self {
        if snapshot_mode {
            Self::Snapshot
        } else {
            Self::Online
        }
    }
}

/// Requests sent by the client.
///
/// # Wire Format (JSON)
/// ```json
/// {"msg":"open","sid":"<access id>","client":"demo","mode":"online"}
/// {"msg":"update","sid":"S1","tickers":["gold","silver"]}
/// {"msg":"ping","sid":"S1","pid":"3"}
/// {"msg":"snapshot","sid":"S1","tickers":["gold"]}
/// {"msg":"close","sid":"S1"}
/// ```
#[derive(Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum ClientRequest {
    /// Open a session.
    Open {
        /// Access id issued by the operator.
        sid: String,
        /// Free-form client label.
        client: String,
        /// Requested session mode.
        mode: SessionMode,
    },
    /// Replace the streamed ticker set.
    Update {
        /// Session id.
        sid: String,
        /// Full ticker set.
        tickers: Vec<String>,
    },
    /// Heartbeat.
    Ping {
        /// Session id.
        sid: String,
        /// Ping id, echoed back by the server.
        pid: String,
    },
    /// One-shot market data query.
    Snapshot {
        /// Session id.
        sid: String,
        /// Requested tickers.
        tickers: Vec<String>,
    },
    /// Orderly shutdown.
    Close {
        /// Session id.
        sid: String,
    },
}

impl ClientRequest {
    /// The `msg` discriminator, for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Open { .. } => "open",
            Self::Update { .. } => "update",
            Self::Ping { .. } => "ping",
            Self::Snapshot { .. } => "snapshot",
            Self::Close { .. } => "close",
        }
    }
}

impl std::fmt::Debug for ClientRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open { client, mode, .. } => f
                .debug_struct("Open")
                .field("sid", &"[REDACTED]")
                .field("client", client)
                .field("mode", mode)
                .finish(),
            Self::Update { sid, tickers } => f
                .debug_struct("Update")
                .field("sid", sid)
                .field("tickers", tickers)
                .finish(),
            Self::Ping { sid, pid } => f
                .debug_struct("Ping")
                .field("sid", sid)
                .field("pid", pid)
                .finish(),
            Self::Snapshot { sid, tickers } => f
                .debug_struct("Snapshot")
                .field("sid", sid)
                .field("tickers", tickers)
                .finish(),
            Self::Close { sid } => f.debug_struct("Close").field("sid", sid).finish(),
        }
    }
}

// =============================================================================
// Server Messages
// =============================================================================

/// Decoded server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Session opened.
    Init(InitMessage),
    /// Heartbeat reply.
    Ping(PingMessage),
    /// Session ended by a newer login.
    Finish,
    /// Streaming quote.
    Quote(QuoteMessage),
    /// Last price update.
    LastPrice(LastPriceMessage),
    /// Trade print.
    Trade(TradeMessage),
    /// Result notice.
    Result(ResultNotice),
    /// Snapshot response.
    MarketData(MarketDataMessage),
}

impl ServerMessage {
    /// The `msg` discriminator, for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Init(_) => "init",
            Self::Ping(_) => "ping",
            Self::Finish => "finish",
            Self::Quote(_) => "quote",
            Self::LastPrice(_) => "lastprice",
            Self::Trade(_) => "trade",
            Self::Result(_) => "result",
            Self::MarketData(_) => "marketdata",
        }
    }
}

/// Session acknowledgement.
///
/// # Wire Format (JSON)
/// ```json
/// {"msg":"init","sid":"S1"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InitMessage {
    /// Server-assigned session id.
    #[serde(deserialize_with = "de_string_or_number")]
    pub sid: String,
}

/// Heartbeat reply.
///
/// # Wire Format (JSON)
/// ```json
/// {"msg":"ping","pid":"3"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PingMessage {
    /// Ping id; the server may send it as a number.
    #[serde(deserialize_with = "de_string_or_number")]
    pub pid: String,
}

/// Streaming quote.
///
/// # Wire Format (JSON)
/// ```json
/// {"msg":"quote","ticker":"gold","bid":1950.1,"ask":1950.6,"utcdt":"05-03-2024 14:07:09.125000"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QuoteMessage {
    /// Instrument.
    pub ticker: String,
    /// Bid price.
    pub bid: Decimal,
    /// Ask price.
    pub ask: Decimal,
    /// Server timestamp (UTC).
    #[serde(deserialize_with = "de_utcdt")]
    pub utcdt: DateTime<Utc>,
}

/// Last price update.
///
/// # Wire Format (JSON)
/// ```json
/// {"msg":"lastprice","ticker":"silver","price":23.41,"utcdt":"05-03-2024 14:07:09.125000"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LastPriceMessage {
    /// Instrument.
    pub ticker: String,
    /// Last price.
    pub price: Decimal,
    /// Server timestamp (UTC).
    #[serde(deserialize_with = "de_utcdt")]
    pub utcdt: DateTime<Utc>,
}

/// Trade print.
///
/// # Wire Format (JSON)
/// ```json
/// {"msg":"trade","ticker":"gold","price":1950.3,"volume":2,"utcdt":"05-03-2024 14:07:09"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TradeMessage {
    /// Instrument.
    pub ticker: String,
    /// Execution price.
    pub price: Decimal,
    /// Executed volume.
    #[serde(default)]
    pub volume: Option<Decimal>,
    /// Server timestamp (UTC).
    #[serde(deserialize_with = "de_utcdt")]
    pub utcdt: DateTime<Utc>,
}

/// Result notice.
///
/// # Wire Format (JSON)
/// ```json
/// {"msg":"result","code":0,"text":"ok"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResultNotice {
    /// Result code; zero is success.
    pub code: i32,
    /// Description.
    #[serde(default)]
    pub text: Option<String>,
}

/// Snapshot response.
///
/// # Wire Format (JSON)
/// ```json
/// {"msg":"marketdata","data":[{"ticker":"gold","bid":1950.1,"ask":1950.6,"last":1950.3}]}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MarketDataMessage {
    /// One row per ticker the server knows about.
    #[serde(default)]
    pub data: Vec<MarketDataRow>,
}

/// One snapshot row.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MarketDataRow {
    /// Instrument.
    pub ticker: String,
    /// Bid price.
    #[serde(default)]
    pub bid: Option<Decimal>,
    /// Ask price.
    #[serde(default)]
    pub ask: Option<Decimal>,
    /// Last price.
    #[serde(default)]
    pub last: Option<Decimal>,
    /// Server timestamp (UTC).
    #[serde(default, deserialize_with = "de_opt_utcdt")]
    pub utcdt: Option<DateTime<Utc>>,
}

// =============================================================================
// Domain Conversions
// =============================================================================

impl From<QuoteMessage> for Quote {
    fn from(msg: QuoteMessage) -> Self {
        Self {
            ticker: msg.ticker,
            bid: msg.bid,
            ask: msg.ask,
            timestamp: msg.utcdt,
        }
    }
}

impl From<LastPriceMessage> for LastPrice {
    fn from(msg: LastPriceMessage) -> Self {
        Self {
            ticker: msg.ticker,
            price: msg.price,
            timestamp: msg.utcdt,
        }
    }
}

impl From<TradeMessage> for Trade {
    fn from(msg: TradeMessage) -> Self {
        Self {
            ticker: msg.ticker,
            price: msg.price,
            volume: msg.volume,
            timestamp: msg.utcdt,
        }
    }
}

impl From<ResultNotice> for ResultMessage {
    fn from(msg: ResultNotice) -> Self {
        Self {
            code: msg.code,
            text: msg.text.unwrap_or_default(),
        }
    }
}

impl From<MarketDataRow> for MarketDatum {
    fn from(row: MarketDataRow) -> Self {
        Self {
            ticker: row.ticker,
            bid: row.bid,
            ask: row.ask,
            last: row.last,
            timestamp: row.utcdt,
        }
    }
}

// =============================================================================
// Field Helpers
// =============================================================================

/// Parse a server timestamp.
///
/// Accepts `DD-MM-YYYY HH:MM:SS[.ffffff]` (UTC) and RFC 3339.
///
/// # Errors
///
/// Returns a description of the input when no layout matches.
pub fn parse_utcdt(raw: &str) -> Result<DateTime<Utc>, String> {
    let trimmed = raw.trim();
    for format in UTCDT_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(naive.and_utc());
        }
    }
    DateTime::parse_from_rfc3339(trimmed)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| format!("unrecognized timestamp {trimmed:?}"))
}

fn de_utcdt<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_utcdt(&raw).map_err(serde::de::Error::custom)
}

fn de_opt_utcdt<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(raw) if !raw.trim().is_empty() => parse_utcdt(&raw)
            .map(Some)
            .map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}

fn de_string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike};
    use test_case::test_case;

    #[test]
    fn open_request_wire_format() {
        let request = ClientRequest::Open {
            sid: "secret-id".to_string(),
            client: "demo".to_string(),
            mode: SessionMode::Snapshot,
        };

        let json: serde_json::Value = serde_json::to_value(&request).unwrap();

        assert_eq!(
            json,
            serde_json::json!({"msg":"open","sid":"secret-id","client":"demo","mode":"snapshot"})
        );
    }

    #[test]
    fn open_request_debug_redacts_access_id() {
        let request = ClientRequest::Open {
            sid: "secret-id".to_string(),
            client: "demo".to_string(),
            mode: SessionMode::Online,
        };

        let debug = format!("{request:?}");
        assert!(!debug.contains("secret-id"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn update_request_carries_full_ticker_list() {
        let request = ClientRequest::Update {
            sid: "S1".to_string(),
            tickers: vec!["gold".to_string(), "silver".to_string()],
        };

        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(
            json,
            r#"{"msg":"update","sid":"S1","tickers":["gold","silver"]}"#
        );
        assert_eq!(request.kind(), "update");
    }

    #[test]
    fn utcdt_with_microseconds() {
        let dt = parse_utcdt("05-03-2024 14:07:09.125000").unwrap();
        assert_eq!((dt.day(), dt.month(), dt.year()), (5, 3, 2024));
        assert_eq!((dt.hour(), dt.minute(), dt.second()), (14, 7, 9));
        assert_eq!(dt.nanosecond(), 125_000_000);
    }

    #[test_case("05-03-2024 14:07:09" ; "without fraction")]
    #[test_case("2024-03-05T14:07:09Z" ; "rfc3339")]
    #[test_case("2024-03-05T17:07:09+03:00" ; "rfc3339 with offset")]
    fn utcdt_alternative_layouts(raw: &str) {
        let expected = Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();
        assert_eq!(parse_utcdt(raw).unwrap(), expected);
    }

    #[test]
    fn utcdt_rejects_garbage() {
        assert!(parse_utcdt("yesterday").is_err());
    }

    #[test]
    fn quote_accepts_string_prices() {
        let quote: QuoteMessage = serde_json::from_str(
            r#"{"ticker":"JPYRUB","bid":"0.6012","ask":"0.6020","utcdt":"05-03-2024 14:07:09.000001"}"#,
        )
        .unwrap();

        let quote = Quote::from(quote);
        assert_eq!(quote.ticker, "JPYRUB");
        assert_eq!(quote.bid, "0.6012".parse::<Decimal>().unwrap());
    }

    #[test]
    fn ping_reply_accepts_numeric_id() {
        let ping: PingMessage = serde_json::from_str(r#"{"pid":7}"#).unwrap();
        assert_eq!(ping.pid, "7");
    }

    #[test]
    fn market_data_row_with_missing_fields() {
        let md: MarketDataMessage =
            serde_json::from_str(r#"{"data":[{"ticker":"gold","last":1950.3},{"ticker":"silver","utcdt":""}]}"#)
                .unwrap();

        let rows: Vec<MarketDatum> = md.data.into_iter().map(MarketDatum::from).collect();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].last.is_some());
        assert!(rows[0].bid.is_none());
        assert!(rows[1].timestamp.is_none());
        assert!(!rows[1].has_prices());
    }

    #[test]
    fn result_notice_without_text() {
        let notice: ResultNotice = serde_json::from_str(r#"{"code":2}"#).unwrap();
        let result = ResultMessage::from(notice);
        assert_eq!(result.code, 2);
        assert!(result.text.is_empty());
    }
}
