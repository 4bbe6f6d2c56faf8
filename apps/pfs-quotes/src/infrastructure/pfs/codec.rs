//! Frame Codec
//!
//! Turns WebSocket text frames into [`ServerMessage`]s and requests into
//! frames. A frame holds one JSON object or an array of objects; each
//! element decodes on its own, so one bad element does not poison the
//! rest of the frame.

use serde_json::Value;

use super::messages::{
    ClientRequest, InitMessage, LastPriceMessage, MarketDataMessage, PingMessage, QuoteMessage,
    ResultNotice, ServerMessage, TradeMessage,
};

/// Maximum number of characters of a bad frame quoted in errors.
const PREVIEW_CHARS: usize = 50;

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// The `msg` discriminator names a message this client does not know.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// The element has no string `msg` field.
    #[error("message has no \"msg\" field: {0}")]
    MissingMessageType(String),

    /// The frame is not a JSON object or array.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// Frame encoding and decoding.
///
/// The session driver only talks to the server through this trait.
pub trait FrameCodec: Send + Sync + std::fmt::Debug {
    /// Decode one text frame into zero or more messages.
    ///
    /// Every element of the frame yields exactly one entry, in frame order.
    fn decode(&self, frame: &str) -> Vec<Result<ServerMessage, CodecError>>;

    /// Encode a request into a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    fn encode(&self, request: &ClientRequest) -> Result<String, CodecError>;
}

/// JSON codec for the quote server protocol.
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode a single JSON object by its `msg` field.
    fn decode_value(value: Value) -> Result<ServerMessage, CodecError> {
        let Some(kind) = value.get("msg").and_then(Value::as_str) else {
            return Err(CodecError::MissingMessageType(preview(&value.to_string())));
        };

        let message = match kind {
            "init" => ServerMessage::Init(serde_json::from_value::<InitMessage>(value)?),
            "ping" => ServerMessage::Ping(serde_json::from_value::<PingMessage>(value)?),
            "finish" => ServerMessage::Finish,
            "quote" => ServerMessage::Quote(serde_json::from_value::<QuoteMessage>(value)?),
            "lastprice" => {
                ServerMessage::LastPrice(serde_json::from_value::<LastPriceMessage>(value)?)
            }
            "trade" => ServerMessage::Trade(serde_json::from_value::<TradeMessage>(value)?),
            "result" => ServerMessage::Result(serde_json::from_value::<ResultNotice>(value)?),
            "marketdata" => {
                ServerMessage::MarketData(serde_json::from_value::<MarketDataMessage>(value)?)
            }
            other => return Err(CodecError::UnknownMessageType(other.to_string())),
        };

        Ok(message)
    }
}

impl FrameCodec for JsonCodec {
    fn decode(&self, frame: &str) -> Vec<Result<ServerMessage, CodecError>> {
        let trimmed = frame.trim();

        if !(trimmed.starts_with('[') || trimmed.starts_with('{')) {
            return vec![Err(CodecError::InvalidFormat(format!(
                "expected JSON array or object, got: {}",
                preview(trimmed)
            )))];
        }

        match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Array(elements)) => elements.into_iter().map(Self::decode_value).collect(),
            Ok(value) => vec![Self::decode_value(value)],
            Err(e) => vec![Err(CodecError::Json(e))],
        }
    }

    fn encode(&self, request: &ClientRequest) -> Result<String, CodecError> {
        Ok(serde_json::to_string(request)?)
    }
}

fn preview(text: &str) -> String {
    let mut out: String = text.chars().take(PREVIEW_CHARS).collect();
    if text.chars().count() > PREVIEW_CHARS {
        out.push_str("...");
    }
    out
}
