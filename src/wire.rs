//! Wire types for the exchange protocol (WebSocket stream + REST snapshot).
//!
//! Prices and quantities are decimal strings on the wire; `rust_decimal`'s
//! `serde-str` feature parses them without precision loss.

use crate::shared::Symbol;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single price level: `(price, quantity)`, sent as a two-element array
/// of decimal strings.
pub type Level = (Decimal, Decimal);

// ─── Inbound messages ────────────────────────────────────────────────────────

/// Raw inbound frame from the stream endpoint.
///
/// The exchange multiplexes three shapes over one socket: command
/// acknowledgments, combined-stream envelopes, and bare event payloads.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageIn {
    Ack(CommandAck),
    Envelope { stream: String, data: MarketEvent },
    Event(MarketEvent),
}

/// A market-data event, discriminated by the `e` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "e")]
pub enum MarketEvent {
    #[serde(rename = "24hrTicker")]
    Ticker(TickerEvent),
    #[serde(rename = "depthUpdate")]
    DepthDiff(DepthDiff),
}

impl MarketEvent {
    pub fn symbol(&self) -> &Symbol {
        match self {
            MarketEvent::Ticker(t) => &t.symbol,
            MarketEvent::DepthDiff(d) => &d.symbol,
        }
    }
}

/// 24h rolling-window ticker payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TickerEvent {
    #[serde(rename = "E", default)]
    pub event_time_ms: i64,
    #[serde(rename = "s")]
    pub symbol: Symbol,
    #[serde(rename = "c", default)]
    pub last_price: Option<Decimal>,
    #[serde(rename = "o", default)]
    pub open_price: Option<Decimal>,
    #[serde(rename = "h", default)]
    pub high_price: Option<Decimal>,
    #[serde(rename = "l", default)]
    pub low_price: Option<Decimal>,
    #[serde(rename = "v", default)]
    pub volume: Option<Decimal>,
}

impl TickerEvent {
    /// Event time as a UTC timestamp, when the exchange provided one.
    pub fn event_time(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_millis(self.event_time_ms)
            .filter(|_| self.event_time_ms != 0)
    }
}

/// Incremental order-book update covering update ids
/// `first_update_id..=final_update_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DepthDiff {
    #[serde(rename = "E", default)]
    pub event_time_ms: i64,
    #[serde(rename = "s")]
    pub symbol: Symbol,
    #[serde(rename = "U")]
    pub first_update_id: u64,
    #[serde(rename = "u")]
    pub final_update_id: u64,
    #[serde(rename = "b", default)]
    pub bids: Vec<Level>,
    #[serde(rename = "a", default)]
    pub asks: Vec<Level>,
}

/// Full order-book snapshot from the REST depth endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DepthSnapshot {
    pub last_update_id: u64,
    #[serde(default)]
    pub bids: Vec<Level>,
    #[serde(default)]
    pub asks: Vec<Level>,
}

// ─── Outbound messages ───────────────────────────────────────────────────────

/// Stream-management command sent to the server.
#[derive(Debug, Clone, Serialize)]
pub struct CommandOut {
    pub method: Method,
    pub params: Vec<String>,
    pub id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Method {
    #[serde(rename = "SUBSCRIBE")]
    Subscribe,
    #[serde(rename = "UNSUBSCRIBE")]
    Unsubscribe,
}

/// Acknowledgment for a [`CommandOut`], matched by `id`.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandAck {
    pub id: u64,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<AckError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AckError {
    pub code: i64,
    pub msg: String,
}
