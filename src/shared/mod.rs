//! Shared newtypes used across all modules.
//!
//! These types are serialization-transparent: they serialize/deserialize
//! identically to the raw format the exchange sends, so they can be used
//! directly in wire types without conversion overhead.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::str::FromStr;

// ─── Symbol ──────────────────────────────────────────────────────────────────

/// Trading pair symbol (e.g. `"BTCUSDT"`).
///
/// Normalized to uppercase on construction so that `"btcusdt"` and
/// `"BTCUSDT"` compare and hash identically. Stream names derived from a
/// symbol are lowercase, per the exchange's stream naming convention.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(s: impl AsRef<str>) -> Self {
        Self(s.as_ref().trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercase form used in stream identifiers (`btcusdt@depth`).
    pub fn to_stream_form(&self) -> String {
        self.0.to_ascii_lowercase()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl FromStr for Symbol {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl Serialize for Symbol {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Symbol {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Symbol::new(s))
    }
}

// ─── FeedKind ────────────────────────────────────────────────────────────────

/// Category of streaming data. The set is designed to grow; the dispatch and
/// subscription layers match on it exhaustively so additions are caught at
/// compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedKind {
    /// 24h rolling-window ticker for a single symbol.
    Ticker,
    /// Order-book diff stream for a single symbol.
    OrderBook,
}

impl FeedKind {
    /// Stream-name suffix, e.g. `depth` in `btcusdt@depth`.
    pub fn stream_suffix(&self) -> &'static str {
        match self {
            FeedKind::Ticker => "ticker",
            FeedKind::OrderBook => "depth",
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            FeedKind::Ticker => "TICKER",
            FeedKind::OrderBook => "ORDER_BOOK",
        }
    }
}

impl std::fmt::Display for FeedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
