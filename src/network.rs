//! Network URL constants.

/// Default REST API base URL.
pub const DEFAULT_API_URL: &str = "https://api.binance.com";

/// Default WebSocket URL (raw stream endpoint, streams multiplexed via SUBSCRIBE).
pub const DEFAULT_WS_URL: &str = "wss://stream.binance.com:9443/ws";

/// Depth snapshot limit requested from the REST endpoint.
pub const DEPTH_SNAPSHOT_LIMIT: u16 = 1000;
