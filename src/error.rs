//! Unified SDK error types.

use thiserror::Error;

/// Top-level SDK error.
#[derive(Error, Debug)]
pub enum SdkError {
    /// A registered handler exposes no recognized receive capability.
    #[error("handler implements no recognized feed capability")]
    InvalidHandlerKind,

    /// Subscribe parameters are invalid for the given feed kind (e.g. missing symbol).
    #[error("invalid parameters for feed kind {kind}: {reason}")]
    InvalidFeedTypeParams { kind: &'static str, reason: String },

    /// Subscribe called with a structurally invalid parameter list, independent
    /// of feed kind (wrong arity).
    #[error("invalid subscription parameter list: expected at most {max} parameter(s), got {got}")]
    InvalidSubscriptionParams { max: usize, got: usize },

    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),

    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// WebSocket transport errors.
#[derive(Error, Debug)]
pub enum WsError {
    #[error("Not connected")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Server rejected request: {0}")]
    Rejected(String),

    #[error("Request timed out waiting for acknowledgment")]
    AckTimeout,

    #[error("Connection closed: code={code:?} reason={reason}")]
    Closed { code: Option<u16>, reason: String },
}

/// HTTP-layer errors (depth snapshot endpoint).
#[derive(Error, Debug)]
pub enum HttpError {
    #[error("Request failed: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Server error {status}: {body}")]
    ServerError { status: u16, body: String },

    #[error("Rate limited (retry after {retry_after_ms:?}ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Max retries exceeded after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: String },
}
