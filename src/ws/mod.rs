//! WebSocket transport layer.
//!
//! The synchronization core talks to the wire through the [`Transport`]
//! trait: subscribe/unsubscribe requests that resolve on server
//! acknowledgment, plus teardown. [`native::WsTransport`] is the production
//! implementation over `tokio-tungstenite`; tests substitute an in-memory
//! transport.

pub mod native;

use crate::error::WsError;
use async_trait::async_trait;

/// Outbound side of the persistent connection.
///
/// Both request methods suspend the caller until the server acknowledges the
/// command (or the transport fails). Inbound traffic does not flow through
/// this trait: the transport pushes raw frames into the dispatcher's ingress
/// directly.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn subscribe(&self, streams: &[String]) -> Result<(), WsError>;
    async fn unsubscribe(&self, streams: &[String]) -> Result<(), WsError>;
    async fn close(&self) -> Result<(), WsError>;
}

/// Configuration for the native WebSocket transport.
#[derive(Debug, Clone)]
pub struct WsConfig {
    pub url: String,
    pub reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub base_reconnect_delay_ms: u32,
    /// How long a subscribe/unsubscribe waits for its acknowledgment.
    pub ack_timeout_ms: u64,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            url: crate::network::DEFAULT_WS_URL.to_string(),
            reconnect: true,
            max_reconnect_attempts: 10,
            base_reconnect_delay_ms: 500,
            ack_timeout_ms: 10_000,
        }
    }
}
