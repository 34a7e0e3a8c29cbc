//! Streaming market-data client for the Binance spot exchange.
//!
//! The crate is layered:
//!
//! - **shared** — symbol and feed-kind newtypes used by every layer.
//! - **wire** — serde types for the stream protocol: events, depth diffs,
//!   snapshots, and subscribe/unsubscribe commands.
//! - **handler** — the receiver traits user code implements and the registry
//!   that fans events out to them.
//! - **book** — local order-book state and the snapshot/diff synchronizer
//!   that keeps it consistent with the exchange.
//! - **ws** / **http** — the production transports: a persistent WebSocket
//!   for the diff stream and a REST client for depth snapshots. Both sit
//!   behind traits so tests run without a network.
//! - **client** — [`MarketClient`], the session value tying it together.
//!
//! # Example
//!
//! ```no_run
//! use binance_streams::prelude::*;
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! #[async_trait::async_trait]
//! impl OrderBookReceiver for Printer {
//!     async fn receive(&self, update: BookUpdate) -> Result<(), HandlerError> {
//!         println!("{} best bid: {:?}", update.symbol, update.bids.first());
//!         Ok(())
//!     }
//! }
//!
//! impl MarketHandler for Printer {
//!     fn as_order_book(self: Arc<Self>) -> Option<Arc<dyn OrderBookReceiver>> {
//!         Some(self)
//!     }
//! }
//!
//! # async fn run() -> Result<(), SdkError> {
//! let client = MarketClient::builder().connect().await?;
//! client.handler(Arc::new(Printer))?;
//! client.subscribe(FeedKind::OrderBook, &["BTCUSDT"]).await?;
//!
//! let book = client.order_book("BTCUSDT");
//! book.updated().await;
//! println!("spread: {:?}", book.spread());
//! # Ok(())
//! # }
//! ```

pub mod book;
pub mod client;
pub mod error;
pub mod handler;
pub mod http;
pub mod network;
pub mod shared;
pub mod subscriptions;
pub mod wire;
pub mod ws;

mod dispatch;

pub use book::sync::BridgeRule;
pub use book::{BookUpdate, OrderBookHandle};
pub use client::{MarketClient, MarketClientBuilder};
pub use error::{HttpError, SdkError, WsError};
pub use handler::{
    ExceptionReceiver, HandlerError, MarketHandler, OrderBookReceiver, TickerReceiver,
};
pub use shared::{FeedKind, Symbol};

/// Convenience re-exports for typical client code.
pub mod prelude {
    pub use crate::book::sync::BridgeRule;
    pub use crate::book::{BookUpdate, OrderBookHandle};
    pub use crate::client::{MarketClient, MarketClientBuilder};
    pub use crate::error::{HttpError, SdkError, WsError};
    pub use crate::handler::{
        ExceptionReceiver, HandlerError, MarketHandler, OrderBookReceiver, TickerReceiver,
    };
    pub use crate::http::retry::RetryConfig;
    pub use crate::http::SnapshotFetcher;
    pub use crate::shared::{FeedKind, Symbol};
    pub use crate::subscriptions::Subscription;
    pub use crate::wire::{DepthDiff, DepthSnapshot, Level, TickerEvent};
    pub use crate::ws::{Transport, WsConfig};
}
