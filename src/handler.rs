//! Handler registration — capability traits and the registry.
//!
//! A handler declares which feed categories it can receive by overriding the
//! corresponding probe on [`MarketHandler`]. Registration rejects handlers
//! that expose no capability at all, so a misconfigured handler fails loudly
//! at registration time rather than sitting silently unreachable.

use crate::book::BookUpdate;
use crate::error::SdkError;
use crate::shared::FeedKind;
use crate::wire::TickerEvent;
use async_trait::async_trait;
use std::sync::Arc;

/// Error produced by a failing data handler.
///
/// The dispatcher hands this exact value to the entry's exception receiver,
/// so a caller can downcast back to the concrete type it raised.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Receives ticker events.
#[async_trait]
pub trait TickerReceiver: Send + Sync {
    async fn receive(&self, event: TickerEvent) -> Result<(), HandlerError>;
}

/// Receives synchronized order-book updates (derived views, not raw diffs).
#[async_trait]
pub trait OrderBookReceiver: Send + Sync {
    async fn receive(&self, update: BookUpdate) -> Result<(), HandlerError>;
}

/// Receives errors raised by the paired data handler.
#[async_trait]
pub trait ExceptionReceiver: Send + Sync {
    async fn receive(&self, error: HandlerError);
}

/// Capability probe implemented by every registrable handler.
///
/// Override the probe for each feed category the handler consumes,
/// returning `Some(self)`:
///
/// ```ignore
/// struct Printer;
///
/// #[async_trait]
/// impl TickerReceiver for Printer {
///     async fn receive(&self, event: TickerEvent) -> Result<(), HandlerError> {
///         println!("{}: {:?}", event.symbol, event.last_price);
///         Ok(())
///     }
/// }
///
/// impl MarketHandler for Printer {
///     fn as_ticker(self: Arc<Self>) -> Option<Arc<dyn TickerReceiver>> {
///         Some(self)
///     }
/// }
/// ```
pub trait MarketHandler: Send + Sync {
    fn as_ticker(self: Arc<Self>) -> Option<Arc<dyn TickerReceiver>> {
        None
    }

    fn as_order_book(self: Arc<Self>) -> Option<Arc<dyn OrderBookReceiver>> {
        None
    }
}

/// A registered (data handler, optional exception handler) pair, resolved to
/// its concrete capabilities at registration time.
#[derive(Clone)]
pub(crate) struct HandlerEntry {
    pub ticker: Option<Arc<dyn TickerReceiver>>,
    pub order_book: Option<Arc<dyn OrderBookReceiver>>,
    pub exception: Option<Arc<dyn ExceptionReceiver>>,
}

/// Ordered handler storage. Fan-out order equals registration order.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    entries: Vec<HandlerEntry>,
}

impl HandlerRegistry {
    pub fn register(
        &mut self,
        handler: Arc<dyn MarketHandler>,
        exception: Option<Arc<dyn ExceptionReceiver>>,
    ) -> Result<(), SdkError> {
        let ticker = handler.clone().as_ticker();
        let order_book = handler.as_order_book();

        if ticker.is_none() && order_book.is_none() {
            return Err(SdkError::InvalidHandlerKind);
        }

        self.entries.push(HandlerEntry {
            ticker,
            order_book,
            exception,
        });
        Ok(())
    }

    /// Entries whose data handler declares the given feed category, in
    /// registration order.
    pub fn entries_for(&self, kind: FeedKind) -> Vec<HandlerEntry> {
        self.entries
            .iter()
            .filter(|e| match kind {
                FeedKind::Ticker => e.ticker.is_some(),
                FeedKind::OrderBook => e.order_book.is_some(),
            })
            .cloned()
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
