//! Local order-book state: sorted price levels and the queryable handle.

pub(crate) mod sync;

use crate::shared::Symbol;
use crate::wire::Level;
use rust_decimal::Decimal;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

/// Sorted bid/ask price levels for one symbol.
///
/// `BTreeMap` with `Decimal` keys tracks levels without precision loss.
/// Bids are keyed by `Reverse<Decimal>` so iteration yields highest price
/// first; asks iterate lowest first.
#[derive(Debug, Default)]
pub(crate) struct OrderBook {
    bids: BTreeMap<Reverse<Decimal>, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    last_update_id: u64,
}

impl OrderBook {
    /// Replace all levels with a snapshot's contents.
    pub fn load_snapshot(&mut self, bids: &[Level], asks: &[Level], update_id: u64) {
        self.bids.clear();
        self.asks.clear();
        self.apply_levels(bids, asks);
        self.last_update_id = update_id;
    }

    /// Merge diff levels: zero quantity removes the level, anything else
    /// inserts or replaces it.
    pub fn apply_levels(&mut self, bids: &[Level], asks: &[Level]) {
        for &(price, quantity) in bids {
            if quantity.is_zero() {
                self.bids.remove(&Reverse(price));
            } else {
                self.bids.insert(Reverse(price), quantity);
            }
        }
        for &(price, quantity) in asks {
            if quantity.is_zero() {
                self.asks.remove(&price);
            } else {
                self.asks.insert(price, quantity);
            }
        }
    }

    pub fn set_last_update_id(&mut self, id: u64) {
        self.last_update_id = id;
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    /// Bids as `(price, quantity)`, highest price first.
    pub fn bids_vec(&self) -> Vec<Level> {
        self.bids.iter().map(|(Reverse(p), q)| (*p, *q)).collect()
    }

    /// Asks as `(price, quantity)`, lowest price first.
    pub fn asks_vec(&self) -> Vec<Level> {
        self.asks.iter().map(|(p, q)| (*p, *q)).collect()
    }

    pub fn best_bid(&self) -> Option<Level> {
        self.bids.iter().next().map(|(Reverse(p), q)| (*p, *q))
    }

    pub fn best_ask(&self) -> Option<Level> {
        self.asks.iter().next().map(|(p, q)| (*p, *q))
    }

    /// `(bid levels, ask levels)` currently tracked.
    pub fn level_counts(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }
}

/// Payload delivered to [`OrderBookReceiver`](crate::handler::OrderBookReceiver)s
/// after each successful snapshot or diff application: derived views of the
/// book at that revision, not the raw diff.
#[derive(Debug, Clone, PartialEq)]
pub struct BookUpdate {
    pub symbol: Symbol,
    pub last_update_id: u64,
    /// Highest price first.
    pub bids: Vec<Level>,
    /// Lowest price first.
    pub asks: Vec<Level>,
}

/// Queryable handle onto one symbol's synchronized book.
///
/// Cheap to clone; all clones observe the same underlying state. A handle
/// obtained before the subscription exists becomes live once the symbol's
/// diff stream is subscribed and synchronized.
#[derive(Clone)]
pub struct OrderBookHandle {
    pub(crate) sync: Arc<sync::BookSync>,
}

impl OrderBookHandle {
    pub fn symbol(&self) -> &Symbol {
        self.sync.symbol()
    }

    /// `true` once the book has been reconciled against a snapshot.
    pub fn is_ready(&self) -> bool {
        self.sync.is_ready()
    }

    /// Independently materialized bid levels, highest price first.
    ///
    /// Two calls with no intervening book change return equal vectors.
    pub fn bids(&self) -> Vec<Level> {
        self.sync.bids()
    }

    /// Independently materialized ask levels, lowest price first.
    pub fn asks(&self) -> Vec<Level> {
        self.sync.asks()
    }

    pub fn best_bid(&self) -> Option<Level> {
        self.sync.best_bid()
    }

    pub fn best_ask(&self) -> Option<Level> {
        self.sync.best_ask()
    }

    /// Mid price (average of best bid and best ask).
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some((bid, _)), Some((ask, _))) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        }
    }

    /// Spread between best ask and best bid.
    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some((bid, _)), Some((ask, _))) => Some(ask - bid),
            _ => None,
        }
    }

    /// `(bid levels, ask levels)` currently tracked.
    pub fn depth(&self) -> (usize, usize) {
        self.sync.level_counts()
    }

    pub fn last_update_id(&self) -> u64 {
        self.sync.last_update_id()
    }

    /// Resolves on the next observable book change (snapshot or diff apply)
    /// after the call. The revision is recorded when `updated` is *called*,
    /// not when the future is first polled, so a change between the call and
    /// the await still resolves the future. Purely a notification: a waiter
    /// that missed a change waits for the following one.
    pub fn updated(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.sync.subscribe_revision();
        async move {
            // Err means the sync was dropped; resolve rather than hang.
            let _ = rx.changed().await;
        }
    }
}
