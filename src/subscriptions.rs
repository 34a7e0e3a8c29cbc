//! Subscription tracking and parameter validation.

use crate::error::SdkError;
use crate::shared::{FeedKind, Symbol};

/// An active `(feed kind, symbol)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub kind: FeedKind,
    pub symbol: Symbol,
}

impl Subscription {
    pub fn new(kind: FeedKind, symbol: Symbol) -> Self {
        Self { kind, symbol }
    }

    /// Canonical stream identifier, e.g. `btcusdt@depth`.
    pub fn stream_name(&self) -> String {
        format!("{}@{}", self.symbol.to_stream_form(), self.kind.stream_suffix())
    }
}

/// The set of active subscriptions, in insertion order.
///
/// Uniqueness invariant: no duplicate `(kind, symbol)` pairs. A `Vec` keeps
/// `list()` deterministic; the set stays small enough that linear scans win
/// over a hash set plus a separate order index.
#[derive(Default)]
pub(crate) struct SubscriptionSet {
    active: Vec<Subscription>,
}

impl SubscriptionSet {
    /// Returns `false` if the pair was already active.
    pub fn insert(&mut self, sub: Subscription) -> bool {
        if self.active.contains(&sub) {
            return false;
        }
        self.active.push(sub);
        true
    }

    /// Returns `true` if the pair was active and has been removed.
    pub fn remove(&mut self, kind: FeedKind, symbol: &Symbol) -> bool {
        let before = self.active.len();
        self.active
            .retain(|s| !(s.kind == kind && &s.symbol == symbol));
        self.active.len() < before
    }

    pub fn contains(&self, kind: FeedKind, symbol: &Symbol) -> bool {
        self.active
            .iter()
            .any(|s| s.kind == kind && &s.symbol == symbol)
    }

    /// Canonical stream identifiers in insertion order.
    pub fn stream_names(&self) -> Vec<String> {
        self.active.iter().map(Subscription::stream_name).collect()
    }
}

/// Validate a positional parameter list for a subscribe/unsubscribe call.
///
/// Structural arity errors (`InvalidSubscriptionParams`) are independent of
/// the feed kind; shape errors for the specific kind (a missing or blank
/// symbol) surface as `InvalidFeedTypeParams`.
pub(crate) fn validate_params(kind: FeedKind, params: &[&str]) -> Result<Symbol, SdkError> {
    if params.len() > 1 {
        return Err(SdkError::InvalidSubscriptionParams {
            max: 1,
            got: params.len(),
        });
    }

    // Every currently recognized kind takes exactly one symbol.
    match kind {
        FeedKind::Ticker | FeedKind::OrderBook => {
            let raw = params.first().copied().ok_or_else(|| {
                SdkError::InvalidFeedTypeParams {
                    kind: kind.name(),
                    reason: "a symbol is required".into(),
                }
            })?;
            let symbol = Symbol::new(raw);
            if symbol.is_empty() {
                return Err(SdkError::InvalidFeedTypeParams {
                    kind: kind.name(),
                    reason: "symbol must not be blank".into(),
                });
            }
            Ok(symbol)
        }
    }
}
