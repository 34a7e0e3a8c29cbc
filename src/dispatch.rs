//! Event dispatch — the single ingress point for inbound market data.
//!
//! Every message the transport produces funnels through [`Dispatcher`]:
//! classification, handler fan-out, exception isolation, and the routing of
//! depth diffs into the per-symbol synchronizers. A failing handler is never
//! allowed to stop delivery to other handlers or to unwind into the
//! transport's read loop.

use crate::book::sync::{BookSync, BridgeRule, DiffAction, SnapshotOutcome};
use crate::book::BookUpdate;
use crate::error::SdkError;
use crate::handler::{
    ExceptionReceiver, HandlerEntry, HandlerError, HandlerRegistry, MarketHandler,
};
use crate::http::retry::RetryConfig;
use crate::http::SnapshotFetcher;
use crate::shared::{FeedKind, Symbol};
use crate::subscriptions::SubscriptionSet;
use crate::wire::{DepthDiff, MarketEvent, MessageIn, TickerEvent};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

pub(crate) struct Dispatcher {
    registry: RwLock<HandlerRegistry>,
    subscriptions: Arc<Mutex<SubscriptionSet>>,
    books: RwLock<HashMap<Symbol, Arc<BookSync>>>,
    snapshots: Arc<dyn SnapshotFetcher>,
    retry: RetryConfig,
    bridge: BridgeRule,
    running: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        subscriptions: Arc<Mutex<SubscriptionSet>>,
        snapshots: Arc<dyn SnapshotFetcher>,
        retry: RetryConfig,
        bridge: BridgeRule,
    ) -> Self {
        Self {
            registry: RwLock::new(HandlerRegistry::default()),
            subscriptions,
            books: RwLock::new(HashMap::new()),
            snapshots,
            retry,
            bridge,
            running: AtomicBool::new(true),
        }
    }

    // ── Handler registration ─────────────────────────────────────────────

    pub fn register(
        &self,
        handler: Arc<dyn MarketHandler>,
        exception: Option<Arc<dyn ExceptionReceiver>>,
    ) -> Result<(), SdkError> {
        self.registry
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .register(handler, exception)
    }

    // ── Pause / resume ───────────────────────────────────────────────────

    /// Suspend routing. Idempotent. While stopped, no handler is invoked and
    /// no book mutates; messages arriving from the transport are discarded
    /// at this ingress.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Resume routing. Idempotent. A depth gap accumulated during the pause
    /// surfaces as an ordinary resync on the first post-resume diff.
    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ── Ingress ──────────────────────────────────────────────────────────

    /// Classify and route a raw transport frame.
    pub fn dispatch_raw(self: &Arc<Self>, raw: &str) {
        if !self.is_running() {
            return;
        }
        match serde_json::from_str::<MessageIn>(raw) {
            Ok(MessageIn::Event(event)) | Ok(MessageIn::Envelope { data: event, .. }) => {
                self.dispatch(event)
            }
            Ok(MessageIn::Ack(ack)) => {
                // Acks are consumed by the transport's request tracking; one
                // arriving here means nothing was waiting for it.
                tracing::debug!(id = ack.id, "unmatched command acknowledgment");
            }
            Err(e) => {
                tracing::warn!(error = %e, raw, "undecodable inbound message");
            }
        }
    }

    /// Route a parsed market event.
    pub fn dispatch(self: &Arc<Self>, event: MarketEvent) {
        if !self.is_running() {
            return;
        }
        match event {
            MarketEvent::Ticker(ticker) => self.fan_out_ticker(ticker),
            MarketEvent::DepthDiff(diff) => self.on_depth_diff(diff),
        }
    }

    // ── Ticker path ──────────────────────────────────────────────────────

    fn fan_out_ticker(&self, event: TickerEvent) {
        for entry in self.entries_for(FeedKind::Ticker) {
            let event = event.clone();
            tokio::spawn(async move {
                let receiver = match &entry.ticker {
                    Some(r) => Arc::clone(r),
                    None => return,
                };
                if let Err(err) = receiver.receive(event).await {
                    route_exception(entry.exception, err).await;
                }
            });
        }
    }

    // ── Order-book path ──────────────────────────────────────────────────

    fn on_depth_diff(self: &Arc<Self>, diff: DepthDiff) {
        let symbol = diff.symbol.clone();

        // Diffs for symbols without an active subscription are stray traffic
        // (e.g. frames in flight after an unsubscribe) and must not touch
        // book state.
        if !self.subscription_active(FeedKind::OrderBook, &symbol) {
            tracing::debug!(symbol = %symbol, "diff for inactive subscription ignored");
            return;
        }

        let sync = self.book(&symbol);
        match sync.on_diff(diff) {
            DiffAction::NeedSnapshot => self.spawn_snapshot_fetch(sync),
            DiffAction::Applied(update) => self.fan_out_book(update),
            DiffAction::Buffered | DiffAction::Dropped => {}
        }
    }

    fn fan_out_book(&self, update: BookUpdate) {
        for entry in self.entries_for(FeedKind::OrderBook) {
            let update = update.clone();
            tokio::spawn(async move {
                let receiver = match &entry.order_book {
                    Some(r) => Arc::clone(r),
                    None => return,
                };
                if let Err(err) = receiver.receive(update).await {
                    route_exception(entry.exception, err).await;
                }
            });
        }
    }

    /// One snapshot fetch task per buffering episode. Retries transient
    /// failures and non-bridging snapshots with backoff; on exhaustion the
    /// episode's fetch slot is released so a later gap can start over.
    ///
    /// A `stop()` racing the fetch abandons the episode: a snapshot whose
    /// response lands while paused is discarded rather than applied, and the
    /// first post-resume diff starts a fresh episode.
    fn spawn_snapshot_fetch(self: &Arc<Self>, sync: Arc<BookSync>) {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let symbol = sync.symbol().clone();
            for attempt in 0..=dispatcher.retry.max_retries {
                if !dispatcher.is_running() {
                    tracing::debug!(symbol = %symbol, "paused; abandoning snapshot episode");
                    sync.abandon_fetch();
                    return;
                }
                match dispatcher.snapshots.depth_snapshot(&symbol).await {
                    Ok(snapshot) => {
                        if !dispatcher.is_running() {
                            tracing::debug!(symbol = %symbol, "paused; discarding fetched snapshot");
                            sync.abandon_fetch();
                            return;
                        }
                        match sync.apply_snapshot(snapshot) {
                            SnapshotOutcome::Applied(update) => {
                                dispatcher.fan_out_book(update);
                                return;
                            }
                            SnapshotOutcome::AlreadySynced => return,
                            SnapshotOutcome::NeedRefetch => {
                                tracing::debug!(symbol = %symbol, attempt, "snapshot did not bridge, refetching");
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(symbol = %symbol, attempt, error = %e, "depth snapshot fetch failed");
                    }
                }
                if attempt < dispatcher.retry.max_retries {
                    tokio::time::sleep(dispatcher.retry.delay_for_attempt(attempt)).await;
                }
            }
            tracing::error!(symbol = %symbol, "giving up on depth snapshot; book stays unsynchronized");
            sync.abandon_fetch();
        });
    }

    // ── Book registry ────────────────────────────────────────────────────

    /// Get or lazily create the synchronizer for a symbol.
    pub fn book(&self, symbol: &Symbol) -> Arc<BookSync> {
        if let Some(sync) = self
            .books
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(symbol)
        {
            return Arc::clone(sync);
        }
        let mut books = self.books.write().unwrap_or_else(|p| p.into_inner());
        Arc::clone(
            books
                .entry(symbol.clone())
                .or_insert_with(|| Arc::new(BookSync::new(symbol.clone(), self.bridge))),
        )
    }

    /// Detach a symbol's synchronizer. Existing handles stay valid but
    /// frozen; a later subscription builds a fresh book.
    pub fn remove_book(&self, symbol: &Symbol) {
        self.books
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(symbol);
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    fn entries_for(&self, kind: FeedKind) -> Vec<HandlerEntry> {
        self.registry
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .entries_for(kind)
    }

    fn subscription_active(&self, kind: FeedKind, symbol: &Symbol) -> bool {
        self.subscriptions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(kind, symbol)
    }
}

/// Deliver a data-handler failure to its paired exception receiver, or log
/// and drop it. Exactly one exception-receiver invocation per failure.
async fn route_exception(exception: Option<Arc<dyn ExceptionReceiver>>, err: HandlerError) {
    match exception {
        Some(receiver) => receiver.receive(err).await,
        None => tracing::warn!(error = %err, "handler failed; no exception handler registered"),
    }
}
