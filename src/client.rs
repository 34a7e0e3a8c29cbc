//! High-level client — `MarketClient` with builder.
//!
//! The client is an explicit session value owning the handler registry, the
//! subscription set, the per-symbol synchronizers (via the dispatcher), and
//! the transport. There is no process-wide state: two clients in one process
//! are fully independent.

use crate::book::sync::BridgeRule;
use crate::book::OrderBookHandle;
use crate::dispatch::Dispatcher;
use crate::error::SdkError;
use crate::handler::{ExceptionReceiver, MarketHandler};
use crate::http::retry::RetryConfig;
use crate::http::{BinanceHttp, SnapshotFetcher};
use crate::shared::{FeedKind, Symbol};
use crate::subscriptions::{validate_params, Subscription, SubscriptionSet};
use crate::wire::MarketEvent;
use crate::ws::native::WsTransport;
use crate::ws::{Transport, WsConfig};

use std::sync::{Arc, Mutex};

/// Streaming market-data client.
///
/// Cloning is cheap and clones share all state, so the client can be handed
/// to tasks freely.
#[derive(Clone)]
pub struct MarketClient {
    dispatcher: Arc<Dispatcher>,
    transport: Arc<dyn Transport>,
    subscriptions: Arc<Mutex<SubscriptionSet>>,
}

impl MarketClient {
    pub fn builder() -> MarketClientBuilder {
        MarketClientBuilder::default()
    }

    // ── Handlers ─────────────────────────────────────────────────────────

    /// Register a data handler with no exception handler. Fails with
    /// [`SdkError::InvalidHandlerKind`] if the handler exposes no feed
    /// capability; existing registrations are unaffected.
    pub fn handler(&self, data: Arc<dyn MarketHandler>) -> Result<(), SdkError> {
        self.dispatcher.register(data, None)
    }

    /// Register a (data handler, exception handler) pair. Errors the data
    /// handler raises are delivered to `exception` instead of being dropped.
    pub fn handler_with(
        &self,
        data: Arc<dyn MarketHandler>,
        exception: Arc<dyn ExceptionReceiver>,
    ) -> Result<(), SdkError> {
        self.dispatcher.register(data, Some(exception))
    }

    // ── Subscriptions ────────────────────────────────────────────────────

    /// Subscribe to a feed. `params` is the positional parameter list for
    /// the feed kind; every currently recognized kind takes exactly one
    /// symbol. Suspends until the server acknowledges. Re-subscribing an
    /// already-active pair resolves immediately without touching the wire.
    pub async fn subscribe(&self, kind: FeedKind, params: &[&str]) -> Result<(), SdkError> {
        let symbol = validate_params(kind, params)?;
        let sub = Subscription::new(kind, symbol.clone());
        let stream = sub.stream_name();

        // Reserve the pair under the lock before awaiting the ack so a
        // concurrent call for the same pair resolves as a duplicate instead
        // of double-sending the frame.
        if !self.lock_subs().insert(sub) {
            return Ok(());
        }

        // Create the synchronizer with the subscription so a book handle
        // requested at any point observes the same instance.
        if kind == FeedKind::OrderBook {
            let _ = self.dispatcher.book(&symbol);
        }

        if let Err(e) = self.transport.subscribe(&[stream]).await {
            // Roll back the reservation and the eagerly created book.
            self.lock_subs().remove(kind, &symbol);
            if kind == FeedKind::OrderBook {
                self.dispatcher.remove_book(&symbol);
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Unsubscribe from a feed. Suspends until acknowledged. Unsubscribing a
    /// pair that is not active is a no-op.
    pub async fn unsubscribe(&self, kind: FeedKind, symbol: &str) -> Result<(), SdkError> {
        let symbol = Symbol::new(symbol);
        let sub = Subscription::new(kind, symbol.clone());

        if !self.lock_subs().contains(kind, &symbol) {
            return Ok(());
        }

        self.transport.unsubscribe(&[sub.stream_name()]).await?;
        self.lock_subs().remove(kind, &symbol);

        if kind == FeedKind::OrderBook {
            self.dispatcher.remove_book(&symbol);
        }
        Ok(())
    }

    /// Canonical stream identifiers of the active subscriptions, in
    /// subscription order.
    pub fn list_subscriptions(&self) -> Vec<String> {
        self.lock_subs().stream_names()
    }

    // ── Order books ──────────────────────────────────────────────────────

    /// Handle onto the symbol's synchronized order book, created lazily.
    /// Requesting the handle before or after subscribing makes no
    /// difference; both paths observe the same book.
    pub fn order_book(&self, symbol: &str) -> OrderBookHandle {
        OrderBookHandle {
            sync: self.dispatcher.book(&Symbol::new(symbol)),
        }
    }

    // ── Pause / resume ───────────────────────────────────────────────────

    /// Pause dispatch and book synchronization without touching
    /// subscriptions. Idempotent; after `stop` returns nothing observable
    /// mutates until [`start`](Self::start).
    pub fn stop(&self) {
        self.dispatcher.stop();
    }

    /// Resume dispatch. Idempotent.
    pub fn start(&self) {
        self.dispatcher.start();
    }

    pub fn is_running(&self) -> bool {
        self.dispatcher.is_running()
    }

    // ── Transport ingress ────────────────────────────────────────────────

    /// Feed a raw inbound frame into dispatch. This is the entry point the
    /// transport drives; custom transports and tests call it directly.
    pub fn ingest_raw(&self, raw: &str) {
        self.dispatcher.dispatch_raw(raw);
    }

    /// Feed an already-parsed event into dispatch.
    pub fn ingest(&self, event: MarketEvent) {
        self.dispatcher.dispatch(event);
    }

    /// Tear down the transport. Book state stays queryable.
    pub async fn close(&self) -> Result<(), SdkError> {
        self.transport.close().await?;
        Ok(())
    }

    fn lock_subs(&self) -> std::sync::MutexGuard<'_, SubscriptionSet> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }
}

// ═════════════════════════════════════════════════════════════════════════════
// Builder
// ═════════════════════════════════════════════════════════════════════════════

pub struct MarketClientBuilder {
    api_url: String,
    ws_config: WsConfig,
    retry: RetryConfig,
    bridge: BridgeRule,
    transport: Option<Arc<dyn Transport>>,
    snapshots: Option<Arc<dyn SnapshotFetcher>>,
}

impl Default for MarketClientBuilder {
    fn default() -> Self {
        Self {
            api_url: crate::network::DEFAULT_API_URL.to_string(),
            ws_config: WsConfig::default(),
            retry: RetryConfig::default(),
            bridge: BridgeRule::default(),
            transport: None,
            snapshots: None,
        }
    }
}

impl MarketClientBuilder {
    pub fn api_url(mut self, url: &str) -> Self {
        self.api_url = url.to_string();
        self
    }

    pub fn ws_url(mut self, url: &str) -> Self {
        self.ws_config.url = url.to_string();
        self
    }

    pub fn ws_config(mut self, config: WsConfig) -> Self {
        self.ws_config = config;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Bridging rule between a snapshot's update id and the first applicable
    /// diff. Feed-specific; defaults to the spanning rule.
    pub fn bridge_rule(mut self, rule: BridgeRule) -> Self {
        self.bridge = rule;
        self
    }

    /// Substitute the transport (tests, alternative wire protocols). The
    /// client then never dials the default WebSocket endpoint.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Substitute the snapshot source.
    pub fn snapshot_fetcher(mut self, snapshots: Arc<dyn SnapshotFetcher>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// Build the client, dialing the WebSocket endpoint unless a transport
    /// was injected. The returned client is running.
    pub async fn connect(self) -> Result<MarketClient, SdkError> {
        let snapshots = self.snapshots.unwrap_or_else(|| {
            Arc::new(BinanceHttp::with_retry(&self.api_url, self.retry.clone()))
        });

        let subscriptions = Arc::new(Mutex::new(SubscriptionSet::default()));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&subscriptions),
            snapshots,
            self.retry,
            self.bridge,
        ));

        let transport: Arc<dyn Transport> = match self.transport {
            Some(t) => t,
            None => {
                let ingress_dispatcher = Arc::clone(&dispatcher);
                let transport = WsTransport::connect(
                    self.ws_config,
                    Arc::new(move |raw: &str| ingress_dispatcher.dispatch_raw(raw)),
                )
                .await?;
                Arc::new(transport)
            }
        };

        Ok(MarketClient {
            dispatcher,
            transport,
            subscriptions,
        })
    }
}
