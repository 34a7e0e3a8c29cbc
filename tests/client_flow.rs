//! End-to-end client flows over in-memory transport and snapshot fakes.

use binance_streams::prelude::*;

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

// ─── Fakes ───────────────────────────────────────────────────────────────────

/// Transport that acknowledges every request instantly and records frames.
#[derive(Default)]
struct FakeTransport {
    subscribes: Mutex<Vec<Vec<String>>>,
    unsubscribes: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn subscribe(&self, streams: &[String]) -> Result<(), WsError> {
        self.subscribes.lock().unwrap().push(streams.to_vec());
        Ok(())
    }

    async fn unsubscribe(&self, streams: &[String]) -> Result<(), WsError> {
        self.unsubscribes.lock().unwrap().push(streams.to_vec());
        Ok(())
    }

    async fn close(&self) -> Result<(), WsError> {
        Ok(())
    }
}

/// Transport whose acknowledgments take a moment to arrive.
#[derive(Default)]
struct SlowTransport {
    subscribes: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl Transport for SlowTransport {
    async fn subscribe(&self, streams: &[String]) -> Result<(), WsError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.subscribes.lock().unwrap().push(streams.to_vec());
        Ok(())
    }

    async fn unsubscribe(&self, _streams: &[String]) -> Result<(), WsError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), WsError> {
        Ok(())
    }
}

/// Transport that fails the first N subscribe requests, then succeeds.
struct FlakyTransport {
    failures_left: AtomicUsize,
    subscribes: Mutex<Vec<Vec<String>>>,
}

impl FlakyTransport {
    fn failing(times: usize) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicUsize::new(times),
            subscribes: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Transport for FlakyTransport {
    async fn subscribe(&self, streams: &[String]) -> Result<(), WsError> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(WsError::SendFailed("wire down".into()));
        }
        self.subscribes.lock().unwrap().push(streams.to_vec());
        Ok(())
    }

    async fn unsubscribe(&self, _streams: &[String]) -> Result<(), WsError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), WsError> {
        Ok(())
    }
}

/// Snapshot source serving a scripted sequence and counting fetches.
struct FakeFetcher {
    snapshots: Mutex<VecDeque<DepthSnapshot>>,
    calls: AtomicUsize,
}

impl FakeFetcher {
    fn scripted(snapshots: Vec<DepthSnapshot>) -> Arc<Self> {
        Arc::new(Self {
            snapshots: Mutex::new(snapshots.into()),
            calls: AtomicUsize::new(0),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotFetcher for FakeFetcher {
    async fn depth_snapshot(&self, _symbol: &Symbol) -> Result<DepthSnapshot, HttpError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.snapshots
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| HttpError::NotFound("script exhausted".into()))
    }
}

/// Scripted snapshot source that blocks each fetch until a permit is issued,
/// so tests control exactly when the HTTP response lands.
struct GatedFetcher {
    snapshots: Mutex<VecDeque<DepthSnapshot>>,
    gate: tokio::sync::Semaphore,
    calls: AtomicUsize,
}

impl GatedFetcher {
    fn scripted(snapshots: Vec<DepthSnapshot>) -> Arc<Self> {
        Arc::new(Self {
            snapshots: Mutex::new(snapshots.into()),
            gate: tokio::sync::Semaphore::new(0),
            calls: AtomicUsize::new(0),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotFetcher for GatedFetcher {
    async fn depth_snapshot(&self, _symbol: &Symbol) -> Result<DepthSnapshot, HttpError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| HttpError::NotFound("gate closed".into()))?;
        permit.forget();
        self.snapshots
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| HttpError::NotFound("script exhausted".into()))
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

fn snapshot(id: u64, bid: &str, ask: &str) -> DepthSnapshot {
    DepthSnapshot {
        last_update_id: id,
        bids: vec![(dec(bid), dec("1"))],
        asks: vec![(dec(ask), dec("1"))],
    }
}

fn diff_raw(first: u64, last: u64, bid: &str, ask: &str) -> String {
    format!(
        r#"{{"e":"depthUpdate","s":"BTCUSDT","U":{first},"u":{last},"b":[["{bid}","1"]],"a":[["{ask}","1"]]}}"#
    )
}

fn ticker_raw(symbol: &str, price: &str) -> String {
    format!(r#"{{"e":"24hrTicker","s":"{symbol}","c":"{price}"}}"#)
}

async fn client(
    transport: Arc<FakeTransport>,
    fetcher: Arc<FakeFetcher>,
) -> MarketClient {
    MarketClient::builder()
        .transport(transport)
        .snapshot_fetcher(fetcher)
        .connect()
        .await
        .unwrap()
}

/// Drive a depth subscription to readiness: subscribe, feed one diff, and
/// wait for the snapshot reconciliation to land.
async fn synced_book(client: &MarketClient) -> OrderBookHandle {
    client
        .subscribe(FeedKind::OrderBook, &["BTCUSDT"])
        .await
        .unwrap();
    let book = client.order_book("BTCUSDT");
    let updated = book.updated();
    client.ingest_raw(&diff_raw(100, 105, "100", "101"));
    timeout(Duration::from_secs(2), updated)
        .await
        .expect("book should synchronize");
    assert!(book.is_ready());
    book
}

// ─── Handlers ────────────────────────────────────────────────────────────────

struct ChannelTicker(mpsc::UnboundedSender<TickerEvent>);

#[async_trait]
impl TickerReceiver for ChannelTicker {
    async fn receive(&self, event: TickerEvent) -> Result<(), HandlerError> {
        let _ = self.0.send(event);
        Ok(())
    }
}

impl MarketHandler for ChannelTicker {
    fn as_ticker(self: Arc<Self>) -> Option<Arc<dyn TickerReceiver>> {
        Some(self)
    }
}

struct NotAHandler;
impl MarketHandler for NotAHandler {}

#[derive(Debug, PartialEq)]
struct Boom(u32);

impl std::fmt::Display for Boom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "boom {}", self.0)
    }
}

impl std::error::Error for Boom {}

struct FailingTicker;

#[async_trait]
impl TickerReceiver for FailingTicker {
    async fn receive(&self, _event: TickerEvent) -> Result<(), HandlerError> {
        Err(Box::new(Boom(7)))
    }
}

impl MarketHandler for FailingTicker {
    fn as_ticker(self: Arc<Self>) -> Option<Arc<dyn TickerReceiver>> {
        Some(self)
    }
}

struct ChannelException(mpsc::UnboundedSender<HandlerError>);

#[async_trait]
impl ExceptionReceiver for ChannelException {
    async fn receive(&self, error: HandlerError) {
        let _ = self.0.send(error);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn handler_without_capability_is_rejected() {
    let c = client(Arc::default(), FakeFetcher::scripted(vec![])).await;

    let (tx, _rx) = mpsc::unbounded_channel();
    c.handler(Arc::new(ChannelTicker(tx))).unwrap();

    let err = c.handler(Arc::new(NotAHandler)).unwrap_err();
    assert!(matches!(err, SdkError::InvalidHandlerKind));

    // The earlier registration still receives events.
    let (tx2, mut rx2) = mpsc::unbounded_channel();
    c.handler(Arc::new(ChannelTicker(tx2))).unwrap();
    c.ingest_raw(&ticker_raw("BTCUSDT", "42000"));
    let event = timeout(Duration::from_secs(2), rx2.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.symbol.as_str(), "BTCUSDT");
}

#[tokio::test]
async fn ticker_events_reach_handler_with_payload() {
    let c = client(Arc::default(), FakeFetcher::scripted(vec![])).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    c.handler(Arc::new(ChannelTicker(tx))).unwrap();

    c.ingest_raw(&ticker_raw("ETHUSDT", "2500.25"));

    let event = timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.symbol.as_str(), "ETHUSDT");
    assert_eq!(event.last_price, Some(dec("2500.25")));
}

#[tokio::test]
async fn handler_failure_reaches_exception_receiver_by_identity() {
    let c = client(Arc::default(), FakeFetcher::scripted(vec![])).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    c.handler_with(Arc::new(FailingTicker), Arc::new(ChannelException(tx)))
        .unwrap();

    c.ingest_raw(&ticker_raw("BTCUSDT", "42000"));

    let error = timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let boom = error.downcast::<Boom>().expect("concrete error survives");
    assert_eq!(*boom, Boom(7));
}

#[tokio::test]
async fn subscribe_parameter_validation() {
    let transport: Arc<FakeTransport> = Arc::default();
    let c = client(transport.clone(), FakeFetcher::scripted(vec![])).await;

    let err = c.subscribe(FeedKind::Ticker, &[]).await.unwrap_err();
    assert!(matches!(err, SdkError::InvalidFeedTypeParams { .. }));

    let err = c
        .subscribe(FeedKind::Ticker, &["BTCUSDT", "ETHUSDT"])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SdkError::InvalidSubscriptionParams { max: 1, got: 2 }
    ));

    assert!(transport.subscribes.lock().unwrap().is_empty());
    assert!(c.list_subscriptions().is_empty());
}

#[tokio::test]
async fn depth_subscription_synchronizes_book() {
    let fetcher = FakeFetcher::scripted(vec![snapshot(104, "100", "101")]);
    let c = client(Arc::default(), fetcher.clone()).await;

    let book = synced_book(&c).await;

    assert!(!book.bids().is_empty());
    assert!(!book.asks().is_empty());
    assert_eq!(book.best_bid(), Some((dec("100"), dec("1"))));
    assert_eq!(book.best_ask(), Some((dec("101"), dec("1"))));
    assert_eq!(book.spread(), Some(dec("1")));
    assert_eq!(book.depth(), (1, 1));
    assert_eq!(c.list_subscriptions(), vec!["btcusdt@depth"]);
    assert_eq!(fetcher.call_count(), 1);
}

#[tokio::test]
async fn handle_obtained_before_subscribe_converges() {
    let fetcher = FakeFetcher::scripted(vec![snapshot(104, "100", "101")]);
    let c = client(Arc::default(), fetcher).await;

    // Handle first, subscription second.
    let book = c.order_book("BTCUSDT");
    assert!(!book.is_ready());
    assert!(book.bids().is_empty());

    let _ = synced_book(&c).await;

    assert!(book.is_ready());
    assert_eq!(book.best_bid(), Some((dec("100"), dec("1"))));
}

#[tokio::test]
async fn stop_freezes_book_until_start() {
    let fetcher = FakeFetcher::scripted(vec![snapshot(104, "100", "101")]);
    let c = client(Arc::default(), fetcher).await;
    let book = synced_book(&c).await;
    let asks_before = book.asks();

    c.stop();
    c.stop(); // idempotent
    assert!(!c.is_running());

    // Applicable traffic while stopped must not mutate anything.
    c.ingest_raw(&diff_raw(106, 110, "100.5", "101.5"));
    c.ingest_raw(&diff_raw(111, 115, "100.6", "101.6"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(book.asks(), asks_before);
    assert_eq!(book.last_update_id(), 105);

    c.start();
    assert!(c.is_running());
    let updated = book.updated();
    c.ingest_raw(&diff_raw(106, 110, "100.5", "101.5"));
    timeout(Duration::from_secs(2), updated)
        .await
        .expect("dispatch resumes after start");
    assert_eq!(book.last_update_id(), 110);
    assert!(book.asks().contains(&(dec("101.5"), dec("1"))));
}

#[tokio::test]
async fn unsubscribe_detaches_book_and_ignores_stray_diffs() {
    let transport: Arc<FakeTransport> = Arc::default();
    let fetcher = FakeFetcher::scripted(vec![snapshot(104, "100", "101")]);
    let c = client(transport.clone(), fetcher.clone()).await;
    let book = synced_book(&c).await;

    c.unsubscribe(FeedKind::OrderBook, "BTCUSDT").await.unwrap();
    assert_eq!(
        *transport.unsubscribes.lock().unwrap(),
        vec![vec!["btcusdt@depth".to_string()]]
    );
    assert!(c.list_subscriptions().is_empty());

    // Frames still in flight after the unsubscribe must not mutate the
    // frozen handle or trigger a snapshot fetch.
    let asks_before = book.asks();
    c.ingest_raw(&diff_raw(106, 110, "100.5", "101.5"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(book.asks(), asks_before);
    assert_eq!(fetcher.call_count(), 1);

    // Unsubscribing again is a no-op.
    c.unsubscribe(FeedKind::OrderBook, "BTCUSDT").await.unwrap();
    assert_eq!(transport.unsubscribes.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn sequence_gap_triggers_exactly_one_resync() {
    let fetcher = FakeFetcher::scripted(vec![
        snapshot(104, "100", "101"),
        snapshot(204, "200", "201"),
    ]);
    let c = client(Arc::default(), fetcher.clone()).await;
    let book = synced_book(&c).await;
    assert_eq!(fetcher.call_count(), 1);

    // In-sequence diff applies without a fetch.
    let updated = book.updated();
    c.ingest_raw(&diff_raw(106, 110, "100.1", "101.1"));
    timeout(Duration::from_secs(2), updated).await.unwrap();
    assert_eq!(fetcher.call_count(), 1);
    assert_eq!(book.last_update_id(), 110);

    // Gap: expected 111, got 200. One resync, not one per buffered diff.
    let updated = book.updated();
    c.ingest_raw(&diff_raw(200, 205, "200", "201"));
    c.ingest_raw(&diff_raw(206, 210, "200.1", "201.1"));
    timeout(Duration::from_secs(2), updated)
        .await
        .expect("resync should complete");
    assert_eq!(fetcher.call_count(), 2);
    assert!(book.is_ready());
    assert!(book.last_update_id() >= 205);
}

#[tokio::test]
async fn stop_discards_snapshot_already_in_flight() {
    let fetcher = GatedFetcher::scripted(vec![
        snapshot(104, "100", "101"),
        snapshot(104, "100", "101"),
    ]);
    let c = MarketClient::builder()
        .transport(Arc::new(FakeTransport::default()))
        .snapshot_fetcher(fetcher.clone())
        .connect()
        .await
        .unwrap();

    c.subscribe(FeedKind::OrderBook, &["BTCUSDT"])
        .await
        .unwrap();
    let book = c.order_book("BTCUSDT");

    // First diff starts the snapshot fetch, which blocks on the gate.
    c.ingest_raw(&diff_raw(100, 105, "100", "101"));
    for _ in 0..100 {
        if fetcher.call_count() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(fetcher.call_count(), 1);

    // The response lands after stop(); it must be discarded, not applied.
    c.stop();
    fetcher.gate.add_permits(1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!book.is_ready());
    assert!(book.bids().is_empty());
    assert!(book.asks().is_empty());

    // After start(), the next diff begins a fresh episode that synchronizes.
    c.start();
    fetcher.gate.add_permits(1);
    let updated = book.updated();
    c.ingest_raw(&diff_raw(106, 110, "100.5", "101.5"));
    timeout(Duration::from_secs(2), updated)
        .await
        .expect("book should synchronize after resume");
    assert!(book.is_ready());
    assert_eq!(book.last_update_id(), 110);
    assert_eq!(fetcher.call_count(), 2);
}

#[tokio::test]
async fn concurrent_duplicate_subscribes_send_one_frame() {
    let transport = Arc::new(SlowTransport::default());
    let c = MarketClient::builder()
        .transport(transport.clone())
        .snapshot_fetcher(FakeFetcher::scripted(vec![]))
        .connect()
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        c.subscribe(FeedKind::Ticker, &["BTCUSDT"]),
        c.subscribe(FeedKind::Ticker, &["BTCUSDT"]),
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(transport.subscribes.lock().unwrap().len(), 1);
    assert_eq!(c.list_subscriptions(), vec!["btcusdt@ticker"]);
}

#[tokio::test]
async fn failed_subscribe_rolls_back_reservation_and_book() {
    let transport = FlakyTransport::failing(1);
    let fetcher = FakeFetcher::scripted(vec![snapshot(104, "100", "101")]);
    let c = MarketClient::builder()
        .transport(transport.clone())
        .snapshot_fetcher(fetcher)
        .connect()
        .await
        .unwrap();

    let stale = c.order_book("BTCUSDT");

    let err = c
        .subscribe(FeedKind::OrderBook, &["BTCUSDT"])
        .await
        .unwrap_err();
    assert!(matches!(err, SdkError::Ws(_)));
    assert!(c.list_subscriptions().is_empty());

    // Retry succeeds and builds a fresh book; the handle from before the
    // failed attempt stays detached.
    c.subscribe(FeedKind::OrderBook, &["BTCUSDT"])
        .await
        .unwrap();
    assert_eq!(transport.subscribes.lock().unwrap().len(), 1);

    let book = c.order_book("BTCUSDT");
    let updated = book.updated();
    c.ingest_raw(&diff_raw(100, 105, "100", "101"));
    timeout(Duration::from_secs(2), updated)
        .await
        .expect("book should synchronize");
    assert!(book.is_ready());
    assert!(!stale.is_ready());
    assert!(stale.asks().is_empty());
}

#[tokio::test]
async fn book_receivers_get_derived_views() {
    struct ChannelBook(mpsc::UnboundedSender<BookUpdate>);

    #[async_trait]
    impl OrderBookReceiver for ChannelBook {
        async fn receive(&self, update: BookUpdate) -> Result<(), HandlerError> {
            let _ = self.0.send(update);
            Ok(())
        }
    }

    impl MarketHandler for ChannelBook {
        fn as_order_book(self: Arc<Self>) -> Option<Arc<dyn OrderBookReceiver>> {
            Some(self)
        }
    }

    let fetcher = FakeFetcher::scripted(vec![snapshot(104, "100", "101")]);
    let c = client(Arc::default(), fetcher).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    c.handler(Arc::new(ChannelBook(tx))).unwrap();

    let _ = synced_book(&c).await;

    let update = timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.symbol.as_str(), "BTCUSDT");
    assert_eq!(update.bids, vec![(dec("100"), dec("1"))]);
    assert_eq!(update.asks, vec![(dec("101"), dec("1"))]);
    assert_eq!(update.last_update_id, 105);
}
