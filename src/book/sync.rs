//! Per-symbol order-book synchronization.
//!
//! Reconciliation protocol:
//! 1. Buffer incoming diffs while no snapshot has been applied
//! 2. Fetch a REST snapshot (requested once per buffering episode)
//! 3. Drop buffered diffs with `final_update_id <= snapshot.last_update_id`
//! 4. The first surviving diff must bridge the snapshot per the configured
//!    [`BridgeRule`]; otherwise the snapshot is refetched
//! 5. Apply the bridged tail, then live diffs in strict id order; a sequence
//!    gap returns the symbol to buffering and triggers one refetch

use crate::book::{BookUpdate, OrderBook};
use crate::shared::Symbol;
use crate::wire::{DepthDiff, DepthSnapshot, Level};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::watch;

/// Maximum diffs buffered while waiting for a snapshot; beyond this the
/// oldest are shed (they would be stale by the time the snapshot lands).
const MAX_PENDING: usize = 1000;

/// Numeric relationship required between the book's `last_update_id` (`U`)
/// and an applicable diff. Feed-specific, so it is configuration rather than
/// a hard-coded exchange quirk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BridgeRule {
    /// `first_update_id <= U+1 <= final_update_id` — diffs cover id ranges
    /// and the applicable one spans the successor id (Binance spot).
    #[default]
    Spanning,
    /// `first_update_id == U+1` — strictly consecutive ids, for feeds that
    /// number every diff individually.
    Sequential,
}

impl BridgeRule {
    fn bridges(&self, last_update_id: u64, first: u64, last: u64) -> bool {
        match self {
            BridgeRule::Spanning => first <= last_update_id + 1 && last >= last_update_id + 1,
            BridgeRule::Sequential => first == last_update_id + 1,
        }
    }
}

/// What the dispatcher should do after offering a diff.
#[derive(Debug)]
pub(crate) enum DiffAction {
    /// Buffered; a snapshot fetch is already pending.
    Buffered,
    /// Buffered, and this call started a new buffering episode — fetch a
    /// snapshot for this symbol.
    NeedSnapshot,
    /// Applied in sequence; fan the derived views out to handlers.
    Applied(BookUpdate),
    /// Stale diff, silently dropped.
    Dropped,
}

/// Outcome of applying a fetched snapshot.
#[derive(Debug)]
pub(crate) enum SnapshotOutcome {
    /// Book is synchronized; fan the derived views out to handlers.
    Applied(BookUpdate),
    /// The buffered diffs do not bridge this snapshot — fetch again.
    NeedRefetch,
    /// A concurrent path already synchronized the book; nothing to do.
    AlreadySynced,
}

enum SyncState {
    Buffering { pending: VecDeque<DepthDiff> },
    Synced,
}

struct Inner {
    state: SyncState,
    book: OrderBook,
}

/// Synchronization state machine for one symbol.
///
/// Interior-mutable so the dispatcher, the snapshot fetch task, and any
/// number of [`OrderBookHandle`](crate::book::OrderBookHandle)s can share
/// it. The mutex guards only short, non-blocking critical sections.
pub(crate) struct BookSync {
    symbol: Symbol,
    rule: BridgeRule,
    inner: Mutex<Inner>,
    revision: watch::Sender<u64>,
    fetch_in_flight: AtomicBool,
}

impl BookSync {
    pub fn new(symbol: Symbol, rule: BridgeRule) -> Self {
        let (revision, _) = watch::channel(0u64);
        Self {
            symbol,
            rule,
            inner: Mutex::new(Inner {
                state: SyncState::Buffering {
                    pending: VecDeque::new(),
                },
                book: OrderBook::default(),
            }),
            revision,
            fetch_in_flight: AtomicBool::new(false),
        }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    /// Offer a live diff to the state machine.
    pub fn on_diff(&self, diff: DepthDiff) -> DiffAction {
        let mut inner = self.lock();
        match &mut inner.state {
            SyncState::Buffering { pending } => {
                if pending.len() >= MAX_PENDING {
                    pending.pop_front();
                }
                pending.push_back(diff);
                drop(inner);
                if self.begin_fetch() {
                    DiffAction::NeedSnapshot
                } else {
                    DiffAction::Buffered
                }
            }
            SyncState::Synced => {
                let last = inner.book.last_update_id();
                if diff.final_update_id <= last {
                    return DiffAction::Dropped;
                }
                if self.rule.bridges(last, diff.first_update_id, diff.final_update_id) {
                    inner.book.apply_levels(&diff.bids, &diff.asks);
                    inner.book.set_last_update_id(diff.final_update_id);
                    let update = self.view(&inner.book);
                    drop(inner);
                    self.bump_revision();
                    DiffAction::Applied(update)
                } else {
                    tracing::warn!(
                        symbol = %self.symbol,
                        expected = last + 1,
                        got_first = diff.first_update_id,
                        got_final = diff.final_update_id,
                        "depth sequence gap detected, resyncing"
                    );
                    let mut pending = VecDeque::new();
                    pending.push_back(diff);
                    inner.state = SyncState::Buffering { pending };
                    drop(inner);
                    if self.begin_fetch() {
                        DiffAction::NeedSnapshot
                    } else {
                        DiffAction::Buffered
                    }
                }
            }
        }
    }

    /// Reconcile a fetched snapshot against the buffered diffs.
    ///
    /// The snapshot plus the applicable buffered tail become visible to
    /// waiters as one atomic revision.
    pub fn apply_snapshot(&self, snapshot: DepthSnapshot) -> SnapshotOutcome {
        let mut inner = self.lock();

        let pending = match &mut inner.state {
            SyncState::Synced => {
                self.fetch_in_flight.store(false, Ordering::SeqCst);
                return SnapshotOutcome::AlreadySynced;
            }
            SyncState::Buffering { pending } => std::mem::take(pending),
        };

        let snapshot_id = snapshot.last_update_id;
        let mut dropped = 0usize;
        let mut tail: VecDeque<DepthDiff> = pending
            .into_iter()
            .filter(|d| {
                let stale = d.final_update_id <= snapshot_id;
                dropped += usize::from(stale);
                !stale
            })
            .collect();

        if let Some(first) = tail.front() {
            if !self
                .rule
                .bridges(snapshot_id, first.first_update_id, first.final_update_id)
            {
                tracing::warn!(
                    symbol = %self.symbol,
                    snapshot_id,
                    buffered_first = first.first_update_id,
                    buffered_final = first.final_update_id,
                    "buffered diffs do not bridge snapshot, refetching"
                );
                inner.state = SyncState::Buffering { pending: tail };
                return SnapshotOutcome::NeedRefetch;
            }
        }

        // Drain into a scratch book so pollers never observe a half-applied
        // snapshot; `inner.book` is replaced only when the whole tail lands.
        let mut book = OrderBook::default();
        book.load_snapshot(&snapshot.bids, &snapshot.asks, snapshot_id);

        while let Some(diff) = tail.pop_front() {
            let last = book.last_update_id();
            if diff.final_update_id <= last {
                dropped += 1;
                continue;
            }
            if self.rule.bridges(last, diff.first_update_id, diff.final_update_id) {
                book.apply_levels(&diff.bids, &diff.asks);
                book.set_last_update_id(diff.final_update_id);
            } else {
                // Gap inside the buffered tail itself; resync from here.
                let mut pending = VecDeque::with_capacity(tail.len() + 1);
                pending.push_back(diff);
                pending.append(&mut tail);
                inner.state = SyncState::Buffering { pending };
                return SnapshotOutcome::NeedRefetch;
            }
        }

        inner.book = book;
        inner.state = SyncState::Synced;
        self.fetch_in_flight.store(false, Ordering::SeqCst);
        let update = self.view(&inner.book);
        tracing::info!(
            symbol = %self.symbol,
            snapshot_id,
            last_update_id = update.last_update_id,
            dropped,
            "depth stream synchronized"
        );
        drop(inner);
        self.bump_revision();
        SnapshotOutcome::Applied(update)
    }

    /// Claim the in-flight fetch slot. At most one fetch task runs per
    /// buffering episode; the slot is released when a snapshot synchronizes
    /// the book or the fetch task gives up.
    fn begin_fetch(&self) -> bool {
        self.fetch_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Release the fetch slot without synchronizing (fetch task gave up).
    pub fn abandon_fetch(&self) {
        self.fetch_in_flight.store(false, Ordering::SeqCst);
    }

    // ── Handle accessors ─────────────────────────────────────────────────

    pub fn is_ready(&self) -> bool {
        matches!(self.lock().state, SyncState::Synced)
    }

    pub fn last_update_id(&self) -> u64 {
        self.lock().book.last_update_id()
    }

    pub fn bids(&self) -> Vec<Level> {
        self.lock().book.bids_vec()
    }

    pub fn asks(&self) -> Vec<Level> {
        self.lock().book.asks_vec()
    }

    pub fn best_bid(&self) -> Option<Level> {
        self.lock().book.best_bid()
    }

    pub fn best_ask(&self) -> Option<Level> {
        self.lock().book.best_ask()
    }

    pub fn level_counts(&self) -> (usize, usize) {
        self.lock().book.level_counts()
    }

    pub fn subscribe_revision(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn view(&self, book: &OrderBook) -> BookUpdate {
        BookUpdate {
            symbol: self.symbol.clone(),
            last_update_id: book.last_update_id(),
            bids: book.bids_vec(),
            asks: book.asks_vec(),
        }
    }

    fn bump_revision(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Lock is never held across await points or panicking code paths.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
