//! Authoritative in-memory collection of bridge legs, keyed by chain id then hash.
//!
//! Every mutation is published twice: synchronously to registered
//! [`StoreSubscriber`]s (filtered to the subset they asked for) and on a
//! broadcast channel used by the persistence task. Both see mutations in the
//! order they were merged.

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use super::{normalize_hash, BridgeTxn, TxKey};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Result of an [`TransactionStore::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// A change to the store, carrying the affected records.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Upserted(Vec<BridgeTxn>),
    Removed(Vec<BridgeTxn>),
}

impl StoreEvent {
    pub fn records(&self) -> &[BridgeTxn] {
        match self {
            StoreEvent::Upserted(v) | StoreEvent::Removed(v) => v,
        }
    }

    /// The part of this event visible through `filter`, or `None` if nothing matches.
    pub fn filtered(&self, filter: &TxFilter) -> Option<StoreEvent> {
        let keep = |v: &Vec<BridgeTxn>| -> Vec<BridgeTxn> {
            v.iter().filter(|tx| filter.matches(tx)).cloned().collect()
        };
        let event = match self {
            StoreEvent::Upserted(v) => StoreEvent::Upserted(keep(v)),
            StoreEvent::Removed(v) => StoreEvent::Removed(keep(v)),
        };
        if event.records().is_empty() {
            None
        } else {
            Some(event)
        }
    }
}

/// Selects records by chain and/or account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxFilter {
    pub chain_id: Option<u64>,
    pub account: Option<String>,
    /// Only consulted by the read surface; the store has no notion of dismissal.
    #[serde(default)]
    pub include_dismissed: bool,
}

impl TxFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn chain(chain_id: u64) -> Self {
        Self { chain_id: Some(chain_id), ..Self::default() }
    }

    pub fn account(account: &str) -> Self {
        Self { account: Some(account.to_ascii_lowercase()), ..Self::default() }
    }

    pub fn matches(&self, tx: &BridgeTxn) -> bool {
        self.chain_id.map_or(true, |id| tx.chain_id == id)
            && self.account.as_deref().map_or(true, |a| tx.sender.eq_ignore_ascii_case(a))
    }
}

/// Receives store changes.
pub trait StoreSubscriber: Send + Sync {
    fn on_change(&self, event: &StoreEvent);
}

impl<F> StoreSubscriber for F
where
    F: Fn(&StoreEvent) + Send + Sync,
{
    fn on_change(&self, event: &StoreEvent) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    filter: TxFilter,
    subscriber: Arc<dyn StoreSubscriber>,
}

pub struct TransactionStore {
    records: RwLock<HashMap<u64, HashMap<String, BridgeTxn>>>,
    subscribers: RwLock<Vec<Subscription>>,
    events: broadcast::Sender<StoreEvent>,
    next_id: AtomicU64,
    /// Held from merge until delivery. The flag is set while this thread is
    /// draining `outbox`, so a write made from a callback is queued behind
    /// the event being delivered instead of overtaking it.
    sequencer: ReentrantMutex<Cell<bool>>,
    outbox: Mutex<VecDeque<StoreEvent>>,
}

/// Clears the draining flag even if a subscriber panics.
struct Draining<'a>(&'a Cell<bool>);

impl Drop for Draining<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl Default for TransactionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            records: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
            events,
            next_id: AtomicU64::new(1),
            sequencer: ReentrantMutex::new(Cell::new(false)),
            outbox: Mutex::new(VecDeque::new()),
        }
    }

    /// Seeds the store with previously persisted records. Emits no events.
    pub fn load(&self, records: impl IntoIterator<Item = BridgeTxn>) -> usize {
        let mut map = self.records.write();
        let mut count = 0;
        for tx in records {
            let tx = tx.normalized();
            map.entry(tx.chain_id).or_default().insert(tx.tx_hash.clone(), tx);
            count += 1;
        }
        count
    }

    /// Inserts an unseen `(chainId, txHash)` or merges into the existing record.
    /// Concurrent upserts of the same key are sequenced from merge through
    /// delivery, so observers never see a key's state move backwards.
    pub fn upsert(&self, tx: BridgeTxn) -> UpsertOutcome {
        let tx = tx.normalized();
        let draining = self.sequencer.lock();
        let (outcome, current) = {
            let mut map = self.records.write();
            let chain = map.entry(tx.chain_id).or_default();
            match chain.get_mut(&tx.tx_hash) {
                Some(existing) => {
                    if existing.merge(&tx) {
                        (UpsertOutcome::Updated, existing.clone())
                    } else {
                        return UpsertOutcome::Unchanged;
                    }
                }
                None => {
                    chain.insert(tx.tx_hash.clone(), tx.clone());
                    (UpsertOutcome::Inserted, tx)
                }
            }
        };
        debug!(key = %current.key(), ?outcome, "store upsert");
        self.publish(&draining, StoreEvent::Upserted(vec![current]));
        outcome
    }

    pub fn get(&self, chain_id: u64, tx_hash: &str) -> Option<BridgeTxn> {
        self.records.read().get(&chain_id)?.get(&normalize_hash(tx_hash)).cloned()
    }

    pub fn get_key(&self, key: &TxKey) -> Option<BridgeTxn> {
        self.get(key.chain_id, &key.tx_hash)
    }

    pub fn contains(&self, chain_id: u64, tx_hash: &str) -> bool {
        self.records
            .read()
            .get(&chain_id)
            .map_or(false, |c| c.contains_key(&normalize_hash(tx_hash)))
    }

    /// Records on any chain whose `partnerTxHash` is `tx_hash`.
    pub fn partners_of(&self, tx_hash: &str) -> Vec<BridgeTxn> {
        let hash = normalize_hash(tx_hash);
        self.collect(|tx| tx.partner_tx_hash.as_deref() == Some(hash.as_str()))
    }

    pub fn list_by_chain(&self, chain_id: u64) -> Vec<BridgeTxn> {
        self.list(&TxFilter::chain(chain_id))
    }

    pub fn list_by_account(&self, sender: &str) -> Vec<BridgeTxn> {
        self.list(&TxFilter::account(sender))
    }

    /// Newest first.
    pub fn list(&self, filter: &TxFilter) -> Vec<BridgeTxn> {
        let mut out = self.collect(|tx| filter.matches(tx));
        out.sort_by(|a, b| {
            b.timestamp_created.cmp(&a.timestamp_created).then_with(|| a.key().cmp(&b.key()))
        });
        out
    }

    /// Records the poller still has to look at.
    pub fn open_records(&self) -> Vec<BridgeTxn> {
        self.collect(|tx| !tx.is_settled())
    }

    pub fn snapshot(&self) -> Vec<BridgeTxn> {
        self.collect(|_| true)
    }

    pub fn len(&self) -> usize {
        self.records.read().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remove(&self, chain_id: u64, tx_hash: &str) -> Option<BridgeTxn> {
        let draining = self.sequencer.lock();
        let removed = {
            let mut map = self.records.write();
            let chain = map.get_mut(&chain_id)?;
            let removed = chain.remove(&normalize_hash(tx_hash));
            if chain.is_empty() {
                map.remove(&chain_id);
            }
            removed
        }?;
        self.publish(&draining, StoreEvent::Removed(vec![removed.clone()]));
        Some(removed)
    }

    /// Clear-history for one account.
    pub fn remove_by_account(&self, sender: &str) -> Vec<BridgeTxn> {
        let filter = TxFilter::account(sender);
        let draining = self.sequencer.lock();
        let removed: Vec<BridgeTxn> = {
            let mut map = self.records.write();
            let mut removed = Vec::new();
            for chain in map.values_mut() {
                let keys: Vec<String> = chain
                    .values()
                    .filter(|tx| filter.matches(tx))
                    .map(|tx| tx.tx_hash.clone())
                    .collect();
                for k in keys {
                    if let Some(tx) = chain.remove(&k) {
                        removed.push(tx);
                    }
                }
            }
            map.retain(|_, chain| !chain.is_empty());
            removed
        };
        if !removed.is_empty() {
            self.publish(&draining, StoreEvent::Removed(removed.clone()));
        }
        removed
    }

    pub fn subscribe<S>(&self, filter: TxFilter, subscriber: S) -> SubscriptionId
    where
        S: StoreSubscriber + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push(Subscription {
            id,
            filter,
            subscriber: Arc::new(subscriber),
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Raw change feed, used by the persistence task.
    pub fn events(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn collect(&self, pred: impl Fn(&BridgeTxn) -> bool) -> Vec<BridgeTxn> {
        self.records.read().values().flat_map(|c| c.values()).filter(|tx| pred(tx)).cloned().collect()
    }

    /// Caller holds the sequencer. Delivery happens outside the record lock so
    /// callbacks may read the store.
    fn publish(&self, draining: &Cell<bool>, event: StoreEvent) {
        self.outbox.lock().push_back(event);
        if draining.replace(true) {
            return;
        }
        let _reset = Draining(draining);
        loop {
            let Some(event) = self.outbox.lock().pop_front() else {
                break;
            };
            self.deliver(&event);
        }
    }

    fn deliver(&self, event: &StoreEvent) {
        // No receivers is fine.
        let _ = self.events.send(event.clone());

        let targets: Vec<(TxFilter, Arc<dyn StoreSubscriber>)> = self
            .subscribers
            .read()
            .iter()
            .map(|s| (s.filter.clone(), s.subscriber.clone()))
            .collect();
        for (filter, subscriber) in targets {
            if let Some(subset) = event.filtered(&filter) {
                subscriber.on_change(&subset);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{BridgeTxnType, OutgoingMessageState};
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    fn deposit(n: u8) -> BridgeTxn {
        BridgeTxn::new(BridgeTxnType::DepositL1, 1, &hash(n), ALICE).created_at(n as i64)
    }

    #[test]
    fn test_insert_then_resubmit_is_noop() {
        let store = TransactionStore::new();
        assert_eq!(store.upsert(deposit(1)), UpsertOutcome::Inserted);
        assert_eq!(store.upsert(deposit(1).created_at(5_000)), UpsertOutcome::Unchanged);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(1, &hash(1)).unwrap().timestamp_created, 1);
    }

    #[test]
    fn test_same_hash_on_other_chain_is_distinct() {
        let store = TransactionStore::new();
        store.upsert(deposit(1));
        let mut other = deposit(1);
        other.chain_id = 42161;
        assert_eq!(store.upsert(other), UpsertOutcome::Inserted);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_mixed_case_hash_hits_same_key() {
        let store = TransactionStore::new();
        store.upsert(deposit(0xab));
        let upper = hash(0xab).to_uppercase().replacen("0X", "0x", 1);
        assert!(store.get(1, &upper).is_some());
        assert_eq!(
            store.upsert(BridgeTxn::new(BridgeTxnType::DepositL1, 1, &upper, ALICE)),
            UpsertOutcome::Unchanged
        );
    }

    #[test]
    fn test_patch_updates_and_notifies_subset() {
        let store = TransactionStore::new();
        let seen: Arc<Mutex<Vec<StoreEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        store.subscribe(TxFilter::chain(42161), move |e: &StoreEvent| sink.lock().push(e.clone()));

        store.upsert(deposit(1));
        let w = BridgeTxn::new(BridgeTxnType::Withdraw, 42161, &hash(2), BOB);
        store.upsert(w.clone());
        let mut patch = w.clone();
        patch.outgoing_message_state = Some(OutgoingMessageState::Unconfirmed);
        assert_eq!(store.upsert(patch.clone()), UpsertOutcome::Updated);
        assert_eq!(store.upsert(patch), UpsertOutcome::Unchanged);

        let events = seen.lock();
        assert_eq!(events.len(), 2, "chain-1 insert and the no-op must not be delivered");
        assert!(matches!(&events[1], StoreEvent::Upserted(v) if v[0].outgoing_message_state.is_some()));
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let store = TransactionStore::new();
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        let id = store.subscribe(TxFilter::all(), move |_: &StoreEvent| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        store.upsert(deposit(1));
        assert!(store.unsubscribe(id));
        store.upsert(deposit(2));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!store.unsubscribe(id));
    }

    #[test]
    fn test_queries_and_ordering() {
        let store = TransactionStore::new();
        store.upsert(deposit(1));
        store.upsert(deposit(3));
        store.upsert(BridgeTxn::new(BridgeTxnType::Withdraw, 42161, &hash(2), BOB).created_at(2));

        let alice: Vec<_> = store.list_by_account(ALICE).into_iter().map(|t| t.timestamp_created).collect();
        assert_eq!(alice, vec![3, 1]);
        assert_eq!(store.list_by_chain(42161).len(), 1);
        assert_eq!(store.list(&TxFilter::all()).len(), 3);
    }

    #[test]
    fn test_remove_and_clear_history() {
        let store = TransactionStore::new();
        let mut rx = store.events();
        store.upsert(deposit(1));
        store.upsert(deposit(2));
        store.upsert(BridgeTxn::new(BridgeTxnType::Withdraw, 42161, &hash(3), BOB));

        assert!(store.remove(1, &hash(1)).is_some());
        assert!(store.remove(1, &hash(1)).is_none());
        let cleared = store.remove_by_account(ALICE);
        assert_eq!(cleared.len(), 1);
        assert_eq!(store.len(), 1);

        let mut removed = 0;
        while let Ok(ev) = rx.try_recv() {
            if let StoreEvent::Removed(v) = ev {
                removed += v.len();
            }
        }
        assert_eq!(removed, 2);
    }

    #[test]
    fn test_open_records_and_partners() {
        let store = TransactionStore::new();
        let mut done = deposit(1);
        done.tx_type = BridgeTxnType::Approve;
        done.receipt = Some(receipt(true, 1));
        store.upsert(done);
        store.upsert(deposit(2));
        store.upsert(BridgeTxn::new(BridgeTxnType::DepositL2, 42161, &hash(3), ALICE).with_partner(&hash(2)));

        let open: Vec<_> = store.open_records().into_iter().map(|t| t.tx_hash).collect();
        assert_eq!(open.len(), 2);
        assert!(!open.contains(&hash(1)));
        assert_eq!(store.partners_of(&hash(2))[0].tx_hash, hash(3));
    }

    #[test]
    fn test_load_emits_nothing() {
        let store = TransactionStore::new();
        let mut rx = store.events();
        assert_eq!(store.load(vec![deposit(1), deposit(2)]), 2);
        assert!(rx.try_recv().is_err());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_concurrent_upserts_keep_monotonic_state() {
        let store = Arc::new(TransactionStore::new());
        let base = BridgeTxn::new(BridgeTxnType::Withdraw, 42161, &hash(9), ALICE);
        store.upsert(base.clone());

        let handles: Vec<_> = [
            OutgoingMessageState::Executed,
            OutgoingMessageState::Unconfirmed,
            OutgoingMessageState::Confirmed,
        ]
        .into_iter()
        .map(|state| {
            let store = store.clone();
            let mut patch = base.clone();
            patch.outgoing_message_state = Some(state);
            std::thread::spawn(move || {
                for _ in 0..100 {
                    store.upsert(patch.clone());
                }
            })
        })
        .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(
            store.get(42161, &hash(9)).unwrap().outgoing_message_state,
            Some(OutgoingMessageState::Executed)
        );
    }

    #[test]
    fn test_observers_never_see_message_state_regress() {
        for _ in 0..200 {
            let store = Arc::new(TransactionStore::new());
            let base = BridgeTxn::new(BridgeTxnType::Withdraw, 42161, &hash(9), ALICE);
            store.upsert(base.clone());

            let seen: Arc<Mutex<Vec<OutgoingMessageState>>> = Arc::new(Mutex::new(Vec::new()));
            let sink = seen.clone();
            store.subscribe(TxFilter::all(), move |e: &StoreEvent| {
                if let Some(state) = e.records()[0].outgoing_message_state {
                    sink.lock().push(state);
                }
            });
            let mut feed = store.events();

            let handles: Vec<_> = [
                OutgoingMessageState::Unconfirmed,
                OutgoingMessageState::Confirmed,
                OutgoingMessageState::Executed,
            ]
            .into_iter()
            .map(|state| {
                let store = store.clone();
                let mut patch = base.clone();
                patch.outgoing_message_state = Some(state);
                std::thread::spawn(move || {
                    store.upsert(patch);
                })
            })
            .collect();
            for h in handles {
                h.join().unwrap();
            }

            let seen = seen.lock().clone();
            assert!(seen.windows(2).all(|w| w[0] < w[1]), "subscriber saw {:?}", seen);
            let mut fed = Vec::new();
            while let Ok(ev) = feed.try_recv() {
                fed.extend(ev.records()[0].outgoing_message_state);
            }
            assert_eq!(fed, seen);
        }
    }

    #[test]
    fn test_write_from_callback_is_delivered_after_current_event() {
        let store = Arc::new(TransactionStore::new());
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let writer = Arc::downgrade(&store);
        store.subscribe(TxFilter::chain(1), move |e: &StoreEvent| {
            let tx = &e.records()[0];
            if let (StoreEvent::Upserted(_), Some(store)) = (e, writer.upgrade()) {
                store.upsert(BridgeTxn::new(BridgeTxnType::DepositL2, 42161, &hash(2), ALICE).with_partner(&tx.tx_hash));
            }
        });
        let sink = seen.clone();
        store.subscribe(TxFilter::all(), move |e: &StoreEvent| {
            sink.lock().push(e.records()[0].tx_hash.clone());
        });

        store.upsert(deposit(1));
        assert_eq!(*seen.lock(), vec![hash(1), hash(2)]);
        assert_eq!(store.len(), 2);
    }
}
