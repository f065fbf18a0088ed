use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::bus::{ChainEvent, EventBus};
use crate::config::TransactionsConfig;
use crate::errors::{ChainError, ChainResult};
use crate::ledger::Ledger;
use crate::types::{Address, Transaction, TransactionId};

/// Received and validated entries that never become ready expire after
/// this many seconds.
const UNPROCESSED_EXPIRY_SECS: u64 = 10_800;
/// Pending multisignature lifetime when the sender registration carries
/// none, in hours.
const DEFAULT_PENDING_LIFETIME_HOURS: u64 = 24;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueKind {
    Received,
    Validated,
    Verified,
    Pending,
}

#[derive(Clone, Debug)]
struct Entry {
    transaction: Transaction,
    received_at: u64,
    bundled: bool,
}

/// Insertion-ordered id → entry map.
#[derive(Default)]
struct Queue {
    order: VecDeque<TransactionId>,
    entries: HashMap<TransactionId, Entry>,
}

impl Queue {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    fn push_back(&mut self, entry: Entry) {
        self.order.push_back(entry.transaction.id.clone());
        self.entries.insert(entry.transaction.id.clone(), entry);
    }

    fn push_front(&mut self, entry: Entry) {
        self.order.push_front(entry.transaction.id.clone());
        self.entries.insert(entry.transaction.id.clone(), entry);
    }

    fn remove(&mut self, id: &str) -> Option<Entry> {
        let entry = self.entries.remove(id)?;
        self.order.retain(|existing| existing != id);
        Some(entry)
    }

    fn pop_front(&mut self) -> Option<Entry> {
        let id = self.order.pop_front()?;
        self.entries.remove(&id)
    }

    fn in_order(&self) -> impl Iterator<Item = &Entry> {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }

    /// Oldest entry with the lowest fee per byte, the eviction victim.
    fn eviction_candidate(&self) -> Option<TransactionId> {
        self.in_order()
            .min_by_key(|entry| (entry.transaction.fee_per_byte(), entry.received_at))
            .map(|entry| entry.transaction.id.clone())
    }
}

#[derive(Default)]
struct PoolInner {
    received: Queue,
    validated: Queue,
    verified: Queue,
    pending: Queue,
    by_sender: HashMap<Address, HashSet<TransactionId>>,
    /// Unconfirmed balance reservations per sender; the u_state shadow.
    reserved: HashMap<Address, u128>,
}

impl PoolInner {
    fn queue(&mut self, kind: QueueKind) -> &mut Queue {
        match kind {
            QueueKind::Received => &mut self.received,
            QueueKind::Validated => &mut self.validated,
            QueueKind::Verified => &mut self.verified,
            QueueKind::Pending => &mut self.pending,
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.received.contains(id)
            || self.validated.contains(id)
            || self.verified.contains(id)
            || self.pending.contains(id)
    }

    fn index_sender(&mut self, tx: &Transaction) {
        self.by_sender
            .entry(tx.sender_id.clone())
            .or_default()
            .insert(tx.id.clone());
    }

    fn unindex_sender(&mut self, tx: &Transaction) {
        if let Some(ids) = self.by_sender.get_mut(&tx.sender_id) {
            ids.remove(&tx.id);
            if ids.is_empty() {
                self.by_sender.remove(&tx.sender_id);
            }
        }
    }

    fn remove_everywhere(&mut self, id: &str) -> Option<(QueueKind, Entry)> {
        for kind in [
            QueueKind::Received,
            QueueKind::Validated,
            QueueKind::Verified,
            QueueKind::Pending,
        ] {
            if let Some(entry) = self.queue(kind).remove(id) {
                self.unindex_sender(&entry.transaction);
                return Some((kind, entry));
            }
        }
        None
    }

    fn reserve(&mut self, address: &str, amount: u128) {
        *self.reserved.entry(address.to_string()).or_insert(0) += amount;
    }

    fn release(&mut self, address: &str, amount: u128) {
        if let Some(reserved) = self.reserved.get_mut(address) {
            *reserved = reserved.saturating_sub(amount);
            if *reserved == 0 {
                self.reserved.remove(address);
            }
        }
    }

    fn reserved_for(&self, address: &str) -> u128 {
        self.reserved.get(address).copied().unwrap_or(0)
    }
}

#[derive(Clone, Copy, Debug, Default, serde::Serialize)]
pub struct PoolCounts {
    pub received: usize,
    pub validated: usize,
    pub verified: usize,
    pub pending: usize,
    pub total: usize,
}

#[derive(Clone, Debug, Default)]
pub struct PoolQuery {
    pub tx_type: Option<u8>,
    pub sender_id: Option<Address>,
    pub limit: Option<usize>,
}

/// Unconfirmed transaction store. Transactions move received → validated →
/// verified (ready for forging/sharing); multisignature transactions wait
/// in pending until their threshold is met or their lifetime runs out.
pub struct TransactionPool {
    config: TransactionsConfig,
    ledger: Arc<Ledger>,
    bus: Arc<EventBus>,
    inner: RwLock<PoolInner>,
}

impl TransactionPool {
    pub fn new(config: TransactionsConfig, ledger: Arc<Ledger>, bus: Arc<EventBus>) -> Self {
        Self {
            config,
            ledger,
            bus,
            inner: RwLock::new(PoolInner::default()),
        }
    }

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    /// Validate and park a transaction in the received queue. Bundled
    /// transactions are broadcast once they reach the ready queue.
    pub fn add(&self, transaction: Transaction, bundled: bool) -> ChainResult<()> {
        transaction.validate_schema()?;
        let mut inner = self.inner.write();
        if inner.contains(&transaction.id) {
            return Err(ChainError::Pool(format!(
                "transaction {} already in pool",
                transaction.id
            )));
        }
        Self::make_room(&mut inner, QueueKind::Received, self.config.max_transactions_per_queue)?;
        let entry = Entry {
            transaction,
            received_at: Self::now(),
            bundled,
        };
        inner.index_sender(&entry.transaction);
        inner.received.push_back(entry);
        Ok(())
    }

    /// Fast path: take a transaction straight through validated → verified
    /// against current chain state. Emits the unconfirmed event; the
    /// broadcaster picks it up when `broadcast` is set.
    pub fn process_unconfirmed(&self, transaction: Transaction, broadcast: bool) -> ChainResult<()> {
        transaction.validate_schema()?;
        {
            let inner = self.inner.read();
            if inner.contains(&transaction.id) {
                return Err(ChainError::Pool(format!(
                    "transaction {} already in pool",
                    transaction.id
                )));
            }
        }
        self.promote(
            Entry {
                transaction,
                received_at: Self::now(),
                bundled: false,
            },
            broadcast,
        )
    }

    /// Drain the received queue, promoting entries toward the ready queue.
    /// Per-transaction failures are logged and the batch continues.
    pub fn process_received(&self, limit: usize) -> usize {
        let mut processed = 0;
        for _ in 0..limit {
            let entry = {
                let mut inner = self.inner.write();
                match inner.received.pop_front() {
                    Some(entry) => {
                        inner.unindex_sender(&entry.transaction);
                        entry
                    }
                    None => break,
                }
            };
            let broadcast = entry.bundled;
            let id = entry.transaction.id.clone();
            match self.promote(entry, broadcast) {
                Ok(()) => processed += 1,
                Err(err) => {
                    debug!(%id, %err, "dropping pooled transaction");
                }
            }
        }
        processed
    }

    /// Verify against state, reserve unconfirmed balance and move into the
    /// ready queue, or park a under-signed multisig transaction in pending.
    fn promote(&self, entry: Entry, broadcast: bool) -> ChainResult<()> {
        let tx = &entry.transaction;
        if let Some(sender) = self.ledger.get_account(&tx.sender_id) {
            if sender.is_multisig() {
                let members = self.ledger.multisig_members(&tx.sender_id).unwrap_or_default();
                if tx.count_valid_member_signatures(&members) < sender.multimin as usize {
                    let mut inner = self.inner.write();
                    Self::make_room(
                        &mut inner,
                        QueueKind::Pending,
                        self.config.max_transactions_per_queue,
                    )?;
                    inner.index_sender(tx);
                    inner.pending.push_back(entry);
                    return Ok(());
                }
            }
        }
        self.ledger.verify_transaction(tx)?;
        let total = tx.amount + u128::from(tx.fee);
        {
            let mut inner = self.inner.write();
            let available = self
                .ledger
                .balance_of(&tx.sender_id)
                .saturating_sub(inner.reserved_for(&tx.sender_id));
            if available < total {
                return Err(ChainError::Pool(format!(
                    "unconfirmed balance exceeded for {}",
                    tx.sender_id
                )));
            }
            Self::make_room(
                &mut inner,
                QueueKind::Verified,
                self.config.max_transactions_per_queue,
            )?;
            inner.reserve(&tx.sender_id, total);
            inner.index_sender(tx);
            inner.verified.push_back(entry.clone());
        }
        self.bus.publish(&ChainEvent::UnconfirmedTransaction {
            transaction: Arc::new(entry.transaction),
            broadcast,
        });
        Ok(())
    }

    fn make_room(inner: &mut PoolInner, kind: QueueKind, capacity: usize) -> ChainResult<()> {
        if inner.queue(kind).len() < capacity {
            return Ok(());
        }
        match kind {
            QueueKind::Received | QueueKind::Validated => {
                if let Some(victim) = inner.queue(kind).eviction_candidate() {
                    if let Some(entry) = inner.queue(kind).remove(&victim) {
                        inner.unindex_sender(&entry.transaction);
                        warn!(id = %victim, "evicting lowest-fee pooled transaction");
                        return Ok(());
                    }
                }
                Err(ChainError::Pool("transaction queue full".into()))
            }
            QueueKind::Verified | QueueKind::Pending => {
                Err(ChainError::Pool("transaction queue full".into()))
            }
        }
    }

    /// Ready transactions merged across queues, best fee-per-byte first,
    /// oldest first on ties. Used for both forging and peer sharing.
    pub fn merged_transaction_list(&self, reverse: bool, limit: usize) -> Vec<Transaction> {
        let inner = self.inner.read();
        let mut entries: Vec<&Entry> = inner.verified.in_order().collect();
        entries.sort_by(|a, b| {
            b.transaction
                .fee_per_byte()
                .cmp(&a.transaction.fee_per_byte())
                .then_with(|| a.received_at.cmp(&b.received_at))
        });
        if reverse {
            entries.reverse();
        }
        entries
            .into_iter()
            .take(limit)
            .map(|entry| entry.transaction.clone())
            .collect()
    }

    pub fn counts(&self) -> PoolCounts {
        let inner = self.inner.read();
        let counts = PoolCounts {
            received: inner.received.len(),
            validated: inner.validated.len(),
            verified: inner.verified.len(),
            pending: inner.pending.len(),
            total: 0,
        };
        PoolCounts {
            total: counts.received + counts.validated + counts.verified + counts.pending,
            ..counts
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().contains(id)
    }

    pub fn pooled_transactions(&self, query: &PoolQuery) -> Vec<Transaction> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        for queue in [&inner.received, &inner.validated, &inner.verified, &inner.pending] {
            for entry in queue.in_order() {
                let tx = &entry.transaction;
                if let Some(tx_type) = query.tx_type {
                    if tx.tx_type() != tx_type {
                        continue;
                    }
                }
                if let Some(sender) = &query.sender_id {
                    if !tx.sender_id.eq_ignore_ascii_case(sender) {
                        continue;
                    }
                }
                out.push(tx.clone());
            }
        }
        if let Some(limit) = query.limit {
            out.truncate(limit);
        }
        out
    }

    /// Unconfirmed balance visible to new transactions: confirmed balance
    /// minus outstanding reservations.
    pub fn unconfirmed_balance(&self, address: &str) -> u128 {
        let reserved = self.inner.read().reserved_for(address);
        self.ledger.balance_of(address).saturating_sub(reserved)
    }

    /// Confirmed transactions leave every queue and release reservations.
    pub fn on_confirmed(&self, transactions: &[Transaction]) {
        let mut inner = self.inner.write();
        for tx in transactions {
            if let Some((kind, entry)) = inner.remove_everywhere(&tx.id) {
                if kind == QueueKind::Verified {
                    let total = entry.transaction.amount + u128::from(entry.transaction.fee);
                    inner.release(&entry.transaction.sender_id, total);
                }
            }
        }
    }

    /// Transactions from a deleted block re-enter the ready queue at the
    /// head, in reverse order, with their reservations restored.
    pub fn on_deleted(&self, transactions: &[Transaction]) {
        let mut inner = self.inner.write();
        for tx in transactions.iter().rev() {
            if inner.contains(&tx.id) {
                continue;
            }
            let total = tx.amount + u128::from(tx.fee);
            inner.reserve(&tx.sender_id, total);
            inner.index_sender(tx);
            inner.verified.push_front(Entry {
                transaction: tx.clone(),
                received_at: Self::now(),
                bundled: false,
            });
        }
    }

    /// Periodic sweep: drop expired pending multisig transactions and
    /// unprocessed entries that sat too long. Returns the removed ids.
    pub fn expire(&self) -> Vec<TransactionId> {
        let now = Self::now();
        let mut inner = self.inner.write();
        let mut expired = Vec::new();
        let pending_ids: Vec<TransactionId> = inner
            .pending
            .in_order()
            .filter(|entry| {
                let lifetime_hours = self
                    .ledger
                    .get_account(&entry.transaction.sender_id)
                    .map(|account| u64::from(account.multilifetime))
                    .filter(|hours| *hours > 0)
                    .unwrap_or(DEFAULT_PENDING_LIFETIME_HOURS);
                now.saturating_sub(entry.received_at) > lifetime_hours * 3_600
            })
            .map(|entry| entry.transaction.id.clone())
            .collect();
        for kind in [QueueKind::Received, QueueKind::Validated] {
            let stale: Vec<TransactionId> = inner
                .queue(kind)
                .in_order()
                .filter(|entry| now.saturating_sub(entry.received_at) > UNPROCESSED_EXPIRY_SECS)
                .map(|entry| entry.transaction.id.clone())
                .collect();
            for id in stale {
                if let Some(entry) = inner.queue(kind).remove(&id) {
                    inner.unindex_sender(&entry.transaction);
                    expired.push(id);
                }
            }
        }
        for id in pending_ids {
            if let Some(entry) = inner.pending.remove(&id) {
                inner.unindex_sender(&entry.transaction);
                expired.push(id);
            }
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired pooled transactions");
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{
        address_from_public_key, keypair_from_secret, sign_message, signature_to_hex,
    };
    use crate::ledger::HandlerRegistry;
    use crate::types::TransactionAsset;
    use ed25519_dalek::Keypair;

    fn setup(balance: u128) -> (Arc<Ledger>, Arc<EventBus>, TransactionPool, Keypair) {
        let keypair = keypair_from_secret(&[7u8; 32]).expect("keypair");
        let ledger = Arc::new(Ledger::new(HandlerRegistry::builtin()));
        let address = address_from_public_key(&keypair.public);
        ledger.with_account_mut(&address, |account| {
            account.public_key = Some(hex::encode(keypair.public.to_bytes()));
            account.balance = balance;
            account.u_balance = balance;
        });
        let bus = Arc::new(EventBus::new());
        let pool = TransactionPool::new(TransactionsConfig::default(), ledger.clone(), bus.clone());
        (ledger, bus, pool, keypair)
    }

    fn transfer(keypair: &Keypair, amount: u128, fee: u64, timestamp: u64) -> Transaction {
        let mut tx = Transaction {
            id: String::new(),
            sender_public_key: hex::encode(keypair.public.to_bytes()),
            sender_id: address_from_public_key(&keypair.public),
            recipient_id: Some("cc".repeat(32)),
            amount,
            fee,
            timestamp,
            asset: TransactionAsset::Transfer { data: None },
            signature: String::new(),
            sign_signature: None,
            signatures: None,
        };
        tx.signature = signature_to_hex(&sign_message(keypair, &tx.signing_bytes()));
        tx.id = tx.compute_id();
        tx
    }

    #[test]
    fn process_unconfirmed_reserves_balance_and_emits_event() {
        let (_ledger, bus, pool, keypair) = setup(1_000);
        let events = Arc::new(RwLock::new(Vec::new()));
        {
            let events = events.clone();
            bus.subscribe(move |event| {
                if let ChainEvent::UnconfirmedTransaction { broadcast, .. } = event {
                    events.write().push(*broadcast);
                }
            });
        }
        let tx = transfer(&keypair, 400, 10, 1);
        pool.process_unconfirmed(tx.clone(), true).expect("process");
        assert_eq!(pool.counts().verified, 1);
        assert_eq!(pool.unconfirmed_balance(&tx.sender_id), 590);
        assert_eq!(*events.read(), vec![true]);
    }

    #[test]
    fn reservations_block_overspending_the_unconfirmed_balance() {
        let (_ledger, _bus, pool, keypair) = setup(1_000);
        pool.process_unconfirmed(transfer(&keypair, 600, 10, 1), false)
            .expect("first");
        let err = pool
            .process_unconfirmed(transfer(&keypair, 600, 10, 2), false)
            .unwrap_err();
        assert!(matches!(err, ChainError::Pool(_)));
    }

    #[test]
    fn duplicates_are_rejected_across_queues() {
        let (_ledger, _bus, pool, keypair) = setup(1_000);
        let tx = transfer(&keypair, 100, 10, 1);
        pool.add(tx.clone(), false).expect("add");
        let err = pool.add(tx.clone(), false).unwrap_err();
        assert!(matches!(err, ChainError::Pool(_)));
        let err = pool.process_unconfirmed(tx, false).unwrap_err();
        assert!(matches!(err, ChainError::Pool(_)));
    }

    #[test]
    fn merged_list_orders_by_fee_per_byte_then_age() {
        let (_ledger, _bus, pool, keypair) = setup(10_000_000_000);
        let cheap = transfer(&keypair, 100, 1_000, 1);
        let costly = transfer(&keypair, 100, 2_000_000, 2);
        pool.process_unconfirmed(cheap.clone(), false).expect("cheap");
        pool.process_unconfirmed(costly.clone(), false).expect("costly");

        let list = pool.merged_transaction_list(false, 10);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, costly.id);
        assert_eq!(list[1].id, cheap.id);

        let reversed = pool.merged_transaction_list(true, 10);
        assert_eq!(reversed[0].id, cheap.id);
    }

    #[test]
    fn confirmed_transactions_leave_the_pool_and_release_reservations() {
        let (_ledger, _bus, pool, keypair) = setup(1_000);
        let tx = transfer(&keypair, 400, 10, 1);
        pool.process_unconfirmed(tx.clone(), false).expect("process");
        pool.on_confirmed(std::slice::from_ref(&tx));
        assert_eq!(pool.counts().total, 0);
        assert_eq!(pool.unconfirmed_balance(&tx.sender_id), 1_000);
    }

    #[test]
    fn deleted_transactions_return_to_the_head_reversed() {
        let (_ledger, _bus, pool, keypair) = setup(10_000);
        let first = transfer(&keypair, 100, 10, 1);
        let second = transfer(&keypair, 200, 10, 2);
        pool.on_deleted(&[first.clone(), second.clone()]);
        let list: Vec<_> = pool
            .merged_transaction_list(false, 10)
            .into_iter()
            .map(|tx| tx.id)
            .collect();
        // Reverse reinsertion puts the block's first transaction back at
        // the head.
        let inner_order: Vec<_> = pool.inner.read().verified.in_order().map(|e| e.transaction.id.clone()).collect();
        assert_eq!(inner_order, vec![first.id.clone(), second.id.clone()]);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn received_queue_evicts_lowest_fee_when_full() {
        let (ledger, bus, _ignored, keypair) = setup(0);
        let pool = TransactionPool::new(
            TransactionsConfig {
                max_transactions_per_queue: 2,
            },
            ledger,
            bus,
        );
        let low = transfer(&keypair, 100, 1, 1);
        let mid = transfer(&keypair, 100, 5_000, 2);
        let high = transfer(&keypair, 100, 9_000_000, 3);
        pool.add(low.clone(), false).expect("low");
        pool.add(mid, false).expect("mid");
        pool.add(high, false).expect("high evicts low");
        assert_eq!(pool.counts().received, 2);
        assert!(!pool.contains(&low.id));
    }
}
