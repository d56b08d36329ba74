use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use priority_queue::PriorityQueue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::{AccountTx, Address, GasPrice, Nonce, PoolTx, TxHash};

use crate::chain::{AccountInfo, ChainView, StateOverlay, StateReader};
use crate::config::AccountPoolConfig;
use crate::error::{MempoolError, ValidationError};
use crate::heightsync::HeightSync;
use crate::pools::{
    PendingStore, PoolListener, QueueRecord, QueueUpdateAdd, QueueUpdateMove, QueuesUpdate,
    RemovalReason, SenderPool, TxBucket,
};
use crate::reserver::{PoolKind, ReservationHandle};
use crate::validator::AnteValidator;

#[derive(Debug, Clone)]
pub struct AccountRecord {
    pub tx: Arc<AccountTx>,
    /// Admission order, used as a deterministic tie breaker.
    pub seq: u64,
    pub seen_at: Instant,
}

/// Nonce-ordered account lane. Per-sender pools split records into a pending
/// run and a gapped remainder; two pool-wide price queues index the cheapest
/// records for eviction.
pub struct AccountPool<S, V> {
    config: AccountPoolConfig,
    chain: Arc<ChainView<S>>,
    validator: Arc<V>,
    reserver: ReservationHandle,
    listener: Arc<dyn PoolListener>,
    /// Hash to owning-lane registry shared with the fee lane.
    registry: Arc<DashMap<TxHash, PoolKind>>,
    store_sync: Arc<HeightSync<PendingStore>>,
    sender_pools: HashMap<Address, SenderPool>,
    records: HashMap<TxHash, AccountRecord>,
    /// All pending transactions sorted by gas price in reverse order, used
    /// for cleaning up the pool when it reaches its capacity.
    pending_price_reversed_queue: PriorityQueue<QueueRecord, Reverse<GasPrice>>,
    /// Same for gapped transactions.
    gapped_price_reversed_queue: PriorityQueue<QueueRecord, Reverse<GasPrice>>,
    insert_seq: u64,
}

impl<S: StateReader, V: AnteValidator> AccountPool<S, V> {
    pub fn new(
        config: AccountPoolConfig,
        chain: Arc<ChainView<S>>,
        validator: Arc<V>,
        reserver: ReservationHandle,
        listener: Arc<dyn PoolListener>,
        registry: Arc<DashMap<TxHash, PoolKind>>,
        store_sync: Arc<HeightSync<PendingStore>>,
    ) -> Self {
        Self {
            config,
            chain,
            validator,
            reserver,
            listener,
            registry,
            store_sync,
            sender_pools: HashMap::new(),
            records: HashMap::new(),
            pending_price_reversed_queue: PriorityQueue::new(),
            gapped_price_reversed_queue: PriorityQueue::new(),
            insert_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.pending_price_reversed_queue.len() + self.gapped_price_reversed_queue.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending_price_reversed_queue.len()
    }

    pub fn gapped_count(&self) -> usize {
        self.gapped_price_reversed_queue.len()
    }

    pub fn get(&self, hash: &TxHash) -> Option<Arc<AccountTx>> {
        self.records.get(hash).map(|meta| Arc::clone(&meta.tx))
    }

    pub fn insert(&mut self, tx: Arc<AccountTx>) -> Result<(), MempoolError> {
        let hash = tx.hash;
        let sender = tx.sender;
        debug!(%hash, %sender, nonce = tx.nonce, "adding tx to account pool");

        if self.registry.contains_key(&hash) {
            return Err(MempoolError::AlreadyKnown);
        }

        self.reserver.hold(std::slice::from_ref(&sender))?;
        let result = self.insert_held(tx);
        if result.is_err() {
            self.release_if_unused(&sender);
        }
        result
    }

    fn insert_held(&mut self, tx: Arc<AccountTx>) -> Result<(), MempoolError> {
        let hash = tx.hash;
        let sender = tx.sender;

        let tx_count = match self.sender_pools.get(&sender) {
            Some(pool) => pool.tx_count,
            None => self.chain.reader().account(&sender)?.nonce,
        };

        if tx.nonce < tx_count {
            return Err(MempoolError::NonceTooLow(tx.nonce, tx_count));
        }

        // a replacement has to outbid the occupant by the configured bump on
        // both caps
        let existing = self
            .sender_pools
            .get(&sender)
            .and_then(|pool| pool.get_by_nonce(tx.nonce))
            .cloned();
        if let Some(existing) = &existing {
            if let Some(occupant) = self.records.get(&existing.tx_hash) {
                let bump = self.config.price_bump_percent;
                if tx.fee_cap < bumped(occupant.tx.fee_cap, bump)
                    || tx.tip_cap < bumped(occupant.tx.tip_cap, bump)
                {
                    return Err(MempoolError::Underpriced);
                }
            }
        }

        self.validate_insert(&tx)?;

        let pool_len = self.len();
        if pool_len > self.config.high_watermark() {
            let gapped_tx = self.gapped_price_reversed_queue.peek();
            let joins_pending = self
                .sender_pools
                .get(&sender)
                .map_or(tx.nonce == tx_count, |pool| pool.joins_pending(tx.nonce));
            if !joins_pending {
                match gapped_tx {
                    Some((cheapest, _)) if tx.fee_cap <= cheapest.sorting_gas_price => {
                        return Err(MempoolError::Underpriced);
                    }
                    Some(_) => {}
                    None => return Err(MempoolError::NonceTooHigh(tx.nonce, tx_count)),
                }
            } else if pool_len >= self.config.capacity && gapped_tx.is_none() {
                if let Some((cheapest, _)) = self.pending_price_reversed_queue.peek() {
                    if tx.fee_cap <= cheapest.sorting_gas_price {
                        return Err(MempoolError::Underpriced);
                    }
                }
            }
        }

        if let Some(existing) = existing {
            self.remove_record(&existing, RemovalReason::Replaced { by: hash });
        }

        let record = QueueRecord {
            sender,
            tx_hash: hash,
            nonce: tx.nonce,
            sorting_gas_price: tx.fee_cap,
        };
        self.insert_seq += 1;
        self.records.insert(
            hash,
            AccountRecord {
                tx: Arc::clone(&tx),
                seq: self.insert_seq,
                seen_at: Instant::now(),
            },
        );
        self.registry.insert(hash, PoolKind::Account);

        let update = self
            .sender_pools
            .entry(sender)
            .or_insert_with(|| SenderPool::new(sender, tx_count))
            .add(record);
        self.apply_queues_update(update, RemovalReason::Stale);

        self.purge_over_capacity();
        debug!(%hash, "tx added to account pool");
        Ok(())
    }

    /// Re-validates every sender against the head state, drops what no
    /// longer applies and publishes the surviving pending run to the store
    /// of the new height.
    pub fn recheck(&mut self, cancel: &CancellationToken) {
        let head = self.chain.head();
        let store = self.store_sync.start_new_height(head.height);
        info!(height = head.height, senders = self.sender_pools.len(), "account pool recheck");

        let chain = Arc::clone(&self.chain);
        let mut overlay = StateOverlay::new(chain.reader());
        let mut senders: Vec<Address> = self.sender_pools.keys().copied().collect();
        senders.sort_unstable();

        'senders: for sender in senders {
            if cancel.is_cancelled() {
                break;
            }
            let Some(pool) = self.sender_pools.get_mut(&sender) else {
                continue;
            };
            let account = match overlay.account(&sender) {
                Ok(info) => info,
                Err(err) => {
                    warn!(%sender, ?err, "skipping sender, state read failed");
                    continue;
                }
            };

            let shift = pool.set_tx_count(account.nonce);
            self.apply_queues_update(shift, RemovalReason::Stale);

            // the pending run validates against the shared overlay so each
            // transaction sees its predecessors applied
            let pending = self
                .sender_pools
                .get(&sender)
                .map(SenderPool::pending_records)
                .unwrap_or_default();
            for record in pending {
                if cancel.is_cancelled() {
                    break 'senders;
                }
                let Some(meta) = self.records.get(&record.tx_hash) else {
                    continue;
                };
                let (tx, seq) = (Arc::clone(&meta.tx), meta.seq);
                if let Err(source) = self.validate_recheck(&mut overlay, &tx, head.gas_limit, false)
                {
                    self.remove_cascade(&sender, record.nonce, &source);
                    continue 'senders;
                }
                store.add(tx, seq);
            }

            // gapped transactions only probe a branched view and age out
            let gapped = self
                .sender_pools
                .get(&sender)
                .map(SenderPool::gapped_records)
                .unwrap_or_default();
            let mut branch = overlay.branch();
            let lifetime = self.config.queued_lifetime();
            for record in gapped {
                if cancel.is_cancelled() {
                    break 'senders;
                }
                let Some(meta) = self.records.get(&record.tx_hash) else {
                    continue;
                };
                if meta.seen_at.elapsed() > lifetime {
                    self.remove_record(&record, RemovalReason::Expired);
                    continue;
                }
                let tx = Arc::clone(&meta.tx);
                if let Err(source) = self.validate_recheck(&mut branch, &tx, head.gas_limit, true) {
                    self.remove_cascade(&sender, record.nonce, &source);
                    continue 'senders;
                }
            }
        }

        self.store_sync.end_current_height();
        debug!(
            pending = self.pending_count(),
            gapped = self.gapped_count(),
            published = store.len(),
            "account pool recheck done"
        );
    }

    /// Removes a transaction by hash. Cascading demotions of later nonces
    /// are applied, the reservation is released once the sender runs dry.
    pub fn remove_by_hash(&mut self, hash: &TxHash, reason: RemovalReason) -> Option<Arc<AccountTx>> {
        let meta = self.records.get(hash)?;
        let tx = Arc::clone(&meta.tx);
        let record = QueueRecord {
            sender: tx.sender,
            tx_hash: *hash,
            nonce: tx.nonce,
            sorting_gas_price: tx.fee_cap,
        };
        self.remove_record(&record, reason);
        Some(tx)
    }

    fn validate_insert(&self, tx: &Arc<AccountTx>) -> Result<(), MempoolError> {
        let head = self.chain.head();
        if tx.gas_limit > head.gas_limit {
            return Err(MempoolError::Rejected {
                hash: tx.hash,
                source: ValidationError::ExceedsBlockGas(tx.gas_limit, head.gas_limit),
            });
        }
        let mut overlay = StateOverlay::new(self.chain.reader());
        let account = overlay.account(&tx.sender)?;
        if account.balance < tx.cost() {
            return Err(MempoolError::Rejected {
                hash: tx.hash,
                source: ValidationError::InsufficientFunds,
            });
        }
        let pooled = PoolTx::Account(Arc::clone(tx));
        match self.validator.validate(&mut overlay, &pooled, true) {
            // a gap at admission is fine, the tx waits in the gapped bucket
            Ok(()) | Err(ValidationError::NonceGap { .. }) => Ok(()),
            Err(source) => Err(MempoolError::Rejected {
                hash: tx.hash,
                source,
            }),
        }
    }

    fn validate_recheck(
        &self,
        overlay: &mut StateOverlay<'_>,
        tx: &Arc<AccountTx>,
        block_gas: u64,
        queued: bool,
    ) -> Result<(), ValidationError> {
        if tx.gas_limit > block_gas {
            return Err(ValidationError::ExceedsBlockGas(tx.gas_limit, block_gas));
        }
        let account = overlay.account(&tx.sender)?;
        if tx.nonce < account.nonce {
            return Err(ValidationError::NonceTooLow {
                got: tx.nonce,
                expected: account.nonce,
            });
        }
        if !queued && tx.nonce > account.nonce {
            return Err(ValidationError::NonceGap {
                expected: account.nonce,
                got: tx.nonce,
            });
        }
        let cost = tx.cost();
        if account.balance < cost {
            return Err(ValidationError::InsufficientFunds);
        }

        let pooled = PoolTx::Account(Arc::clone(tx));
        let mut probe = overlay.branch();
        match self.validator.validate(&mut probe, &pooled, false) {
            Ok(()) => {}
            Err(ValidationError::NonceGap { .. }) if queued => {}
            Err(err) => return Err(err),
        }
        overlay.merge(probe);
        overlay.set_account(
            tx.sender,
            AccountInfo {
                nonce: tx.nonce + 1,
                balance: account.balance - cost,
            },
        );
        Ok(())
    }

    /// Removes the failed transaction and everything of the same sender
    /// above it, highest nonce first so the pending run never churns through
    /// intermediate demotions.
    fn remove_cascade(&mut self, sender: &Address, from: Nonce, error: &ValidationError) {
        let Some(pool) = self.sender_pools.get(sender) else {
            return;
        };
        let mut doomed: Vec<QueueRecord> = pool
            .nonce_map
            .values()
            .filter(|record| record.nonce >= from)
            .cloned()
            .collect();
        doomed.sort_unstable_by_key(|record| Reverse(record.nonce));
        debug!(%sender, from, count = doomed.len(), %error, "cascading removal");
        for record in doomed {
            let reason = if record.nonce == from {
                RemovalReason::Invalid(error.to_string())
            } else {
                RemovalReason::Cascade { after: from }
            };
            self.remove_record(&record, reason);
        }
    }

    fn apply_queues_update(&mut self, update: QueuesUpdate, removal: RemovalReason) {
        match update.add_update {
            Some(QueueUpdateAdd::Pending(record)) => {
                let price = record.sorting_gas_price;
                self.pending_price_reversed_queue
                    .push(record.clone(), Reverse(price));
                self.promote_to_store(&record);
            }
            Some(QueueUpdateAdd::Gapped(record)) => {
                let price = record.sorting_gas_price;
                self.gapped_price_reversed_queue
                    .push(record.clone(), Reverse(price));
                if let Some(meta) = self.records.get(&record.tx_hash) {
                    self.listener.enqueued(&PoolTx::Account(Arc::clone(&meta.tx)));
                }
            }
            None => {}
        }
        match update.move_update {
            Some(QueueUpdateMove::GappedToPending(records)) => {
                for record in records {
                    self.gapped_price_reversed_queue.remove(&record);
                    let price = record.sorting_gas_price;
                    self.pending_price_reversed_queue
                        .push(record.clone(), Reverse(price));
                    self.promote_to_store(&record);
                }
            }
            Some(QueueUpdateMove::PendingToGapped(records)) => {
                for record in records {
                    self.pending_price_reversed_queue.remove(&record);
                    let price = record.sorting_gas_price;
                    self.gapped_price_reversed_queue
                        .push(record.clone(), Reverse(price));
                    self.store()
                        .remove(&record.sender, record.nonce, &record.tx_hash);
                    if let Some(meta) = self.records.get(&record.tx_hash) {
                        self.listener.demoted(&PoolTx::Account(Arc::clone(&meta.tx)));
                    }
                }
            }
            None => {}
        }
        for record in update.remove_nonce_too_small {
            self.gapped_price_reversed_queue.remove(&record);
            self.pending_price_reversed_queue.remove(&record);
            self.store()
                .remove(&record.sender, record.nonce, &record.tx_hash);
            self.finish_removal(&record, removal.clone());
        }
    }

    fn promote_to_store(&self, record: &QueueRecord) {
        if let Some(meta) = self.records.get(&record.tx_hash) {
            self.store().add(Arc::clone(&meta.tx), meta.seq);
            self.listener.promoted(&PoolTx::Account(Arc::clone(&meta.tx)));
        }
    }

    fn remove_record(&mut self, record: &QueueRecord, reason: RemovalReason) {
        if let Some(outcome) = self
            .sender_pools
            .get_mut(&record.sender)
            .and_then(|pool| pool.remove(record))
        {
            match outcome.bucket {
                TxBucket::Pending => {
                    self.pending_price_reversed_queue.remove(record);
                    self.store()
                        .remove(&record.sender, record.nonce, &record.tx_hash);
                }
                TxBucket::Gapped => {
                    self.gapped_price_reversed_queue.remove(record);
                }
            }
            for demoted in outcome.demoted {
                self.pending_price_reversed_queue.remove(&demoted);
                let price = demoted.sorting_gas_price;
                self.gapped_price_reversed_queue
                    .push(demoted.clone(), Reverse(price));
                self.store()
                    .remove(&demoted.sender, demoted.nonce, &demoted.tx_hash);
                if let Some(meta) = self.records.get(&demoted.tx_hash) {
                    self.listener.demoted(&PoolTx::Account(Arc::clone(&meta.tx)));
                }
            }
        }
        self.finish_removal(record, reason);
    }

    fn finish_removal(&mut self, record: &QueueRecord, reason: RemovalReason) {
        self.registry.remove(&record.tx_hash);
        if let Some(meta) = self.records.remove(&record.tx_hash) {
            debug!(hash = %record.tx_hash, %reason, "tx removed from account pool");
            self.listener.removed(&PoolTx::Account(meta.tx), &reason);
        }
        self.release_if_unused(&record.sender);
    }

    fn release_if_unused(&mut self, sender: &Address) {
        if self
            .sender_pools
            .get(sender)
            .is_some_and(SenderPool::is_empty)
        {
            self.sender_pools.remove(sender);
        }
        if !self.sender_pools.contains_key(sender) {
            self.reserver.release(std::slice::from_ref(sender));
        }
    }

    fn purge_over_capacity(&mut self) {
        let len = self.len();
        if len <= self.config.capacity {
            return;
        }
        let mut excess = len - self.config.capacity;
        debug!(len, capacity = self.config.capacity, excess, "purging over capacity");
        while excess > 0 {
            let victim = self
                .gapped_price_reversed_queue
                .pop()
                .or_else(|| self.pending_price_reversed_queue.pop());
            let Some((record, _)) = victim else {
                break;
            };
            self.remove_record(&record, RemovalReason::Evicted);
            excess -= 1;
        }
    }

    fn store(&self) -> Arc<PendingStore> {
        self.store_sync.current()
    }
}

fn bumped(price: GasPrice, percent: u128) -> GasPrice {
    price.saturating_add(price.saturating_mul(percent) / 100)
}
