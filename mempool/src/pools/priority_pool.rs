use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use priority_queue::DoublePriorityQueue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use common::{Address, GasPrice, NativeTx, Nonce, PoolTx, TxHash, U256};

use crate::chain::{ChainView, StateOverlay, StateReader};
use crate::config::PriorityPoolConfig;
use crate::error::{MempoolError, ValidationError};
use crate::pools::{PoolListener, RemovalReason};
use crate::reserver::{PoolKind, ReservationHandle};
use crate::validator::AnteValidator;

/// Iteration rank of a fee-lane transaction: gas price first, then admission
/// order among equal payers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PriorityRank {
    pub gas_price: GasPrice,
    pub seq: Reverse<u64>,
}

#[derive(Debug, Clone)]
struct PriorityRecord {
    tx: Arc<NativeTx>,
}

/// Fee-priority lane. No per-account ordering: transactions rank purely by
/// normalized gas price and are handed out best paying first. Sequence
/// mistakes only surface during recheck.
pub struct PriorityPool<S, V> {
    config: PriorityPoolConfig,
    chain: Arc<ChainView<S>>,
    validator: Arc<V>,
    reserver: ReservationHandle,
    listener: Arc<dyn PoolListener>,
    /// Hash to owning-lane registry shared with the account lane.
    registry: Arc<DashMap<TxHash, PoolKind>>,
    records: HashMap<TxHash, PriorityRecord>,
    ranked: DoublePriorityQueue<TxHash, PriorityRank>,
    /// Live transactions per signer; the reservation is released once a
    /// signer's count drops to zero.
    signer_refs: HashMap<Address, usize>,
    insert_seq: u64,
}

impl<S: StateReader, V: AnteValidator> PriorityPool<S, V> {
    pub fn new(
        config: PriorityPoolConfig,
        chain: Arc<ChainView<S>>,
        validator: Arc<V>,
        reserver: ReservationHandle,
        listener: Arc<dyn PoolListener>,
        registry: Arc<DashMap<TxHash, PoolKind>>,
    ) -> Self {
        Self {
            config,
            chain,
            validator,
            reserver,
            listener,
            registry,
            records: HashMap::new(),
            ranked: DoublePriorityQueue::new(),
            signer_refs: HashMap::new(),
            insert_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn get(&self, hash: &TxHash) -> Option<Arc<NativeTx>> {
        self.records.get(hash).map(|record| Arc::clone(&record.tx))
    }

    pub fn insert(&mut self, tx: Arc<NativeTx>) -> Result<(), MempoolError> {
        let hash = tx.hash;
        debug!(%hash, signers = tx.signers.len(), "adding tx to priority pool");

        if self.registry.contains_key(&hash) {
            return Err(MempoolError::AlreadyKnown);
        }
        if tx.signers.is_empty() {
            return Err(MempoolError::UnknownSender);
        }
        if tx.gas_price() < self.config.min_gas_price {
            return Err(MempoolError::Underpriced);
        }

        let signers: Vec<Address> = tx.signers.iter().map(|signer| signer.address).collect();
        self.reserver.hold(&signers)?;
        let result = self.insert_held(tx);
        if result.is_err() {
            for signer in &signers {
                self.release_if_unused(signer);
            }
        }
        result
    }

    fn insert_held(&mut self, tx: Arc<NativeTx>) -> Result<(), MempoolError> {
        let hash = tx.hash;
        let gas_price = tx.gas_price();

        // a full pool only admits transactions outbidding the cheapest one
        if self.config.capacity > 0 && self.records.len() >= self.config.capacity {
            if let Some((_, cheapest)) = self.ranked.peek_min() {
                if gas_price <= cheapest.gas_price {
                    return Err(MempoolError::Underpriced);
                }
            }
        }

        let mut overlay = StateOverlay::new(self.chain.reader());
        if let Err(source) = self.validate(&mut overlay, &tx, true) {
            return Err(MempoolError::Rejected { hash, source });
        }

        self.insert_seq += 1;
        let rank = PriorityRank {
            gas_price,
            seq: Reverse(self.insert_seq),
        };
        for signer in &tx.signers {
            *self.signer_refs.entry(signer.address).or_default() += 1;
        }
        self.records.insert(hash, PriorityRecord { tx: Arc::clone(&tx) });
        self.registry.insert(hash, PoolKind::Priority);
        self.ranked.push(hash, rank);
        self.listener.promoted(&PoolTx::Native(tx));

        self.purge_over_capacity();
        debug!(%hash, gas_price, "tx added to priority pool");
        Ok(())
    }

    /// Re-validates the pool in descending rank order against the head
    /// state. A failure at sequence f also drops every later transaction
    /// whose signer signed at f or above; removals apply as the walk goes,
    /// so a cancelled run leaves them in place.
    pub fn recheck(&mut self, cancel: &CancellationToken) {
        info!(len = self.records.len(), "priority pool recheck");
        let mut order = self.ranked.clone();
        let chain = Arc::clone(&self.chain);
        let mut overlay = StateOverlay::new(chain.reader());
        // lowest failing sequence seen per signer
        let mut failed_at: HashMap<Address, Nonce> = HashMap::new();

        while let Some((hash, _)) = order.pop_max() {
            if cancel.is_cancelled() {
                debug!("priority pool recheck cancelled");
                break;
            }
            let Some(record) = self.records.get(&hash) else {
                continue;
            };
            let tx = Arc::clone(&record.tx);

            let cascade = tx.signers.iter().find_map(|signer| {
                failed_at
                    .get(&signer.address)
                    .copied()
                    .filter(|&at| signer.sequence >= at)
            });
            if let Some(after) = cascade {
                self.remove_by_hash(&hash, RemovalReason::Cascade { after });
                continue;
            }

            if let Err(source) = self.validate(&mut overlay, &tx, false) {
                debug!(%hash, %source, "tx failed recheck");
                for signer in &tx.signers {
                    let at = failed_at.entry(signer.address).or_insert(signer.sequence);
                    *at = (*at).min(signer.sequence);
                }
                self.remove_by_hash(&hash, RemovalReason::Invalid(source.to_string()));
            }
        }
        debug!(len = self.records.len(), "priority pool recheck done");
    }

    /// Removes a transaction by hash and releases signers that ran dry.
    pub fn remove_by_hash(&mut self, hash: &TxHash, reason: RemovalReason) -> Option<Arc<NativeTx>> {
        let record = self.records.remove(hash)?;
        self.ranked.remove(hash);
        self.registry.remove(hash);
        debug!(%hash, %reason, "tx removed from priority pool");
        for signer in &record.tx.signers {
            self.drop_signer_ref(&signer.address);
        }
        self.listener
            .removed(&PoolTx::Native(Arc::clone(&record.tx)), &reason);
        Some(record.tx)
    }

    /// Live transactions in iteration order, best paying first.
    pub fn ranked_txs(&self) -> Vec<Arc<NativeTx>> {
        let mut order = self.ranked.clone();
        let mut out = Vec::with_capacity(order.len());
        while let Some((hash, _)) = order.pop_max() {
            if let Some(record) = self.records.get(&hash) {
                out.push(Arc::clone(&record.tx));
            }
        }
        out
    }

    /// Structural checks plus the ante hook, probed on a branch so a failing
    /// transaction leaves `overlay` untouched. On success the consumed
    /// sequences and the paid fee are written forward.
    fn validate(
        &self,
        overlay: &mut StateOverlay<'_>,
        tx: &Arc<NativeTx>,
        simulate: bool,
    ) -> Result<(), ValidationError> {
        let block_gas = self.chain.head().gas_limit;
        if tx.gas_limit > block_gas {
            return Err(ValidationError::ExceedsBlockGas(tx.gas_limit, block_gas));
        }

        let mut probe = overlay.branch();
        let fee = U256::from(tx.fee);
        let mut paid = false;
        for signer in &tx.signers {
            let mut account = probe.account(&signer.address)?;
            if signer.sequence < account.nonce {
                return Err(ValidationError::SequenceMismatch {
                    got: signer.sequence,
                    expected: account.nonce,
                });
            }
            // the first signer pays the flat fee
            if !paid {
                if account.balance < fee {
                    return Err(ValidationError::InsufficientFunds);
                }
                account.balance -= fee;
                paid = true;
            }
            account.nonce = signer.sequence + 1;
            probe.set_account(signer.address, account);
        }

        let pooled = PoolTx::Native(Arc::clone(tx));
        self.validator.validate(&mut probe, &pooled, simulate)?;
        overlay.merge(probe);
        Ok(())
    }

    fn drop_signer_ref(&mut self, signer: &Address) {
        if let Some(count) = self.signer_refs.get_mut(signer) {
            *count -= 1;
            if *count == 0 {
                self.signer_refs.remove(signer);
                self.reserver.release(std::slice::from_ref(signer));
            }
        }
    }

    fn release_if_unused(&mut self, signer: &Address) {
        if !self.signer_refs.contains_key(signer) {
            self.reserver.release(std::slice::from_ref(signer));
        }
    }

    fn purge_over_capacity(&mut self) {
        if self.config.capacity == 0 {
            return;
        }
        while self.records.len() > self.config.capacity {
            let Some((hash, _)) = self.ranked.peek_min() else {
                break;
            };
            let hash = *hash;
            self.remove_by_hash(&hash, RemovalReason::Evicted);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use common::test_utils::{addr, native_tx_arc, native_tx_multi};

    use super::*;
    use crate::chain::AccountInfo;
    use crate::pools::NullListener;
    use crate::reserver::SenderReserver;
    use crate::validator::NoValidation;

    struct MockReader {
        accounts: Mutex<HashMap<Address, AccountInfo>>,
    }

    impl MockReader {
        fn new() -> Self {
            Self {
                accounts: Mutex::new(HashMap::new()),
            }
        }

        fn fund(&self, address: Address, nonce: u64) {
            self.accounts.lock().unwrap().insert(
                address,
                AccountInfo {
                    nonce,
                    balance: U256::MAX,
                },
            );
        }
    }

    impl StateReader for MockReader {
        fn account(&self, address: &Address) -> anyhow::Result<AccountInfo> {
            Ok(self
                .accounts
                .lock()
                .unwrap()
                .get(address)
                .copied()
                .unwrap_or_default())
        }

        fn base_fee(&self) -> Option<GasPrice> {
            None
        }

        fn block_gas_limit(&self) -> u64 {
            30_000_000
        }

        fn height(&self) -> u64 {
            1
        }
    }

    fn create_priority_pool(
        capacity: usize,
        min_gas_price: GasPrice,
    ) -> (PriorityPool<MockReader, NoValidation>, Arc<MockReader>) {
        let config = PriorityPoolConfig {
            capacity,
            min_gas_price,
        };
        let reader = Arc::new(MockReader::new());
        reader.fund(addr(1), 0);
        reader.fund(addr(2), 0);
        reader.fund(addr(3), 0);
        let chain = Arc::new(ChainView::new(Arc::clone(&reader)));
        let reserver = SenderReserver::new();
        let pool = PriorityPool::new(
            config,
            chain,
            Arc::new(NoValidation),
            reserver.handle(PoolKind::Priority),
            Arc::new(NullListener),
            Arc::new(DashMap::new()),
        );
        (pool, reader)
    }

    #[tokio::test]
    async fn test_insert_already_known() {
        let (mut pool, _) = create_priority_pool(10, 0);
        let tx = native_tx_arc(addr(1), 0, 42_000, 21_000);
        assert!(pool.insert(Arc::clone(&tx)).is_ok());
        assert!(matches!(pool.insert(tx), Err(MempoolError::AlreadyKnown)));
    }

    #[tokio::test]
    async fn test_insert_below_min_gas_price() {
        let (mut pool, _) = create_priority_pool(10, 3);
        let result = pool.insert(native_tx_arc(addr(1), 0, 42_000, 21_000));
        assert!(matches!(result, Err(MempoolError::Underpriced)));
        assert_eq!(pool.len(), 0);
    }

    #[tokio::test]
    async fn test_insert_stale_sequence() {
        let (mut pool, reader) = create_priority_pool(10, 0);
        reader.fund(addr(1), 5);
        let result = pool.insert(native_tx_arc(addr(1), 3, 42_000, 21_000));
        assert!(matches!(
            result,
            Err(MempoolError::Rejected {
                source: ValidationError::SequenceMismatch { got: 3, expected: 5 },
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_capacity_evicts_cheapest() {
        let (mut pool, _) = create_priority_pool(2, 0);
        let cheap = native_tx_arc(addr(1), 0, 21_000, 21_000);
        pool.insert(Arc::clone(&cheap)).unwrap();
        pool.insert(native_tx_arc(addr(2), 0, 63_000, 21_000)).unwrap();

        // does not outbid the cheapest occupant
        let refused = pool.insert(native_tx_arc(addr(3), 0, 21_000, 21_000));
        assert!(matches!(refused, Err(MempoolError::Underpriced)));

        pool.insert(native_tx_arc(addr(3), 0, 42_000, 21_000)).unwrap();
        assert_eq!(pool.len(), 2);
        assert!(pool.get(&cheap.hash).is_none());
    }

    #[tokio::test]
    async fn test_ranked_order() {
        let (mut pool, _) = create_priority_pool(10, 0);
        let low = native_tx_arc(addr(1), 0, 21_000, 21_000);
        let high = native_tx_arc(addr(2), 0, 63_000, 21_000);
        let mid = native_tx_arc(addr(3), 0, 42_000, 21_000);
        pool.insert(Arc::clone(&low)).unwrap();
        pool.insert(Arc::clone(&high)).unwrap();
        pool.insert(Arc::clone(&mid)).unwrap();

        let hashes: Vec<_> = pool.ranked_txs().iter().map(|tx| tx.hash).collect();
        assert_eq!(hashes, vec![high.hash, mid.hash, low.hash]);
    }

    #[tokio::test]
    async fn test_recheck_cascades_failed_sequence() {
        let (mut pool, reader) = create_priority_pool(10, 0);
        let first = native_tx_arc(addr(1), 0, 63_000, 21_000);
        let second = native_tx_arc(addr(1), 1, 21_000, 21_000);
        let untouched = native_tx_arc(addr(2), 0, 42_000, 21_000);
        pool.insert(Arc::clone(&first)).unwrap();
        pool.insert(Arc::clone(&second)).unwrap();
        pool.insert(Arc::clone(&untouched)).unwrap();

        // sequence 0 was consumed on chain; its failure takes sequence 1
        // down with it
        reader.fund(addr(1), 1);
        pool.recheck(&CancellationToken::new());

        assert!(pool.get(&first.hash).is_none());
        assert!(pool.get(&second.hash).is_none());
        assert!(pool.get(&untouched.hash).is_some());
    }

    #[tokio::test]
    async fn test_recheck_cancelled_immediately_removes_nothing() {
        let (mut pool, reader) = create_priority_pool(10, 0);
        pool.insert(native_tx_arc(addr(1), 0, 42_000, 21_000)).unwrap();
        reader.fund(addr(1), 5);

        let cancel = CancellationToken::new();
        cancel.cancel();
        pool.recheck(&cancel);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_releases_signers() {
        let config = PriorityPoolConfig::default();
        let reader = Arc::new(MockReader::new());
        reader.fund(addr(1), 0);
        reader.fund(addr(2), 0);
        let chain = Arc::new(ChainView::new(Arc::clone(&reader)));
        let reserver = SenderReserver::new();
        let mut pool = PriorityPool::new(
            config,
            chain,
            Arc::new(NoValidation),
            reserver.handle(PoolKind::Priority),
            Arc::new(NullListener),
            Arc::new(DashMap::new()),
        );

        let shared = native_tx_multi(&[(addr(1), 0), (addr(2), 0)], 42_000, 21_000);
        let solo = native_tx_arc(addr(1), 1, 42_000, 21_000);
        pool.insert(Arc::clone(&shared)).unwrap();
        pool.insert(Arc::clone(&solo)).unwrap();
        assert_eq!(reserver.len(), 2);
        assert_eq!(reserver.owner(&addr(1)), Some(PoolKind::Priority));
        assert_eq!(reserver.owner(&addr(2)), Some(PoolKind::Priority));

        pool.remove_by_hash(&shared.hash, RemovalReason::Requested);
        // addr(1) still has the solo transaction
        assert_eq!(reserver.owner(&addr(1)), Some(PoolKind::Priority));
        assert_eq!(reserver.owner(&addr(2)), None);

        pool.remove_by_hash(&solo.hash, RemovalReason::Requested);
        assert_eq!(reserver.owner(&addr(1)), None);
        assert!(reserver.is_empty());
    }
}
