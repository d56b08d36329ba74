use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use common::{AccountTx, Bytes, GasPrice, NativeTx, PoolTx, TxHash};

use crate::chain::{ChainView, HeadEvent, StateReader};
use crate::codec::TxCodec;
use crate::config::Config;
use crate::error::MempoolError;
use crate::heightsync::HeightSync;
use crate::iterator::{AccountCursor, MergeIterator, PriorityCursor};
use crate::pools::{AccountPool, PendingStore, PoolListener, PriorityPool, RemovalReason};
use crate::proposal::{BuildSource, Proposal, ProposalBuilder, ProposalSizer};
use crate::queue::AdmissionQueue;
use crate::reap_list::ReapList;
use crate::recheck::RecheckScheduler;
use crate::reserver::{PoolKind, SenderReserver};
use crate::tracker::{TrackerSnapshot, TxTracker};
use crate::validator::AnteValidator;

/// Dual-lane transaction pool. Submissions flow through a bounded admission
/// queue into the lane owning their shape; block arrivals fan out to both
/// lanes' recheck schedulers and the proposal builder; block building reads
/// merged snapshots without holding pool locks.
pub struct Mempool<S: StateReader, V: AnteValidator, C: TxCodec> {
    inner: Arc<Inner<S, V, C>>,
}

impl<S: StateReader, V: AnteValidator, C: TxCodec> Clone for Mempool<S, V, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<S: StateReader, V: AnteValidator, C: TxCodec> {
    config: Config,
    chain: Arc<ChainView<S>>,
    codec: Arc<C>,
    registry: Arc<DashMap<TxHash, PoolKind>>,
    account_pool: Arc<RwLock<AccountPool<S, V>>>,
    priority_pool: Arc<RwLock<PriorityPool<S, V>>>,
    store_sync: Arc<HeightSync<PendingStore>>,
    reap_list: Arc<ReapList<C>>,
    tracker: Arc<TxTracker>,
    account_queue: AdmissionQueue<Arc<AccountTx>>,
    priority_queue: AdmissionQueue<Arc<NativeTx>>,
    account_recheck: Arc<RecheckScheduler>,
    priority_recheck: Arc<RecheckScheduler>,
    builder: ProposalBuilder,
    head_tasks: CancellationToken,
    head_worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl<S: StateReader, V: AnteValidator, C: TxCodec> Mempool<S, V, C> {
    /// Wires both lanes with their queues, schedulers and the proposal
    /// builder, and spawns the background workers. Must run on a runtime.
    pub fn create_and_start(
        config: Config,
        reader: Arc<S>,
        validator: Arc<V>,
        codec: Arc<C>,
    ) -> Self {
        let chain = Arc::new(ChainView::new(reader));
        let head = chain.head();
        let registry: Arc<DashMap<TxHash, PoolKind>> = Arc::new(DashMap::new());
        let reserver = SenderReserver::new();
        let store_sync = Arc::new(HeightSync::new(head.height));
        let reap_list = Arc::new(ReapList::new(Arc::clone(&codec)));
        let tracker = Arc::new(TxTracker::new());
        let hooks: Arc<dyn PoolListener> = Arc::new(PoolHooks {
            reap_list: Arc::clone(&reap_list),
            tracker: Arc::clone(&tracker),
        });

        let account_pool = Arc::new(RwLock::new(AccountPool::new(
            config.account.clone(),
            Arc::clone(&chain),
            Arc::clone(&validator),
            reserver.handle(PoolKind::Account),
            Arc::clone(&hooks),
            Arc::clone(&registry),
            Arc::clone(&store_sync),
        )));
        let priority_pool = Arc::new(RwLock::new(PriorityPool::new(
            config.priority.clone(),
            Arc::clone(&chain),
            validator,
            reserver.handle(PoolKind::Priority),
            hooks,
            Arc::clone(&registry),
        )));

        let account_queue = {
            let pool = Arc::clone(&account_pool);
            let tracker = Arc::clone(&tracker);
            AdmissionQueue::start(&config.queue, move |txs: Vec<Arc<AccountTx>>| {
                let mut pool = pool.write().unwrap_or_else(PoisonError::into_inner);
                txs.into_iter()
                    .map(|tx| {
                        let hash = tx.hash;
                        let result = pool.insert(tx);
                        if let Err(err) = &result {
                            if !matches!(err, MempoolError::AlreadyKnown) {
                                tracker.forget(&hash);
                            }
                            debug!(%hash, %err, "account insert refused");
                        }
                        result
                    })
                    .collect()
            })
        };
        let priority_queue = {
            let pool = Arc::clone(&priority_pool);
            let tracker = Arc::clone(&tracker);
            AdmissionQueue::start(&config.queue, move |txs: Vec<Arc<NativeTx>>| {
                let mut pool = pool.write().unwrap_or_else(PoisonError::into_inner);
                txs.into_iter()
                    .map(|tx| {
                        let hash = tx.hash;
                        let result = pool.insert(tx);
                        if let Err(err) = &result {
                            if !matches!(err, MempoolError::AlreadyKnown) {
                                tracker.forget(&hash);
                            }
                            debug!(%hash, %err, "priority insert refused");
                        }
                        result
                    })
                    .collect()
            })
        };

        let account_recheck = {
            let pool = Arc::clone(&account_pool);
            Arc::new(RecheckScheduler::start("account", move |cancel| {
                pool.write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .recheck(cancel);
            }))
        };
        let priority_recheck = {
            let pool = Arc::clone(&priority_pool);
            Arc::new(RecheckScheduler::start("priority", move |cancel| {
                pool.write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .recheck(cancel);
            }))
        };

        let source = PoolBuildSource {
            chain: Arc::clone(&chain),
            store_sync: Arc::clone(&store_sync),
            priority_pool: Arc::clone(&priority_pool),
            codec: Arc::clone(&codec),
            max_bytes: config.proposal.max_bytes,
            min_tip: config.account.min_tip,
            snapshot_wait: config.proposal.snapshot_wait(),
        };
        let builder =
            ProposalBuilder::start(&config.proposal, chain.subscribe(), source, head.height);

        let head_tasks = CancellationToken::new();
        let head_worker = tokio::spawn(run_head_listener(
            chain.subscribe(),
            Arc::clone(&account_recheck),
            Arc::clone(&priority_recheck),
            head_tasks.clone(),
        ));

        info!(height = head.height, "mempool started");
        Self {
            inner: Arc::new(Inner {
                config,
                chain,
                codec,
                registry,
                account_pool,
                priority_pool,
                store_sync,
                reap_list,
                tracker,
                account_queue,
                priority_queue,
                account_recheck,
                priority_recheck,
                builder,
                head_tasks,
                head_worker: Mutex::new(Some(head_worker)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Routes the transaction to its lane and waits for the pool verdict.
    pub async fn insert(&self, tx: PoolTx) -> Result<(), MempoolError> {
        let hash = *tx.hash();
        let rx = self.submit(tx)?;
        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.note_refused(&hash, &err);
                Err(err)
            }
            Err(_) => Err(MempoolError::Closed),
        }
    }

    /// Fire-and-forget variant. Only failures knowable right away surface
    /// here (closed pool, full queue); the pool verdict lands later.
    pub fn insert_async(&self, tx: PoolTx) -> Result<(), MempoolError> {
        let hash = *tx.hash();
        let mut rx = self.submit(tx)?;
        match rx.try_recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.note_refused(&hash, &err);
                Err(err)
            }
            Err(oneshot::error::TryRecvError::Empty) => Ok(()),
            Err(oneshot::error::TryRecvError::Closed) => Err(MempoolError::Closed),
        }
    }

    /// Admits raw bytes of an account-lane transaction whose predecessor is
    /// still in flight elsewhere; it waits in the gapped bucket until the
    /// gap closes.
    pub fn insert_gapped(&self, raw: &[u8]) -> Result<(), MempoolError> {
        let tx = self.inner.codec.decode(raw)?;
        let PoolTx::Account(tx) = tx else {
            return Err(MempoolError::UnsupportedTxType);
        };
        self.insert_async(PoolTx::Account(tx))
    }

    fn submit(
        &self,
        tx: PoolTx,
    ) -> Result<oneshot::Receiver<Result<(), MempoolError>>, MempoolError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(MempoolError::Closed);
        }
        self.inner.tracker.track(*tx.hash());
        Ok(match tx {
            PoolTx::Account(tx) => self.inner.account_queue.push(tx),
            PoolTx::Native(tx) => self.inner.priority_queue.push(tx),
        })
    }

    fn note_refused(&self, hash: &TxHash, err: &MempoolError) {
        // an AlreadyKnown refusal still has the live record behind it
        if !matches!(err, MempoolError::AlreadyKnown) {
            self.inner.tracker.forget(hash);
        }
    }

    /// Explicit eviction. `error` is the failure the caller observed, if
    /// any; account-lane failures the pool resolves on its own (nonce gaps,
    /// stale sequences, out of gas) leave the transaction pooled.
    pub fn remove_with_reason(&self, hash: &TxHash, error: Option<&MempoolError>) -> Option<PoolTx> {
        let kind = self.inner.registry.get(hash).map(|entry| *entry.value())?;
        if kind == PoolKind::Account {
            if let Some(err) = error {
                if err.is_transient() {
                    debug!(%hash, %err, "keeping tx, the failure resolves itself");
                    return None;
                }
            }
        }
        let reason = match error {
            Some(err) => RemovalReason::Invalid(err.to_string()),
            None => RemovalReason::Requested,
        };
        self.remove_routed(hash, kind, reason)
    }

    pub fn remove(&self, hash: &TxHash) -> Option<PoolTx> {
        self.remove_with_reason(hash, None)
    }

    /// Removal on block finalize: records the inclusion latency on top.
    pub fn remove_included(&self, hash: &TxHash) -> Option<PoolTx> {
        let kind = self.inner.registry.get(hash).map(|entry| *entry.value())?;
        self.remove_routed(hash, kind, RemovalReason::Included)
    }

    fn remove_routed(&self, hash: &TxHash, kind: PoolKind, reason: RemovalReason) -> Option<PoolTx> {
        match kind {
            PoolKind::Account => self
                .inner
                .account_pool
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove_by_hash(hash, reason)
                .map(PoolTx::Account),
            PoolKind::Priority => self
                .inner
                .priority_pool
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove_by_hash(hash, reason)
                .map(PoolTx::Native),
        }
    }

    /// Merged snapshot iterator over both lanes, account transactions taken
    /// from the pending store of the current height. Waits briefly for an
    /// in-progress recheck to publish that store.
    pub async fn select(&self) -> MergeIterator<C> {
        merged_snapshot(
            &self.inner.chain,
            &self.inner.store_sync,
            &self.inner.priority_pool,
            &self.inner.codec,
            self.inner.config.account.min_tip,
            self.inner.config.proposal.snapshot_wait(),
        )
        .await
    }

    /// Walks the merged iterator while `keep_going` returns true.
    pub async fn select_by<F>(&self, mut keep_going: F)
    where
        F: FnMut(&PoolTx) -> bool,
    {
        let mut iter = self.select().await;
        while let Some(tx) = iter.peek() {
            if !keep_going(tx) {
                break;
            }
            iter.next();
        }
    }

    /// Transactions that became includable since the last call, encoded in
    /// that order, within the byte and gas budgets. Zero disables a budget.
    pub fn reap_new_valid_txs(&self, max_bytes: u64, max_gas: u64) -> Vec<Bytes> {
        self.inner.reap_list.reap(max_bytes, max_gas)
    }

    /// Includable transactions across both lanes: the account lane's pending
    /// bucket plus everything in the fee lane.
    pub fn count_tx(&self) -> usize {
        let pending = self
            .inner
            .account_pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .pending_count();
        let priority = self
            .inner
            .priority_pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        pending + priority
    }

    pub fn contains(&self, hash: &TxHash) -> bool {
        self.inner.registry.contains_key(hash)
    }

    pub fn get(&self, hash: &TxHash) -> Option<PoolTx> {
        let kind = self.inner.registry.get(hash).map(|entry| *entry.value())?;
        match kind {
            PoolKind::Account => self
                .inner
                .account_pool
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(hash)
                .map(PoolTx::Account),
            PoolKind::Priority => self
                .inner
                .priority_pool
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(hash)
                .map(PoolTx::Native),
        }
    }

    /// Refreshes the cached head from the state reader and fans the event
    /// out to the recheck schedulers and the proposal builder.
    pub fn notify_new_block(&self) {
        self.inner.chain.notify_new_block();
    }

    /// Forwards an external block-committed feed into
    /// [`Mempool::notify_new_block`]. Stops with the pool or when the feed
    /// closes.
    pub fn attach_head_feed(&self, mut feed: broadcast::Receiver<HeadEvent>) {
        let chain = Arc::clone(&self.inner.chain);
        let shutdown = self.inner.head_tasks.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = feed.recv() => match event {
                        Ok(_) => chain.notify_new_block(),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "head feed lagged, refreshing anyway");
                            chain.notify_new_block();
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                    _ = shutdown.cancelled() => return,
                }
            }
        });
    }

    /// Schedules a recheck of both lanes and waits for the runs to finish.
    pub async fn trigger_recheck(&self) {
        join(
            self.inner.account_recheck.trigger_and_wait(),
            self.inner.priority_recheck.trigger_and_wait(),
        )
        .await;
    }

    /// Best proposal built for the upcoming height so far.
    pub fn latest_proposal(&self) -> Proposal {
        self.inner.builder.latest_proposal()
    }

    pub fn queue_depths(&self) -> (usize, usize) {
        (
            self.inner.account_queue.len(),
            self.inner.priority_queue.len(),
        )
    }

    pub fn tracker_snapshot(&self) -> TrackerSnapshot {
        self.inner.tracker.snapshot()
    }

    /// Graceful shutdown: refuse new submissions, drain the queues, wait
    /// out in-flight rechecks, then stop the builder and head listeners.
    /// Idempotent; later calls return right away.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down mempool");
        join(
            self.inner.account_queue.close(),
            self.inner.priority_queue.close(),
        )
        .await;
        join(
            self.inner.account_recheck.close(),
            self.inner.priority_recheck.close(),
        )
        .await;
        self.inner.builder.close().await;
        self.inner.head_tasks.cancel();
        let head_worker = self
            .inner
            .head_worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = head_worker {
            if let Err(err) = worker.await {
                error!(?err, "head listener failed");
            }
        }
        if !self.inner.reap_list.is_empty() {
            debug!(unreaped = self.inner.reap_list.len(), "closing with unreaped txs");
        }
        info!("mempool shut down");
    }
}

/// Pool event fan-out: promotions feed the reap list, every transition
/// stamps the latency tracker.
struct PoolHooks<C> {
    reap_list: Arc<ReapList<C>>,
    tracker: Arc<TxTracker>,
}

impl<C: TxCodec> PoolListener for PoolHooks<C> {
    fn promoted(&self, tx: &PoolTx) {
        self.reap_list.push(tx);
        self.tracker.entered_pending(tx.hash());
    }

    fn enqueued(&self, tx: &PoolTx) {
        self.tracker.entered_queued(tx.hash());
    }

    fn demoted(&self, tx: &PoolTx) {
        self.tracker.entered_queued(tx.hash());
    }

    fn removed(&self, tx: &PoolTx, reason: &RemovalReason) {
        self.reap_list.drop_tx(tx.hash());
        self.tracker.removed(tx.hash(), reason);
    }
}

/// Selection backend handed to the proposal builder. Holds its own handles
/// so builds keep working while the facade is busy elsewhere.
struct PoolBuildSource<S: StateReader, V: AnteValidator, C: TxCodec> {
    chain: Arc<ChainView<S>>,
    store_sync: Arc<HeightSync<PendingStore>>,
    priority_pool: Arc<RwLock<PriorityPool<S, V>>>,
    codec: Arc<C>,
    max_bytes: u64,
    min_tip: GasPrice,
    snapshot_wait: Duration,
}

impl<S: StateReader, V: AnteValidator, C: TxCodec> Clone for PoolBuildSource<S, V, C> {
    fn clone(&self) -> Self {
        Self {
            chain: Arc::clone(&self.chain),
            store_sync: Arc::clone(&self.store_sync),
            priority_pool: Arc::clone(&self.priority_pool),
            codec: Arc::clone(&self.codec),
            max_bytes: self.max_bytes,
            min_tip: self.min_tip,
            snapshot_wait: self.snapshot_wait,
        }
    }
}

impl<S: StateReader, V: AnteValidator, C: TxCodec> BuildSource for PoolBuildSource<S, V, C> {
    async fn build(&self, height: u64) -> Option<Proposal> {
        let head = self.chain.head();
        let mut iter = merged_snapshot(
            &self.chain,
            &self.store_sync,
            &self.priority_pool,
            &self.codec,
            self.min_tip,
            self.snapshot_wait,
        )
        .await;

        let mut sizer = ProposalSizer::new(self.max_bytes, head.gas_limit);
        while let Some(tx) = iter.peek() {
            let gas = tx.gas_limit();
            let raw = match self.codec.encode(tx) {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(hash = %tx.hash(), %err, "skipping unencodable tx");
                    iter.next();
                    continue;
                }
            };
            iter.next();
            if sizer.offer(raw, gas) {
                break;
            }
        }
        debug!(height, txs = sizer.len(), left = iter.remaining(), "assembled proposal");
        Some(sizer.into_proposal(height))
    }
}

async fn merged_snapshot<S, V, C>(
    chain: &ChainView<S>,
    store_sync: &HeightSync<PendingStore>,
    priority_pool: &RwLock<PriorityPool<S, V>>,
    codec: &Arc<C>,
    min_tip: GasPrice,
    wait: Duration,
) -> MergeIterator<C>
where
    S: StateReader,
    V: AnteValidator,
    C: TxCodec,
{
    let head = chain.head();
    let account = match store_sync.store_at(head.height, wait).await {
        Some(store) => AccountCursor::new(store.snapshot(head.base_fee, min_tip)),
        None => {
            warn!(
                height = head.height,
                store = store_sync.height(),
                "pending snapshot unavailable, iterating the fee lane only"
            );
            AccountCursor::default()
        }
    };
    let ranked = priority_pool
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .ranked_txs();
    let priority = PriorityCursor::new(ranked, head.base_fee);
    MergeIterator::new(account, priority, Arc::clone(codec))
}

async fn run_head_listener(
    mut head_rx: broadcast::Receiver<HeadEvent>,
    account: Arc<RecheckScheduler>,
    priority: Arc<RecheckScheduler>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            event = head_rx.recv() => match event {
                Ok(head) => {
                    debug!(height = head.height, "scheduling rechecks");
                    account.trigger();
                    priority.trigger();
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "head listener lagged, catching up");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            _ = shutdown.cancelled() => return,
        }
    }
}
