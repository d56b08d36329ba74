mod account_pool;
mod pending_store;
mod priority_pool;
mod sender_pool;

use std::fmt;

use common::{Address, GasPrice, Nonce, PoolTx, TxHash};

pub use account_pool::AccountPool;
pub use pending_store::{PendingCursorEntry, PendingStore};
pub use priority_pool::PriorityPool;
pub use sender_pool::SenderPool;

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct QueueRecord {
    pub sender: Address,
    pub tx_hash: TxHash,
    pub nonce: Nonce,
    pub sorting_gas_price: GasPrice,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum QueueUpdateAdd {
    Pending(QueueRecord),
    Gapped(QueueRecord),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum QueueUpdateMove {
    GappedToPending(Vec<QueueRecord>),
    PendingToGapped(Vec<QueueRecord>),
}

#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct QueuesUpdate {
    pub add_update: Option<QueueUpdateAdd>,
    pub move_update: Option<QueueUpdateMove>,
    pub remove_nonce_too_small: Vec<QueueRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxBucket {
    Pending,
    Gapped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveOutcome {
    pub bucket: TxBucket,
    /// Pending records above the removed nonce that lost their ladder and
    /// fell back to gapped.
    pub demoted: Vec<QueueRecord>,
}

/// Why a transaction left its pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovalReason {
    /// Nonce or sequence already consumed on chain.
    Stale,
    /// Displaced by a better paying transaction at the same nonce.
    Replaced { by: TxHash },
    /// Failed validation during recheck.
    Invalid(String),
    /// A lower nonce or sequence of the same account failed.
    Cascade { after: Nonce },
    /// Pushed out by capacity pressure.
    Evicted,
    /// Waited in the gapped bucket longer than the configured lifetime.
    Expired,
    /// Removed on request.
    Requested,
    /// Included in a block.
    Included,
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stale => f.write_str("stale"),
            Self::Replaced { by } => write!(f, "replaced by {by}"),
            Self::Invalid(msg) => write!(f, "invalid: {msg}"),
            Self::Cascade { after } => write!(f, "cascade after {after}"),
            Self::Evicted => f.write_str("evicted"),
            Self::Expired => f.write_str("expired"),
            Self::Requested => f.write_str("requested"),
            Self::Included => f.write_str("included"),
        }
    }
}

/// Pool event sink. The mempool wires these into the reap list and the
/// latency tracker; tests observe them directly.
pub trait PoolListener: Send + Sync + 'static {
    /// Became includable: entered pending or the fee lane.
    fn promoted(&self, _tx: &PoolTx) {}
    /// Entered the gapped bucket.
    fn enqueued(&self, _tx: &PoolTx) {}
    /// Fell back from pending to gapped.
    fn demoted(&self, _tx: &PoolTx) {}
    /// Left the pool.
    fn removed(&self, _tx: &PoolTx, _reason: &RemovalReason) {}
}

/// Listener that ignores everything.
pub struct NullListener;

impl PoolListener for NullListener {}
