use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, warn};

use common::{Bytes, PoolTx, TxHash};

use crate::codec::TxCodec;

#[derive(Default)]
struct Inner {
    entries: Vec<Option<PoolTx>>,
    /// `Some` points into `entries`. `None` marks a hash already handed out
    /// so a later re-push cannot deliver it twice.
    index: HashMap<TxHash, Option<usize>>,
    /// Bumped on every removal or reap so an in-flight reap can tell whether
    /// its read-phase scan is still valid.
    generation: u64,
    live: usize,
}

/// Append-only list of transactions that became includable since the last
/// harvest. Each transaction is handed out at most once, in the order it
/// became includable across both lanes.
pub struct ReapList<C> {
    codec: Arc<C>,
    inner: RwLock<Inner>,
}

struct Scan {
    take: Vec<usize>,
    failed: Vec<usize>,
    /// Index of the first entry left in place.
    boundary: usize,
    payload: Vec<Bytes>,
}

impl<C: TxCodec> ReapList<C> {
    pub fn new(codec: Arc<C>) -> Self {
        Self {
            codec,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Appends a transaction that just became includable. A hash that is
    /// still listed or was already handed out is ignored.
    pub fn push(&self, tx: &PoolTx) {
        let mut inner = self.write();
        if inner.index.contains_key(tx.hash()) {
            return;
        }
        let idx = inner.entries.len();
        inner.entries.push(Some(tx.clone()));
        inner.index.insert(*tx.hash(), Some(idx));
        inner.live += 1;
    }

    /// Forgets a transaction that left its pool. Also clears a standing
    /// handed-out guard so the hash may be listed again later.
    pub fn drop_tx(&self, hash: &TxHash) {
        let mut inner = self.write();
        if let Some(Some(idx)) = inner.index.remove(hash) {
            inner.entries[idx] = None;
            inner.generation += 1;
            inner.live -= 1;
        }
    }

    pub fn len(&self) -> usize {
        self.read().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Harvests listed transactions in order until either budget would be
    /// exceeded, stopping before the transaction that does not fit. A zero
    /// budget means unlimited. Transactions that fail to encode are dropped
    /// from the list and never retried.
    pub fn reap(&self, max_bytes: u64, max_gas: u64) -> Vec<Bytes> {
        // Encoding runs under the read lock first so concurrent pushes and
        // lookups keep flowing; the scan is redone under the write lock only
        // if the list changed in between.
        let (scan, generation) = {
            let inner = self.read();
            (self.scan(&inner, max_bytes, max_gas), inner.generation)
        };

        let mut inner = self.write();
        let scan = if inner.generation == generation {
            scan
        } else {
            self.scan(&inner, max_bytes, max_gas)
        };
        Self::apply(&mut inner, &scan);
        debug!(txs = scan.take.len(), left = inner.live, "reaped");
        scan.payload
    }

    fn scan(&self, inner: &Inner, max_bytes: u64, max_gas: u64) -> Scan {
        let mut scan = Scan {
            take: Vec::new(),
            failed: Vec::new(),
            boundary: inner.entries.len(),
            payload: Vec::new(),
        };
        let mut total_bytes = 0u64;
        let mut total_gas = 0u64;

        for (idx, slot) in inner.entries.iter().enumerate() {
            let Some(tx) = slot else { continue };
            let raw = match self.codec.encode(tx) {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(hash = %tx.hash(), %err, "dropping unencodable tx");
                    scan.failed.push(idx);
                    continue;
                }
            };
            let size = raw.len() as u64;
            let gas = tx.gas_limit();
            if max_bytes > 0 && total_bytes + size > max_bytes {
                scan.boundary = idx;
                return scan;
            }
            if max_gas > 0 && total_gas + gas > max_gas {
                scan.boundary = idx;
                return scan;
            }
            total_bytes += size;
            total_gas += gas;
            scan.take.push(idx);
            scan.payload.push(raw);
        }
        scan
    }

    fn apply(inner: &mut Inner, scan: &Scan) {
        let Inner {
            entries,
            index,
            generation,
            live,
        } = inner;

        for &idx in scan.failed.iter().chain(scan.take.iter()) {
            if let Some(tx) = entries[idx].take() {
                index.insert(*tx.hash(), None);
                *live -= 1;
            }
        }

        let tail = entries.split_off(scan.boundary);
        *entries = tail;
        for (pos, slot) in entries.iter().enumerate() {
            if let Some(tx) = slot {
                index.insert(*tx.hash(), Some(pos));
            }
        }
        *generation += 1;
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
