use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};

use common::{AccountTx, Address, GasPrice, Nonce, TxHash};

/// One snapshot entry: the transaction, its admission sequence and the tip
/// it pays at the snapshot's base fee.
#[derive(Debug, Clone)]
pub struct PendingCursorEntry {
    pub tx: Arc<AccountTx>,
    pub seq: u64,
    pub tip: GasPrice,
}

#[derive(Debug, Clone)]
struct StoreEntry {
    tx: Arc<AccountTx>,
    seq: u64,
}

#[derive(Debug, Default)]
struct Inner {
    by_sender: HashMap<Address, BTreeMap<Nonce, StoreEntry>>,
    count: usize,
}

/// Pending account transactions of one height, kept aside so merged
/// iteration never has to take the pool lock.
#[derive(Debug, Default)]
pub struct PendingStore {
    inner: RwLock<Inner>,
}

impl PendingStore {
    pub fn add(&self, tx: Arc<AccountTx>, seq: u64) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let Inner { by_sender, count } = &mut *inner;
        let entries = by_sender.entry(tx.sender).or_default();
        if entries.insert(tx.nonce, StoreEntry { tx, seq }).is_none() {
            *count += 1;
        }
    }

    /// Removes the exact transaction; a replacement that took over the nonce
    /// in the meantime stays.
    pub fn remove(&self, sender: &Address, nonce: Nonce, hash: &TxHash) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let Inner { by_sender, count } = &mut *inner;
        if let Some(entries) = by_sender.get_mut(sender) {
            if entries.get(&nonce).is_some_and(|e| e.tx.hash == *hash) {
                entries.remove(&nonce);
                *count -= 1;
                if entries.is_empty() {
                    by_sender.remove(sender);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .count
    }

    /// Per-sender queues for merged iteration: ascending nonces, cut at the
    /// first hole, at an entry tipping below `min_tip` or at one priced out
    /// by `base_fee` entirely.
    pub fn snapshot(
        &self,
        base_fee: Option<GasPrice>,
        min_tip: GasPrice,
    ) -> HashMap<Address, VecDeque<PendingCursorEntry>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut out = HashMap::with_capacity(inner.by_sender.len());
        for (sender, entries) in &inner.by_sender {
            let mut list = VecDeque::with_capacity(entries.len());
            let mut next = None;
            for (&nonce, entry) in entries {
                if next.is_some_and(|n| nonce != n) {
                    break;
                }
                let Some(tip) = entry.tx.effective_tip(base_fee) else {
                    break;
                };
                if tip < min_tip {
                    break;
                }
                list.push_back(PendingCursorEntry {
                    tx: Arc::clone(&entry.tx),
                    seq: entry.seq,
                    tip,
                });
                next = Some(nonce + 1);
            }
            if !list.is_empty() {
                out.insert(*sender, list);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use common::test_utils::{account_tx_arc, addr};
    use common::B256;

    use super::*;

    fn run_of(
        snapshot: &HashMap<Address, VecDeque<PendingCursorEntry>>,
        sender: Address,
    ) -> Vec<Nonce> {
        snapshot
            .get(&sender)
            .map(|run| run.iter().map(|entry| entry.tx.nonce).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_remove_only_with_matching_hash() {
        let store = PendingStore::default();
        let tx = account_tx_arc(addr(1), 0, 100, 10);
        store.add(Arc::clone(&tx), 1);
        assert_eq!(store.len(), 1);

        // a stranger's hash does not evict the occupant
        store.remove(&addr(1), 0, &B256::random());
        assert_eq!(store.len(), 1);

        store.remove(&addr(1), 0, &tx.hash);
        assert_eq!(store.len(), 0);
        assert!(store.snapshot(None, 0).is_empty());
    }

    #[test]
    fn test_replacement_keeps_count() {
        let store = PendingStore::default();
        store.add(account_tx_arc(addr(1), 0, 100, 10), 1);
        let replacement = account_tx_arc(addr(1), 0, 120, 12);
        store.add(Arc::clone(&replacement), 2);

        assert_eq!(store.len(), 1);
        let snapshot = store.snapshot(None, 0);
        assert_eq!(snapshot[&addr(1)].front().unwrap().tx.hash, replacement.hash);
    }

    #[test]
    fn test_snapshot_cuts_at_nonce_hole() {
        let store = PendingStore::default();
        store.add(account_tx_arc(addr(1), 0, 100, 10), 1);
        store.add(account_tx_arc(addr(1), 1, 100, 10), 2);
        store.add(account_tx_arc(addr(1), 3, 100, 10), 3);

        let snapshot = store.snapshot(None, 0);
        assert_eq!(run_of(&snapshot, addr(1)), vec![0, 1]);
    }

    #[test]
    fn test_snapshot_cuts_below_min_tip() {
        let store = PendingStore::default();
        store.add(account_tx_arc(addr(1), 0, 100, 10), 1);
        store.add(account_tx_arc(addr(1), 1, 100, 2), 2);
        // tips well enough again, but the run is already broken
        store.add(account_tx_arc(addr(1), 2, 100, 10), 3);

        let snapshot = store.snapshot(None, 5);
        assert_eq!(run_of(&snapshot, addr(1)), vec![0]);
    }

    #[test]
    fn test_snapshot_prices_out_low_fee_cap() {
        let store = PendingStore::default();
        store.add(account_tx_arc(addr(1), 0, 55, 30), 1);
        store.add(account_tx_arc(addr(1), 1, 40, 30), 2);
        store.add(account_tx_arc(addr(1), 2, 100, 30), 3);

        let snapshot = store.snapshot(Some(50), 0);
        assert_eq!(run_of(&snapshot, addr(1)), vec![0]);
        // the survivor tips what its fee cap leaves above the base fee
        assert_eq!(snapshot[&addr(1)].front().unwrap().tip, 5);
    }

    #[test]
    fn test_snapshot_omits_drained_senders() {
        let store = PendingStore::default();
        let lone = account_tx_arc(addr(2), 0, 100, 10);
        store.add(account_tx_arc(addr(1), 0, 100, 10), 1);
        store.add(Arc::clone(&lone), 2);
        store.remove(&addr(2), 0, &lone.hash);

        let snapshot = store.snapshot(None, 0);
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key(&addr(1)));
    }
}
