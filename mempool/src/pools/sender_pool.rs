use std::collections::HashMap;

use priority_queue::DoublePriorityQueue;

use common::{Address, Nonce};

use crate::pools::{
    QueueRecord, QueueUpdateAdd, QueueUpdateMove, QueuesUpdate, RemoveOutcome, TxBucket,
};

/// Per-sender nonce bookkeeping for the account pool.
#[derive(Debug)]
pub struct SenderPool {
    /// Owning sender. (useful for debug/logging)
    #[allow(dead_code)]
    pub sender: Address,
    /// Contiguous run of nonces starting at `tx_count`.
    pub pending_nonce_queue: DoublePriorityQueue<QueueRecord, Nonce>,
    /// Everything beyond the first hole.
    pub gapped_nonce_queue: DoublePriorityQueue<QueueRecord, Nonce>,
    /// All records of this sender keyed by nonce.
    pub nonce_map: HashMap<Nonce, QueueRecord>,
    /// Chain-observed account nonce.
    pub tx_count: u64,
}

impl SenderPool {
    pub fn new(sender: Address, tx_count: u64) -> Self {
        Self {
            sender,
            pending_nonce_queue: DoublePriorityQueue::new(),
            gapped_nonce_queue: DoublePriorityQueue::new(),
            nonce_map: HashMap::new(),
            tx_count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nonce_map.is_empty()
    }

    pub fn get_by_nonce(&self, nonce: Nonce) -> Option<&QueueRecord> {
        self.nonce_map.get(&nonce)
    }

    /// Whether a record at `nonce` would extend the pending run.
    pub fn joins_pending(&self, nonce: Nonce) -> bool {
        match self.pending_nonce_queue.peek_max() {
            Some((_, &max_nonce)) => max_nonce + 1 == nonce,
            None => nonce == self.tx_count,
        }
    }

    // here we assume that we're adding records with nonce >= tx_count and
    // that the nonce slot is free; replacement is handled a level up
    pub fn add(&mut self, record: QueueRecord) -> QueuesUpdate {
        let mut result = QueuesUpdate::default();
        let nonce = record.nonce;
        self.nonce_map.insert(nonce, record.clone());

        if self.joins_pending(nonce) {
            self.pending_nonce_queue.push(record.clone(), nonce);
            result.add_update = Some(QueueUpdateAdd::Pending(record));
            let move_to = self.pull_gapped_from(nonce + 1);
            if !move_to.is_empty() {
                result.move_update = Some(QueueUpdateMove::GappedToPending(move_to));
            }
        } else {
            self.gapped_nonce_queue.push(record.clone(), nonce);
            result.add_update = Some(QueueUpdateAdd::Gapped(record));
        }
        result
    }

    pub fn set_tx_count(&mut self, tx_count: u64) -> QueuesUpdate {
        let mut result = QueuesUpdate::default();
        if self.tx_count == tx_count {
            return result;
        }
        self.tx_count = tx_count;

        // drop transactions with nonce < tx_count
        while let Some((_, &queued_nonce)) = self.pending_nonce_queue.peek_min() {
            if queued_nonce >= self.tx_count {
                break;
            }
            if let Some((record, _)) = self.pending_nonce_queue.pop_min() {
                result.remove_nonce_too_small.push(record);
            }
        }
        while let Some((_, &queued_nonce)) = self.gapped_nonce_queue.peek_min() {
            if queued_nonce >= self.tx_count {
                break;
            }
            if let Some((record, _)) = self.gapped_nonce_queue.pop_min() {
                result.remove_nonce_too_small.push(record);
            }
        }
        for record in &result.remove_nonce_too_small {
            self.nonce_map.remove(&record.nonce);
        }

        // move pending txs to gapped if the first pending tx diverged from
        // the tx count
        if self.tx_count
            < self
                .pending_nonce_queue
                .peek_min()
                .map(|(_, &n)| n)
                .unwrap_or(u64::MIN)
        {
            let mut move_to_gapped = Vec::new();
            while let Some((record, nonce)) = self.pending_nonce_queue.pop_min() {
                self.gapped_nonce_queue.push(record.clone(), nonce);
                move_to_gapped.push(record);
            }
            if !move_to_gapped.is_empty() {
                result.move_update = Some(QueueUpdateMove::PendingToGapped(move_to_gapped));
            }
            return result;
        }

        // if the pending queue is empty there's a chance we can move gapped
        // txs to pending
        if self.pending_nonce_queue.is_empty() {
            let move_to_pending = self.pull_gapped_from(self.tx_count);
            if !move_to_pending.is_empty() {
                result.move_update = Some(QueueUpdateMove::GappedToPending(move_to_pending));
            }
        }

        result
    }

    /// Removes `record` if it is still the one occupying its nonce. Removing
    /// from the middle of the pending run demotes everything above it.
    pub fn remove(&mut self, record: &QueueRecord) -> Option<RemoveOutcome> {
        match self.nonce_map.get(&record.nonce) {
            Some(existing) if existing == record => {}
            _ => return None,
        }
        self.nonce_map.remove(&record.nonce);

        if self.pending_nonce_queue.remove(record).is_some() {
            let mut demoted = Vec::new();
            while let Some((_, &max_nonce)) = self.pending_nonce_queue.peek_max() {
                if max_nonce <= record.nonce {
                    break;
                }
                if let Some((rec, nonce)) = self.pending_nonce_queue.pop_max() {
                    self.gapped_nonce_queue.push(rec.clone(), nonce);
                    demoted.push(rec);
                }
            }
            demoted.reverse();
            return Some(RemoveOutcome {
                bucket: TxBucket::Pending,
                demoted,
            });
        }

        self.gapped_nonce_queue.remove(record);
        Some(RemoveOutcome {
            bucket: TxBucket::Gapped,
            demoted: Vec::new(),
        })
    }

    /// Pending records in ascending nonce order.
    pub fn pending_records(&self) -> Vec<QueueRecord> {
        let mut records: Vec<_> = self
            .pending_nonce_queue
            .iter()
            .map(|(record, _)| record.clone())
            .collect();
        records.sort_unstable_by_key(|record| record.nonce);
        records
    }

    /// Gapped records in ascending nonce order.
    pub fn gapped_records(&self) -> Vec<QueueRecord> {
        let mut records: Vec<_> = self
            .gapped_nonce_queue
            .iter()
            .map(|(record, _)| record.clone())
            .collect();
        records.sort_unstable_by_key(|record| record.nonce);
        records
    }

    fn pull_gapped_from(&mut self, mut next: Nonce) -> Vec<QueueRecord> {
        let mut moved = Vec::new();
        while let Some((_, &nonce)) = self.gapped_nonce_queue.peek_min() {
            if nonce != next {
                break;
            }
            if let Some((record, _)) = self.gapped_nonce_queue.pop_min() {
                self.pending_nonce_queue.push(record.clone(), nonce);
                moved.push(record);
                next += 1;
            }
        }
        moved
    }
}

#[cfg(test)]
mod tests {
    use common::TxHash;

    use super::*;

    fn create_record(nonce: Nonce) -> QueueRecord {
        QueueRecord {
            sender: Address::random(),
            tx_hash: TxHash::random(),
            nonce,
            sorting_gas_price: 100,
        }
    }

    fn create_sender_pool() -> SenderPool {
        SenderPool::new(Address::random(), 0)
    }

    #[test]
    fn test_add_to_pending_queue() {
        let mut pool = create_sender_pool();

        let record0 = create_record(0);
        let result = pool.add(record0.clone());
        let expected_result = QueuesUpdate {
            add_update: Some(QueueUpdateAdd::Pending(record0.clone())),
            ..Default::default()
        };
        assert_eq!(result, expected_result);
        assert_eq!(pool.pending_nonce_queue.len(), 1);
        assert_eq!(pool.gapped_nonce_queue.len(), 0);
        assert!(pool.nonce_map.contains_key(&record0.nonce));

        let record1 = create_record(1);
        let result = pool.add(record1.clone());
        let expected_result = QueuesUpdate {
            add_update: Some(QueueUpdateAdd::Pending(record1.clone())),
            ..Default::default()
        };
        assert_eq!(result, expected_result);
        assert_eq!(pool.pending_nonce_queue.len(), 2);
        assert_eq!(pool.gapped_nonce_queue.len(), 0);
    }

    #[test]
    fn test_add_to_gapped_queue() {
        let mut pool = create_sender_pool();
        let record2 = create_record(2);
        let result = pool.add(record2.clone());
        let expected_result = QueuesUpdate {
            add_update: Some(QueueUpdateAdd::Gapped(record2.clone())),
            ..Default::default()
        };
        assert_eq!(result, expected_result);
        assert_eq!(pool.gapped_nonce_queue.len(), 1);
        assert!(pool.nonce_map.contains_key(&record2.nonce));
    }

    #[test]
    fn test_add_closes_gap() {
        let mut pool = create_sender_pool();

        let record0 = create_record(0);
        let record2 = create_record(2);
        let record3 = create_record(3);
        let record5 = create_record(5);
        pool.add(record0.clone());
        pool.add(record2.clone());
        pool.add(record3.clone());
        pool.add(record5.clone());

        let record1 = create_record(1);
        let result = pool.add(record1.clone());
        let expected_result = QueuesUpdate {
            add_update: Some(QueueUpdateAdd::Pending(record1.clone())),
            move_update: Some(QueueUpdateMove::GappedToPending(vec![
                record2.clone(),
                record3.clone(),
            ])),
            ..Default::default()
        };
        assert_eq!(result, expected_result);
        assert_eq!(
            pool.pending_nonce_queue,
            DoublePriorityQueue::<QueueRecord, Nonce>::from(vec![
                (record0, 0),
                (record1, 1),
                (record2, 2),
                (record3, 3),
            ])
        );
        assert_eq!(
            pool.gapped_nonce_queue,
            DoublePriorityQueue::<QueueRecord, Nonce>::from(vec![(record5, 5)])
        );
    }

    #[test]
    fn test_set_tx_count_no_change() {
        let mut pool = create_sender_pool();
        pool.tx_count = 5;

        let result = pool.set_tx_count(5);

        let expected_result = QueuesUpdate::default();
        assert_eq!(result, expected_result);
        assert_eq!(pool.tx_count, 5);
    }

    #[test]
    fn test_set_tx_count_drops_and_moves() {
        let mut pool = create_sender_pool();

        let record0 = create_record(0);
        let record1 = create_record(1);
        let record2 = create_record(2);
        let record4 = create_record(4);
        let record5 = create_record(5);
        let record6 = create_record(6);
        let record8 = create_record(8);

        // pending
        pool.add(record0.clone());
        pool.add(record1.clone());
        pool.add(record2.clone());
        // gapped
        pool.add(record4.clone());
        pool.add(record5.clone());
        pool.add(record6.clone());
        pool.add(record8.clone());

        let result = pool.set_tx_count(2);
        let expected_result = QueuesUpdate {
            remove_nonce_too_small: vec![record0.clone(), record1.clone()],
            ..Default::default()
        };
        assert_eq!(result, expected_result);
        assert_eq!(pool.tx_count, 2);
        assert_eq!(
            pool.pending_nonce_queue,
            DoublePriorityQueue::<QueueRecord, Nonce>::from(vec![(record2.clone(), 2)])
        );

        let result = pool.set_tx_count(5);
        let expected_result = QueuesUpdate {
            remove_nonce_too_small: vec![record2.clone(), record4.clone()],
            move_update: Some(QueueUpdateMove::GappedToPending(vec![
                record5.clone(),
                record6.clone(),
            ])),
            ..Default::default()
        };
        assert_eq!(result, expected_result);
        assert_eq!(
            pool.pending_nonce_queue,
            DoublePriorityQueue::<QueueRecord, Nonce>::from(vec![
                (record5.clone(), 5),
                (record6.clone(), 6),
            ])
        );
        assert_eq!(
            pool.gapped_nonce_queue,
            DoublePriorityQueue::<QueueRecord, Nonce>::from(vec![(record8.clone(), 8)])
        );
    }

    #[test]
    fn test_set_tx_count_demotes_diverged_pending() {
        let mut pool = create_sender_pool();
        pool.tx_count = 2;
        let record2 = create_record(2);
        let record3 = create_record(3);
        pool.add(record2.clone());
        pool.add(record3.clone());

        let result = pool.set_tx_count(1);
        let expected_result = QueuesUpdate {
            move_update: Some(QueueUpdateMove::PendingToGapped(vec![
                record2.clone(),
                record3.clone(),
            ])),
            ..Default::default()
        };
        assert_eq!(result, expected_result);
        assert!(pool.pending_nonce_queue.is_empty());
        assert_eq!(
            pool.gapped_nonce_queue,
            DoublePriorityQueue::<QueueRecord, Nonce>::from(vec![
                (record2.clone(), 2),
                (record3.clone(), 3)
            ])
        );
    }

    #[test]
    fn test_remove_mid_pending_demotes_tail() {
        let mut pool = create_sender_pool();

        let record0 = create_record(0);
        let record1 = create_record(1);
        let record2 = create_record(2);
        pool.add(record0.clone());
        pool.add(record1.clone());
        pool.add(record2.clone());

        let outcome = pool.remove(&record1).unwrap();
        assert_eq!(outcome.bucket, TxBucket::Pending);
        assert_eq!(outcome.demoted, vec![record2.clone()]);
        assert_eq!(
            pool.pending_nonce_queue,
            DoublePriorityQueue::<QueueRecord, Nonce>::from(vec![(record0, 0)])
        );
        assert_eq!(
            pool.gapped_nonce_queue,
            DoublePriorityQueue::<QueueRecord, Nonce>::from(vec![(record2, 2)])
        );
        assert!(!pool.nonce_map.contains_key(&1));
    }

    #[test]
    fn test_remove_stale_record_is_ignored() {
        let mut pool = create_sender_pool();
        let record0 = create_record(0);
        pool.add(record0.clone());

        let replacement = create_record(0);
        assert!(pool.remove(&replacement).is_none());
        assert!(pool.nonce_map.contains_key(&0));
    }

}
