use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use priority_queue::PriorityQueue;
use tracing::warn;

use common::{Address, GasPrice, NativeTx, PoolTx};

use crate::codec::TxCodec;
use crate::pools::PendingCursorEntry;

/// Rank of a sender's head within the account cursor: best tip first,
/// admission order among equal tips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct HeadRank {
    tip: GasPrice,
    seq: Reverse<u64>,
}

impl HeadRank {
    fn of(entry: &PendingCursorEntry) -> Self {
        Self {
            tip: entry.tip,
            seq: Reverse(entry.seq),
        }
    }
}

/// Account-lane side of merged iteration. Each sender contributes its
/// gapless pending run in nonce order; across senders the heads compete by
/// the tip they pay.
#[derive(Default)]
pub struct AccountCursor {
    heads: PriorityQueue<Address, HeadRank>,
    runs: HashMap<Address, VecDeque<PendingCursorEntry>>,
}

impl AccountCursor {
    pub fn new(snapshot: HashMap<Address, VecDeque<PendingCursorEntry>>) -> Self {
        let mut heads = PriorityQueue::with_capacity(snapshot.len());
        for (sender, run) in &snapshot {
            if let Some(entry) = run.front() {
                heads.push(*sender, HeadRank::of(entry));
            }
        }
        Self {
            heads,
            runs: snapshot,
        }
    }

    pub fn len(&self) -> usize {
        self.runs.values().map(VecDeque::len).sum()
    }

    fn peek(&self) -> Option<&PendingCursorEntry> {
        let (sender, _) = self.heads.peek()?;
        self.runs.get(sender)?.front()
    }

    /// Advances within the current best sender; the next nonce takes over
    /// the head slot at its own tip.
    fn shift(&mut self) {
        let Some((&sender, _)) = self.heads.peek() else {
            return;
        };
        let Some(run) = self.runs.get_mut(&sender) else {
            return;
        };
        run.pop_front();
        match run.front() {
            Some(next) => {
                self.heads.change_priority(&sender, HeadRank::of(next));
            }
            None => {
                self.heads.remove(&sender);
                self.runs.remove(&sender);
            }
        }
    }

    /// Drops the current best sender with the rest of its run.
    fn skip_sender(&mut self) {
        if let Some((sender, _)) = self.heads.pop() {
            self.runs.remove(&sender);
        }
    }
}

/// Fee-lane side of merged iteration, already ranked best paying first.
pub struct PriorityCursor {
    entries: VecDeque<Arc<NativeTx>>,
    base_fee: Option<GasPrice>,
}

impl PriorityCursor {
    pub fn new(entries: Vec<Arc<NativeTx>>, base_fee: Option<GasPrice>) -> Self {
        Self {
            entries: entries.into(),
            base_fee,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn peek(&self) -> Option<(&Arc<NativeTx>, GasPrice)> {
        self.entries
            .front()
            .map(|tx| (tx, tx.effective_tip(self.base_fee)))
    }

    fn advance(&mut self) {
        self.entries.pop_front();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccountAction {
    Advance,
    Skip,
    None,
}

/// Merges the two lane cursors into one tip-descending stream. The selection
/// is resolved ahead of time, so [`MergeIterator::peek`] and the following
/// [`Iterator::next`] always agree on the same transaction.
pub struct MergeIterator<C> {
    account: AccountCursor,
    priority: PriorityCursor,
    codec: Arc<C>,
    current: Option<PoolTx>,
    account_action: AccountAction,
    advance_priority: bool,
}

impl<C: TxCodec> MergeIterator<C> {
    pub fn new(account: AccountCursor, priority: PriorityCursor, codec: Arc<C>) -> Self {
        let mut iter = Self {
            account,
            priority,
            codec,
            current: None,
            account_action: AccountAction::None,
            advance_priority: false,
        };
        iter.resolve();
        iter
    }

    /// Current selection without advancing.
    pub fn peek(&self) -> Option<&PoolTx> {
        self.current.as_ref()
    }

    /// Transactions left on both cursors, the current selection included.
    pub fn remaining(&self) -> usize {
        self.account.len() + self.priority.len()
    }

    fn resolve(&mut self) {
        self.account_action = AccountAction::None;
        self.advance_priority = false;
        self.current = None;

        let account_tip = self.account.peek().map(|entry| entry.tip);
        let priority_tip = self.priority.peek().map(|(_, tip)| tip);
        let prefer_priority = match (account_tip, priority_tip) {
            (None, None) => return,
            (None, Some(_)) => true,
            (Some(_), None) => false,
            // the account lane wins ties so nonce runs drain in streaks
            (Some(account), Some(priority)) => priority > account,
        };

        if !prefer_priority {
            if let Some(entry) = self.account.peek() {
                match self.codec.wrap_account(Arc::clone(&entry.tx)) {
                    Ok(tx) => {
                        self.current = Some(tx);
                        self.account_action = AccountAction::Advance;
                        return;
                    }
                    Err(err) => {
                        // later nonces of this sender would fail the same
                        // way, drop the whole run and fall back to the fee
                        // lane for this round
                        warn!(hash = %entry.tx.hash, %err, "sender dropped from iteration, wrap failed");
                        self.account_action = AccountAction::Skip;
                    }
                }
            }
        }

        if let Some((tx, _)) = self.priority.peek() {
            self.current = Some(PoolTx::Native(Arc::clone(tx)));
            self.advance_priority = true;
        }
    }

    fn advance_cursors(&mut self) {
        match self.account_action {
            AccountAction::Advance => self.account.shift(),
            AccountAction::Skip => self.account.skip_sender(),
            AccountAction::None => {}
        }
        if self.advance_priority {
            self.priority.advance();
        }
    }
}

impl<C: TxCodec> Iterator for MergeIterator<C> {
    type Item = PoolTx;

    fn next(&mut self) -> Option<PoolTx> {
        let out = self.current.take()?;
        self.advance_cursors();
        self.resolve();
        Some(out)
    }
}
