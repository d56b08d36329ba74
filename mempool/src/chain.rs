use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::broadcast;
use tracing::debug;

use common::{Address, GasPrice, U256};

const HEAD_FEED_CAPACITY: usize = 64;

/// Account state as read from committed chain state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountInfo {
    pub nonce: u64,
    pub balance: U256,
}

/// Committed chain state the pools validate against.
pub trait StateReader: Send + Sync + 'static {
    fn account(&self, address: &Address) -> anyhow::Result<AccountInfo>;
    fn base_fee(&self) -> Option<GasPrice>;
    fn block_gas_limit(&self) -> u64;
    fn height(&self) -> u64;
}

/// Latest committed block header fields the pools care about.
#[derive(Debug, Clone, Copy)]
pub struct HeadState {
    pub height: u64,
    pub base_fee: Option<GasPrice>,
    pub gas_limit: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct HeadEvent {
    pub height: u64,
}

/// Caches the head and fans block notifications out to the recheck
/// schedulers and the proposal loop.
pub struct ChainView<S> {
    reader: Arc<S>,
    head: RwLock<HeadState>,
    feed: broadcast::Sender<HeadEvent>,
}

impl<S: StateReader> ChainView<S> {
    pub fn new(reader: Arc<S>) -> Self {
        let head = HeadState {
            height: reader.height(),
            base_fee: reader.base_fee(),
            gas_limit: reader.block_gas_limit(),
        };
        let (feed, _) = broadcast::channel(HEAD_FEED_CAPACITY);
        Self {
            reader,
            head: RwLock::new(head),
            feed,
        }
    }

    pub fn reader(&self) -> &S {
        &self.reader
    }

    pub fn head(&self) -> HeadState {
        *self.head.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HeadEvent> {
        self.feed.subscribe()
    }

    /// Refreshes the cached head from the reader and publishes the new height
    /// to subscribers.
    pub fn notify_new_block(&self) {
        let head = HeadState {
            height: self.reader.height(),
            base_fee: self.reader.base_fee(),
            gas_limit: self.reader.block_gas_limit(),
        };
        *self.head.write().unwrap_or_else(PoisonError::into_inner) = head;
        debug!(height = head.height, "new block head");
        let _ = self.feed.send(HeadEvent {
            height: head.height,
        });
    }
}

/// Copy-on-write account view over a [`StateReader`]. Validation walks write
/// consumed nonces and spent balances here without touching committed state.
pub struct StateOverlay<'a> {
    reader: &'a dyn StateReader,
    accounts: HashMap<Address, AccountInfo>,
}

impl<'a> StateOverlay<'a> {
    pub fn new(reader: &'a dyn StateReader) -> Self {
        Self {
            reader,
            accounts: HashMap::new(),
        }
    }

    /// Committed state on first access, overlay afterwards.
    pub fn account(&mut self, address: &Address) -> anyhow::Result<AccountInfo> {
        if let Some(info) = self.accounts.get(address) {
            return Ok(*info);
        }
        let info = self.reader.account(address)?;
        self.accounts.insert(*address, info);
        Ok(info)
    }

    pub fn set_account(&mut self, address: Address, info: AccountInfo) {
        self.accounts.insert(address, info);
    }

    pub fn base_fee(&self) -> Option<GasPrice> {
        self.reader.base_fee()
    }

    pub fn block_gas_limit(&self) -> u64 {
        self.reader.block_gas_limit()
    }

    /// Forks the overlay. The branch sees every write made so far; writes to
    /// the branch stay invisible here until [`StateOverlay::merge`].
    pub fn branch(&self) -> StateOverlay<'a> {
        StateOverlay {
            reader: self.reader,
            accounts: self.accounts.clone(),
        }
    }

    pub fn merge(&mut self, branch: StateOverlay<'a>) {
        self.accounts.extend(branch.accounts);
    }
}

#[cfg(test)]
mod tests {
    use common::test_utils::addr;

    use super::*;

    struct FlatReader;

    impl StateReader for FlatReader {
        fn account(&self, _address: &Address) -> anyhow::Result<AccountInfo> {
            Ok(AccountInfo {
                nonce: 3,
                balance: U256::from(1_000u64),
            })
        }

        fn base_fee(&self) -> Option<GasPrice> {
            Some(7)
        }

        fn block_gas_limit(&self) -> u64 {
            30_000_000
        }

        fn height(&self) -> u64 {
            1
        }
    }

    #[test]
    fn test_overlay_writes_shadow_committed_state() {
        let reader = FlatReader;
        let mut overlay = StateOverlay::new(&reader);
        assert_eq!(overlay.account(&addr(1)).unwrap().nonce, 3);

        overlay.set_account(
            addr(1),
            AccountInfo {
                nonce: 4,
                balance: U256::from(900u64),
            },
        );
        assert_eq!(overlay.account(&addr(1)).unwrap().nonce, 4);
        // other accounts still read through
        assert_eq!(overlay.account(&addr(2)).unwrap().nonce, 3);
    }

    #[test]
    fn test_branch_isolates_probe_writes() {
        let reader = FlatReader;
        let mut overlay = StateOverlay::new(&reader);
        overlay.set_account(
            addr(1),
            AccountInfo {
                nonce: 5,
                balance: U256::ZERO,
            },
        );

        let mut probe = overlay.branch();
        assert_eq!(probe.account(&addr(1)).unwrap().nonce, 5);
        probe.set_account(
            addr(1),
            AccountInfo {
                nonce: 9,
                balance: U256::ZERO,
            },
        );

        // discarding the probe leaves the parent untouched
        drop(probe);
        assert_eq!(overlay.account(&addr(1)).unwrap().nonce, 5);
    }

    #[test]
    fn test_merge_carries_probe_writes_forward() {
        let reader = FlatReader;
        let mut overlay = StateOverlay::new(&reader);
        let mut probe = overlay.branch();
        probe.set_account(
            addr(1),
            AccountInfo {
                nonce: 9,
                balance: U256::ZERO,
            },
        );

        overlay.merge(probe);
        assert_eq!(overlay.account(&addr(1)).unwrap().nonce, 9);
    }
}
