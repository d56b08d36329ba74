use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use common::Address;

use crate::error::MempoolError;

/// Which transaction lane currently owns a sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Account,
    Priority,
}

/// Maps senders to the pool holding their transactions. A sender belongs to
/// at most one pool at a time and the other lane rejects it until released.
#[derive(Debug, Default)]
pub struct SenderReserver {
    owners: Mutex<HashMap<Address, PoolKind>>,
}

impl SenderReserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn handle(self: &Arc<Self>, kind: PoolKind) -> ReservationHandle {
        ReservationHandle {
            inner: self.clone(),
            kind,
        }
    }

    /// Reserves all `senders` for `kind` or none of them. Re-holding a sender
    /// already owned by `kind` is a no-op, so retried inserts stay cheap.
    fn hold(&self, kind: PoolKind, senders: &[Address]) -> Result<(), MempoolError> {
        let mut owners = self.owners.lock().unwrap_or_else(PoisonError::into_inner);
        for sender in senders {
            if let Some(&owner) = owners.get(sender) {
                if owner != kind {
                    return Err(MempoolError::AlreadyReserved(*sender));
                }
            }
        }
        for sender in senders {
            owners.entry(*sender).or_insert(kind);
        }
        Ok(())
    }

    /// Releases only reservations `kind` actually holds.
    fn release(&self, kind: PoolKind, senders: &[Address]) {
        let mut owners = self.owners.lock().unwrap_or_else(PoisonError::into_inner);
        for sender in senders {
            match owners.get(sender) {
                Some(&owner) if owner == kind => {
                    owners.remove(sender);
                }
                Some(owner) => {
                    debug!(%sender, ?owner, "release skipped, sender owned by the other pool");
                }
                None => {}
            }
        }
    }
}

/// Pool-side view of the reserver with the owning lane baked in.
#[derive(Clone)]
pub struct ReservationHandle {
    inner: Arc<SenderReserver>,
    kind: PoolKind,
}

impl ReservationHandle {
    pub fn hold(&self, senders: &[Address]) -> Result<(), MempoolError> {
        self.inner.hold(self.kind, senders)
    }

    pub fn release(&self, senders: &[Address]) {
        self.inner.release(self.kind, senders)
    }
}

#[cfg(test)]
impl SenderReserver {
    pub fn owner(&self, sender: &Address) -> Option<PoolKind> {
        self.owners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(sender)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.owners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
