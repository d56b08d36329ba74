use std::sync::Arc;

use alloy_primitives::{Address, Bytes, B256, U256};

pub type TxHash = B256;
pub type Nonce = u64;
pub type GasPrice = u128;

/// One signature slot on a fee-lane transaction: the signing account and the
/// account sequence it signed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignerInfo {
    pub address: Address,
    pub sequence: Nonce,
}

impl SignerInfo {
    pub fn new(address: Address, sequence: Nonce) -> Self {
        Self { address, sequence }
    }
}

/// Account-lane transaction. Ordered per sender by `nonce`, priced by the
/// fee cap / tip cap pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountTx {
    pub hash: TxHash,
    pub sender: Address,
    pub nonce: Nonce,
    pub gas_limit: u64,
    pub fee_cap: GasPrice,
    pub tip_cap: GasPrice,
    pub value: U256,
    pub payload: Bytes,
}

impl AccountTx {
    /// Worst case balance the sender must hold to execute this transaction.
    pub fn cost(&self) -> U256 {
        U256::from(self.gas_limit) * U256::from(self.fee_cap) + self.value
    }

    /// Tip per gas unit paid on top of `base_fee`, or `None` if the fee cap
    /// cannot cover the base fee at all.
    pub fn effective_tip(&self, base_fee: Option<GasPrice>) -> Option<GasPrice> {
        match base_fee {
            None => Some(self.tip_cap),
            Some(base) if self.fee_cap < base => None,
            Some(base) => Some(self.tip_cap.min(self.fee_cap - base)),
        }
    }
}

/// Fee-lane transaction. Carries a flat fee for a declared gas budget and one
/// or more signers, each pinned to an account sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeTx {
    pub hash: TxHash,
    pub signers: Vec<SignerInfo>,
    pub fee: u128,
    pub gas_limit: u64,
    pub payload: Bytes,
}

impl NativeTx {
    /// Fee normalized per gas unit. A zero gas budget prices at zero instead
    /// of dividing by it.
    pub fn gas_price(&self) -> GasPrice {
        if self.gas_limit == 0 {
            0
        } else {
            self.fee / u128::from(self.gas_limit)
        }
    }

    /// Tip over `base_fee`, floored at zero. Fee-lane transactions are never
    /// excluded for underpricing the base fee, they just sort last.
    pub fn effective_tip(&self, base_fee: Option<GasPrice>) -> GasPrice {
        match base_fee {
            None => self.gas_price(),
            Some(base) => self.gas_price().saturating_sub(base),
        }
    }

    pub fn first_signer(&self) -> Option<&SignerInfo> {
        self.signers.first()
    }
}

/// Unified view over both transaction lanes, handed out by iteration and
/// proposal building.
#[derive(Debug, Clone)]
pub enum PoolTx {
    Account(Arc<AccountTx>),
    Native(Arc<NativeTx>),
}

impl PoolTx {
    pub fn hash(&self) -> &TxHash {
        match self {
            Self::Account(tx) => &tx.hash,
            Self::Native(tx) => &tx.hash,
        }
    }

    pub fn gas_limit(&self) -> u64 {
        match self {
            Self::Account(tx) => tx.gas_limit,
            Self::Native(tx) => tx.gas_limit,
        }
    }

    pub fn payload(&self) -> &Bytes {
        match self {
            Self::Account(tx) => &tx.payload,
            Self::Native(tx) => &tx.payload,
        }
    }

    pub fn as_account(&self) -> Option<&Arc<AccountTx>> {
        match self {
            Self::Account(tx) => Some(tx),
            Self::Native(_) => None,
        }
    }

    pub fn as_native(&self) -> Option<&Arc<NativeTx>> {
        match self {
            Self::Account(_) => None,
            Self::Native(tx) => Some(tx),
        }
    }
}

impl From<Arc<AccountTx>> for PoolTx {
    fn from(tx: Arc<AccountTx>) -> Self {
        Self::Account(tx)
    }
}

impl From<Arc<NativeTx>> for PoolTx {
    fn from(tx: Arc<NativeTx>) -> Self {
        Self::Native(tx)
    }
}
