//! Fixture constructors shared by unit and integration tests.

use std::sync::Arc;

use alloy_primitives::{Address, Bytes, B256, U256};

use crate::types::{AccountTx, GasPrice, NativeTx, Nonce, SignerInfo};

/// Deterministic address from a small test id.
pub fn addr(id: u8) -> Address {
    Address::repeat_byte(id)
}

/// Account-lane fixture with a freshly drawn hash and a small payload.
pub fn account_tx(sender: Address, nonce: Nonce, fee_cap: GasPrice, tip_cap: GasPrice) -> AccountTx {
    AccountTx {
        hash: B256::random(),
        sender,
        nonce,
        gas_limit: 21_000,
        fee_cap,
        tip_cap,
        value: U256::ZERO,
        payload: Bytes::from(vec![0xfe; 16]),
    }
}

pub fn account_tx_arc(
    sender: Address,
    nonce: Nonce,
    fee_cap: GasPrice,
    tip_cap: GasPrice,
) -> Arc<AccountTx> {
    Arc::new(account_tx(sender, nonce, fee_cap, tip_cap))
}

/// Fee-lane fixture with a single signer.
pub fn native_tx(signer: Address, sequence: Nonce, fee: u128, gas_limit: u64) -> NativeTx {
    NativeTx {
        hash: B256::random(),
        signers: vec![SignerInfo::new(signer, sequence)],
        fee,
        gas_limit,
        payload: Bytes::from(vec![0xab; 16]),
    }
}

pub fn native_tx_arc(signer: Address, sequence: Nonce, fee: u128, gas_limit: u64) -> Arc<NativeTx> {
    Arc::new(native_tx(signer, sequence, fee, gas_limit))
}

/// Fee-lane fixture signed by several accounts at once.
pub fn native_tx_multi(signers: &[(Address, Nonce)], fee: u128, gas_limit: u64) -> Arc<NativeTx> {
    Arc::new(NativeTx {
        hash: B256::random(),
        signers: signers
            .iter()
            .map(|&(address, sequence)| SignerInfo::new(address, sequence))
            .collect(),
        fee,
        gas_limit,
        payload: Bytes::from(vec![0xab; 16]),
    })
}
