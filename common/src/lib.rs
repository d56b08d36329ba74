pub mod test_utils;
pub mod types;

// ===== Reexports =====
pub use alloy_primitives::{Address, Bytes, B256, U256};
pub use types::{AccountTx, GasPrice, NativeTx, Nonce, PoolTx, SignerInfo, TxHash};
