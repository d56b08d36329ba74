use std::sync::Arc;

use common::{AccountTx, Bytes, PoolTx};

use crate::error::CodecError;

/// Wire codec shared by both lanes. Decoding turns gossip bytes into a typed
/// transaction, encoding turns a pooled transaction back into block bytes.
pub trait TxCodec: Send + Sync + 'static {
    fn decode(&self, raw: &[u8]) -> Result<PoolTx, CodecError>;

    fn encode(&self, tx: &PoolTx) -> Result<Bytes, CodecError>;

    /// Lifts an account-lane transaction into the unified envelope during
    /// merged iteration. The default is the identity wrap; implementations
    /// that re-encode here may fail, which skips the rest of that sender's
    /// transactions.
    fn wrap_account(&self, tx: Arc<AccountTx>) -> Result<PoolTx, CodecError> {
        Ok(PoolTx::Account(tx))
    }
}
