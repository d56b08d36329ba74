use common::{Address, Nonce, TxHash};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MempoolError {
    #[error("tx is already known")]
    AlreadyKnown,
    #[error("admission queue is full")]
    QueueFull,
    #[error("mempool is closed")]
    Closed,
    #[error("sender {0} is reserved by the other pool")]
    AlreadyReserved(Address),
    #[error("nonce is too low: {0} < {1}")]
    NonceTooLow(Nonce, Nonce),
    #[error("nonce is too high: {0} > {1}")]
    NonceTooHigh(Nonce, Nonce),
    #[error("tx is underpriced")]
    Underpriced,
    #[error("unsupported tx type")]
    UnsupportedTxType,
    #[error("tx has no signers")]
    UnknownSender,
    #[error("tx {hash} rejected: {source}")]
    Rejected {
        hash: TxHash,
        #[source]
        source: ValidationError,
    },
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("state read error: {0}")]
    State(#[from] anyhow::Error),
}

impl MempoolError {
    /// True for rejections that later account activity can resolve on its
    /// own: nonce gaps, signer sequence mismatches and out of gas failures.
    /// Transactions removed with such an error stay in the account pool and
    /// get re-evaluated on the next recheck.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Rejected {
                source: ValidationError::NonceGap { .. }
                    | ValidationError::SequenceMismatch { .. }
                    | ValidationError::OutOfGas,
                ..
            }
        )
    }
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("nonce is too low: {got} < {expected}")]
    NonceTooLow { got: Nonce, expected: Nonce },
    #[error("nonce gap: expected {expected}, got {got}")]
    NonceGap { expected: Nonce, got: Nonce },
    #[error("signer sequence mismatch: {got} < {expected}")]
    SequenceMismatch { got: Nonce, expected: Nonce },
    #[error("out of gas")]
    OutOfGas,
    #[error("insufficient funds for gas * price + value")]
    InsufficientFunds,
    #[error("gas limit exceeds block gas limit: {0} > {1}")]
    ExceedsBlockGas(u64, u64),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed tx bytes: {0}")]
    Malformed(String),
    #[error("tx encoding failed: {0}")]
    Encode(String),
    #[error("tx too large: {size} > {max}")]
    Oversized { size: usize, max: usize },
}
