mod chain;
mod codec;
mod config;
mod error;
mod heightsync;
mod iterator;
mod mempool;
mod pools;
mod proposal;
mod queue;
mod reap_list;
mod recheck;
mod reserver;
mod tracker;
mod validator;


pub use chain::{AccountInfo, ChainView, HeadEvent, HeadState, StateOverlay, StateReader};
pub use codec::TxCodec;
pub use config::{AccountPoolConfig, Config, PriorityPoolConfig, ProposalConfig, QueueConfig};
pub use error::{CodecError, MempoolError, ValidationError};
pub use iterator::MergeIterator;
pub use mempool::Mempool;
pub use pools::{NullListener, PoolListener, RemovalReason};
pub use proposal::Proposal;
pub use reserver::PoolKind;
pub use tracker::{MetricSummary, TrackerSnapshot};
pub use validator::{AnteValidator, NoValidation};
