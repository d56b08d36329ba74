use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use common::Bytes;

use crate::chain::HeadEvent;
use crate::config::ProposalConfig;

/// Block payload assembled ahead of time: ordered wire bytes plus the budget
/// totals they consumed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Proposal {
    pub height: u64,
    pub txs: Vec<Bytes>,
    pub total_bytes: u64,
    pub total_gas: u64,
}

/// Byte and gas budget accounting for one selection pass. A transaction that
/// does not fit is skipped, smaller ones behind it may still make it in;
/// selection stops once either budget is reached.
pub struct ProposalSizer {
    max_bytes: u64,
    max_gas: u64,
    txs: Vec<Bytes>,
    total_bytes: u64,
    total_gas: u64,
}

impl ProposalSizer {
    /// Zero for either budget disables that dimension.
    pub fn new(max_bytes: u64, max_gas: u64) -> Self {
        Self {
            max_bytes,
            max_gas,
            txs: Vec::new(),
            total_bytes: 0,
            total_gas: 0,
        }
    }

    /// Offers an encoded transaction. Returns true once the proposal is full
    /// and selection should stop.
    pub fn offer(&mut self, raw: Bytes, gas: u64) -> bool {
        let size = raw.len() as u64;
        let fits_bytes = self.max_bytes == 0 || self.total_bytes + size <= self.max_bytes;
        let fits_gas = self.max_gas == 0 || self.total_gas + gas <= self.max_gas;
        if fits_bytes && fits_gas {
            self.total_bytes += size;
            self.total_gas += gas;
            self.txs.push(raw);
        }
        (self.max_bytes > 0 && self.total_bytes >= self.max_bytes)
            || (self.max_gas > 0 && self.total_gas >= self.max_gas)
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn into_proposal(self, height: u64) -> Proposal {
        Proposal {
            height,
            txs: self.txs,
            total_bytes: self.total_bytes,
            total_gas: self.total_gas,
        }
    }
}

/// Selection backend the builder calls on every rebuild tick. `None` means
/// the backing pool is gone and the tick is dropped.
pub trait BuildSource: Clone + Send + Sync + 'static {
    fn build(&self, height: u64) -> impl Future<Output = Option<Proposal>> + Send;
}

struct Best {
    height: u64,
    proposal: Proposal,
}

impl Best {
    fn at(height: u64) -> Self {
        Self {
            height,
            proposal: Proposal {
                height,
                ..Proposal::default()
            },
        }
    }
}

/// Speculatively rebuilds the next block's payload on a fixed cadence and on
/// head events, keeping the largest proposal seen for the upcoming height.
pub struct ProposalBuilder {
    best: Arc<Mutex<Best>>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ProposalBuilder {
    /// `head_height` is the committed height at startup; builds target the
    /// height right above it until the next head event.
    pub fn start<B: BuildSource>(
        config: &ProposalConfig,
        head_rx: broadcast::Receiver<HeadEvent>,
        source: B,
        head_height: u64,
    ) -> Self {
        let best = Arc::new(Mutex::new(Best::at(head_height + 1)));
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(run_builder_loop(
            config.interval(),
            head_rx,
            source,
            Arc::clone(&best),
            shutdown.clone(),
        ));
        Self {
            best,
            shutdown,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Best proposal built for the upcoming height so far. Cheap enough for
    /// the consensus hot path, never waits on an in-progress build.
    pub fn latest_proposal(&self) -> Proposal {
        self.best
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .proposal
            .clone()
    }

    pub async fn close(&self) {
        self.shutdown.cancel();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                error!(?err, "proposal builder worker failed");
            }
        }
    }
}

async fn run_builder_loop<B: BuildSource>(
    interval: Duration,
    mut head_rx: broadcast::Receiver<HeadEvent>,
    source: B,
    best: Arc<Mutex<Best>>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            event = head_rx.recv() => match event {
                Ok(head) => {
                    let height = head.height + 1;
                    debug!(height, "new proposal target");
                    *best.lock().unwrap_or_else(PoisonError::into_inner) = Best::at(height);
                    spawn_build(&source, &best, height);
                    ticker.reset();
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "proposal builder lagging behind head events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("head feed closed, stopping proposal builds");
                    return;
                }
            },
            _ = ticker.tick() => {
                let height = best.lock().unwrap_or_else(PoisonError::into_inner).height;
                spawn_build(&source, &best, height);
            }
            _ = shutdown.cancelled() => {
                info!("shutting down proposal builder");
                return;
            }
        }
    }
}

/// Builds may overlap; a slow one never holds the next tick back. Results
/// for an already superseded height are discarded on arrival.
fn spawn_build<B: BuildSource>(source: &B, best: &Arc<Mutex<Best>>, height: u64) {
    let source = source.clone();
    let best = Arc::clone(best);
    tokio::spawn(async move {
        if let Some(proposal) = source.build(height).await {
            offer_proposal(&best, proposal);
        }
    });
}

fn offer_proposal(best: &Mutex<Best>, proposal: Proposal) {
    let mut best = best.lock().unwrap_or_else(PoisonError::into_inner);
    if proposal.height < best.height {
        debug!(
            height = proposal.height,
            current = best.height,
            "discarding stale proposal"
        );
        return;
    }
    if proposal.height > best.height {
        best.height = proposal.height;
        best.proposal = proposal;
        return;
    }
    if proposal.txs.len() > best.proposal.txs.len() {
        debug!(
            height = proposal.height,
            txs = proposal.txs.len(),
            "new best proposal"
        );
        best.proposal = proposal;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::chain::HeadEvent;

    fn raw(len: usize) -> Bytes {
        Bytes::from(vec![0xaa; len])
    }

    #[test]
    fn test_sizer_stops_at_byte_budget() {
        let mut sizer = ProposalSizer::new(100, 0);
        assert!(!sizer.offer(raw(40), 1));
        assert!(!sizer.offer(raw(40), 1));
        assert!(sizer.offer(raw(20), 1));
        let proposal = sizer.into_proposal(7);
        assert_eq!(proposal.txs.len(), 3);
        assert_eq!(proposal.total_bytes, 100);
        assert_eq!(proposal.height, 7);
    }

    #[test]
    fn test_sizer_skips_oversized_keeps_scanning() {
        let mut sizer = ProposalSizer::new(100, 0);
        assert!(!sizer.offer(raw(90), 1));
        // too big for the remainder, but a smaller one still fits
        assert!(!sizer.offer(raw(50), 1));
        assert!(!sizer.offer(raw(5), 1));
        assert_eq!(sizer.len(), 2);
        assert_eq!(sizer.into_proposal(1).total_bytes, 95);
    }

    #[test]
    fn test_sizer_gas_budget() {
        let mut sizer = ProposalSizer::new(0, 50_000);
        assert!(!sizer.offer(raw(10), 21_000));
        assert!(!sizer.offer(raw(10), 40_000));
        assert!(sizer.offer(raw(10), 29_000));
        assert_eq!(sizer.len(), 2);
        assert_eq!(sizer.into_proposal(1).total_gas, 50_000);
    }

    fn proposal_of(height: u64, txs: usize) -> Proposal {
        Proposal {
            height,
            txs: vec![raw(1); txs],
            ..Proposal::default()
        }
    }

    #[test]
    fn test_offer_keeps_largest_and_discards_stale() {
        let best = Mutex::new(Best::at(10));

        offer_proposal(&best, proposal_of(10, 2));
        assert_eq!(best.lock().unwrap().proposal.txs.len(), 2);

        // same height, fewer transactions: kept out
        offer_proposal(&best, proposal_of(10, 1));
        assert_eq!(best.lock().unwrap().proposal.txs.len(), 2);

        // stale height: ignored outright
        offer_proposal(&best, proposal_of(9, 3));
        assert_eq!(best.lock().unwrap().proposal.txs.len(), 2);

        offer_proposal(&best, proposal_of(10, 3));
        assert_eq!(best.lock().unwrap().proposal.txs.len(), 3);
    }

    #[derive(Clone)]
    struct ScriptedSource {
        script: Arc<Mutex<VecDeque<Vec<Bytes>>>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Vec<Bytes>>) -> Self {
            Self {
                script: Arc::new(Mutex::new(script.into())),
            }
        }
    }

    impl BuildSource for ScriptedSource {
        async fn build(&self, height: u64) -> Option<Proposal> {
            let txs = self.script.lock().unwrap().pop_front()?;
            Some(Proposal {
                height,
                total_bytes: txs.iter().map(|tx| tx.len() as u64).sum(),
                total_gas: 0,
                txs,
            })
        }
    }

    #[tokio::test]
    async fn test_builder_keeps_best_for_height() {
        let source = ScriptedSource::new(vec![
            vec![raw(1), raw(1)],
            vec![raw(1)],
            vec![raw(1), raw(1), raw(1)],
        ]);
        let (head_tx, head_rx) = broadcast::channel(4);
        let config = ProposalConfig {
            interval_ms: 10,
            ..ProposalConfig::default()
        };
        let builder = ProposalBuilder::start(&config, head_rx, source, 5);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let latest = builder.latest_proposal();
        assert_eq!(latest.height, 6);
        assert_eq!(latest.txs.len(), 3);

        // a new head resets the target even with nothing left to build
        head_tx.send(HeadEvent { height: 6 }).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let latest = builder.latest_proposal();
        assert_eq!(latest.height, 7);
        assert!(latest.txs.is_empty());

        builder.close().await;
    }
}
