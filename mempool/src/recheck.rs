use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const TRIGGER_CHANNEL_SIZE: usize = 16;

struct Trigger {
    done: Option<oneshot::Sender<()>>,
}

/// Collapses block-arrival bursts into single recheck runs. At most one run
/// executes at a time; a trigger landing mid-run cancels it and schedules
/// exactly one follow-up no matter how many triggers pile up meanwhile.
pub struct RecheckScheduler {
    trigger_tx: mpsc::Sender<Trigger>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RecheckScheduler {
    /// Spawns the scheduling loop. `job` runs on the blocking pool and is
    /// expected to poll its token between transactions.
    pub fn start<J>(pool: &'static str, job: J) -> Self
    where
        J: Fn(&CancellationToken) + Send + Sync + 'static,
    {
        let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_CHANNEL_SIZE);
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(run_scheduler_loop(
            pool,
            Arc::new(job),
            trigger_rx,
            shutdown.clone(),
        ));
        Self {
            trigger_tx,
            shutdown,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Requests a recheck without waiting for it. A full trigger buffer means
    /// a follow-up run is already on the way, so the request is dropped.
    pub fn trigger(&self) {
        let _ = self.trigger_tx.try_send(Trigger { done: None });
    }

    /// Requests a recheck and resolves once the scheduled run has finished.
    /// The run is guaranteed to have started no earlier than this call.
    /// Returns immediately after shutdown.
    pub async fn trigger_and_wait(&self) {
        let (done, finished) = oneshot::channel();
        if self
            .trigger_tx
            .send(Trigger { done: Some(done) })
            .await
            .is_err()
        {
            return;
        }
        let _ = finished.await;
    }

    /// Stops the loop, waiting for an in-flight run to wind down first.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                error!(?err, "recheck scheduler worker failed");
            }
        }
    }
}

struct Inflight {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
    waiters: Vec<oneshot::Sender<()>>,
}

async fn run_scheduler_loop(
    pool: &'static str,
    job: Arc<dyn Fn(&CancellationToken) + Send + Sync>,
    mut trigger_rx: mpsc::Receiver<Trigger>,
    shutdown: CancellationToken,
) {
    let mut inflight: Option<Inflight> = None;
    // waiters of the run that is requested but not launched yet
    let mut queued: Option<Vec<oneshot::Sender<()>>> = None;

    loop {
        if inflight.is_none() {
            if let Some(waiters) = queued.take() {
                let cancel = shutdown.child_token();
                let run_cancel = cancel.clone();
                let job = Arc::clone(&job);
                debug!(pool, "launching recheck run");
                let handle = tokio::task::spawn_blocking(move || job(&run_cancel));
                inflight = Some(Inflight {
                    handle,
                    cancel,
                    waiters,
                });
            }
        }

        tokio::select! {
            Some(trigger) = trigger_rx.recv() => {
                if let Some(run) = &inflight {
                    debug!(pool, "preempting in-flight recheck");
                    run.cancel.cancel();
                }
                let waiters = queued.get_or_insert_with(Vec::new);
                if let Some(done) = trigger.done {
                    waiters.push(done);
                }
            }
            result = join_inflight(&mut inflight) => {
                if let Err(err) = result {
                    error!(pool, ?err, "recheck run failed");
                }
                if let Some(run) = inflight.take() {
                    for done in run.waiters {
                        let _ = done.send(());
                    }
                }
            }
            _ = shutdown.cancelled() => {
                info!(pool, "shutting down recheck scheduler");
                if let Some(mut run) = inflight.take() {
                    run.cancel.cancel();
                    if let Err(err) = (&mut run.handle).await {
                        error!(pool, ?err, "recheck run failed");
                    }
                    for done in run.waiters {
                        let _ = done.send(());
                    }
                }
                if let Some(waiters) = queued.take() {
                    for done in waiters {
                        let _ = done.send(());
                    }
                }
                return;
            }
        }
    }
}

async fn join_inflight(inflight: &mut Option<Inflight>) -> Result<(), tokio::task::JoinError> {
    match inflight.as_mut() {
        Some(run) => (&mut run.handle).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_trigger_and_wait_runs_once_each() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let scheduler = RecheckScheduler::start("test", move |_cancel| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        scheduler.trigger_and_wait().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        scheduler.trigger_and_wait().await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        scheduler.close().await;
    }

    #[tokio::test]
    async fn test_burst_coalesces_into_follow_up() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let scheduler = RecheckScheduler::start("test", move |_cancel| {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(30));
        });

        for _ in 0..5 {
            scheduler.trigger();
        }
        scheduler.trigger_and_wait().await;

        // the burst becomes one run plus at most two follow-ups, never five
        let total = runs.load(Ordering::SeqCst);
        assert!((1..=3).contains(&total), "got {total} runs");
        scheduler.close().await;
    }

    #[tokio::test]
    async fn test_preemption_cancels_inflight_run() {
        let cancelled = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&cancelled);
        let scheduler = RecheckScheduler::start("test", move |cancel| {
            for _ in 0..200 {
                if cancel.is_cancelled() {
                    seen.fetch_add(1, Ordering::SeqCst);
                    return;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        });

        scheduler.trigger();
        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.trigger_and_wait().await;
        assert!(cancelled.load(Ordering::SeqCst) >= 1);
        scheduler.close().await;
    }

    #[tokio::test]
    async fn test_close_waits_for_inflight() {
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&finished);
        let scheduler = RecheckScheduler::start("test", move |_cancel| {
            std::thread::sleep(Duration::from_millis(20));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        scheduler.trigger();
        tokio::time::sleep(Duration::from_millis(5)).await;
        scheduler.close().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);

        // waiting after shutdown resolves immediately
        scheduler.trigger_and_wait().await;
    }
}
