use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::config::QueueConfig;
use crate::error::MempoolError;

pub type InsertResult = Result<(), MempoolError>;

struct Item<T> {
    payload: T,
    done: oneshot::Sender<InsertResult>,
}

struct State<T> {
    items: VecDeque<Item<T>>,
    closed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    depth: usize,
}

impl<T> Shared<T> {
    fn lock(&self) -> std::sync::MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded submission buffer in front of a pool. Producers enqueue from any
/// task and get a receiver that resolves once the single worker has pushed
/// the transaction through the pool's insert path.
pub struct AdmissionQueue<T> {
    shared: Arc<Shared<T>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> AdmissionQueue<T> {
    /// Spawns the worker draining this queue into `insert`. `insert` gets
    /// batches in submission order and must return one result per item.
    pub fn start<F>(config: &QueueConfig, insert: F) -> Self
    where
        F: FnMut(Vec<T>) -> Vec<InsertResult> + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                items: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            depth: config.depth,
        });
        let batch = config.batch.max(1);
        let worker = tokio::spawn(worker_loop(Arc::clone(&shared), batch, insert));
        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Never blocks. When the queue is full or closed the returned receiver
    /// already holds the refusal.
    pub fn push(&self, payload: T) -> oneshot::Receiver<InsertResult> {
        let (done, rx) = oneshot::channel();
        let mut state = self.shared.lock();
        if state.closed {
            let _ = done.send(Err(MempoolError::Closed));
            return rx;
        }
        if state.items.len() >= self.shared.depth {
            debug!("admission queue full");
            let _ = done.send(Err(MempoolError::QueueFull));
            return rx;
        }
        state.items.push_back(Item { payload, done });
        drop(state);
        self.shared.notify.notify_one();
        rx
    }

    pub fn len(&self) -> usize {
        self.shared.lock().items.len()
    }

    /// Stops accepting submissions, waits for the worker to drain what is
    /// already queued and resolves anything left over as closed.
    pub async fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.notify.notify_one();

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                error!(?err, "admission queue worker failed");
            }
        }

        let leftovers: Vec<_> = self.shared.lock().items.drain(..).collect();
        for item in leftovers {
            let _ = item.done.send(Err(MempoolError::Closed));
        }
    }
}

async fn worker_loop<T, F>(shared: Arc<Shared<T>>, batch: usize, mut insert: F)
where
    F: FnMut(Vec<T>) -> Vec<InsertResult>,
{
    loop {
        let (items, closed) = {
            let mut state = shared.lock();
            let take = state.items.len().min(batch);
            let items: Vec<_> = state.items.drain(..take).collect();
            (items, state.closed)
        };

        if items.is_empty() {
            if closed {
                return;
            }
            shared.notify.notified().await;
            continue;
        }

        let mut payloads = Vec::with_capacity(items.len());
        let mut dones = Vec::with_capacity(items.len());
        for item in items {
            payloads.push(item.payload);
            dones.push(item.done);
        }

        let count = payloads.len();
        let results = insert(payloads);
        if results.len() != count {
            panic!(
                "admission batch returned {} results for {} items",
                results.len(),
                count
            );
        }

        for (done, result) in dones.into_iter().zip(results) {
            let _ = done.send(result);
        }
    }
}
