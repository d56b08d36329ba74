use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy)]
struct Mark {
    height: u64,
    done: bool,
}

struct State<S> {
    height: u64,
    store: Arc<S>,
}

/// Couples a per-height store with the recheck run that fills it. Writers
/// bracket a rebuild with [`HeightSync::start_new_height`] and
/// [`HeightSync::end_current_height`]; readers ask for the store of a
/// specific height and wait until that rebuild has finished.
pub struct HeightSync<S> {
    state: Mutex<State<S>>,
    mark: watch::Sender<Mark>,
}

impl<S: Default> HeightSync<S> {
    /// Starts at `height` with an empty store considered complete.
    pub fn new(height: u64) -> Self {
        let (mark, _) = watch::channel(Mark { height, done: true });
        Self {
            state: Mutex::new(State {
                height,
                store: Arc::new(S::default()),
            }),
            mark,
        }
    }

    /// Swaps in a fresh store for `height` and returns it.
    ///
    /// Panics if the previous height was never ended.
    pub fn start_new_height(&self, height: u64) -> Arc<S> {
        let mut state = self.lock();
        let mark = *self.mark.borrow();
        if !mark.done {
            panic!("height {height} started while {} is still in progress", mark.height);
        }
        let store = Arc::new(S::default());
        state.height = height;
        state.store = Arc::clone(&store);
        self.mark.send_replace(Mark {
            height,
            done: false,
        });
        store
    }

    /// Marks the current height complete.
    ///
    /// Panics if it already is.
    pub fn end_current_height(&self) {
        let _state = self.lock();
        let mark = *self.mark.borrow();
        if mark.done {
            panic!("height {} ended twice", mark.height);
        }
        self.mark.send_replace(Mark { done: true, ..mark });
    }

    /// Store of the height currently being filled, or the finished one when
    /// idle. In-place pool updates go through this.
    pub fn current(&self) -> Arc<S> {
        Arc::clone(&self.lock().store)
    }

    pub fn height(&self) -> u64 {
        self.mark.borrow().height
    }

    /// Resolves once the rebuild for `height` completes. After `wait` an
    /// in-progress store for that height is returned as is; `None` means the
    /// rebuild never started.
    ///
    /// Panics if `height` is already in the past.
    pub async fn store_at(&self, height: u64, wait: Duration) -> Option<Arc<S>> {
        {
            let state = self.lock();
            let mark = *self.mark.borrow();
            assert!(
                mark.height <= height,
                "store for height {height} requested at {}",
                mark.height
            );
            if mark.height == height && mark.done {
                return Some(Arc::clone(&state.store));
            }
        }

        let mut rx = self.mark.subscribe();
        let reached = rx.wait_for(|mark| mark.height > height || (mark.height == height && mark.done));
        let store = match tokio::time::timeout(wait, reached).await {
            Ok(Ok(_)) => {
                let state = self.lock();
                assert!(
                    state.height <= height,
                    "store for height {height} requested at {}",
                    state.height
                );
                Some(Arc::clone(&state.store))
            }
            Ok(Err(_)) => None,
            Err(_) => {
                let state = self.lock();
                let mark = *self.mark.borrow();
                (mark.height == height).then(|| Arc::clone(&state.store))
            }
        };
        store
    }

    fn lock(&self) -> MutexGuard<'_, State<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
