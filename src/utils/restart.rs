//! Cooperative scheduling of a component's background work.
//!
//! Every component that has background work (retries, renewals, probes,
//! draining of incoming messages) owns a [`Restart`]. The handle spawns a
//! single Tokio task that runs the component whenever it is asked to, so
//! two runs of the same component never overlap. A run is requested either
//! right away via [`Restart::restart`] or no sooner than a delay via
//! [`Restart::schedule`]. Requests are merged: the earliest pending due
//! time wins and a run consumes all requests made before it started.
//!
//! The task only holds a weak reference to the component. It ends when the
//! handle is dropped or the component is gone.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

//------------ Restart -------------------------------------------------------

/// Handle for requesting runs of a component's background task.
#[derive(Debug)]
pub struct Restart {
    /// State shared with the spawned task.
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    /// A label for log output.
    name: &'static str,

    /// When the next run is due.
    state: Mutex<State>,

    /// Wakes the task when the due time moved or the handle was closed.
    notify: Notify,
}

#[derive(Debug, Default)]
struct State {
    /// The earliest requested run, if any.
    due: Option<Instant>,

    /// The handle has been dropped.
    closed: bool,
}

impl Restart {
    /// Spawns the background task for `target`.
    ///
    /// Each run upgrades the weak reference and calls `run` with it. This
    /// must be called from within a Tokio runtime.
    pub fn spawn<T, F, Fut>(name: &'static str, target: Weak<T>, run: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(Arc<T>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let shared = Arc::new(Shared {
            name,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        });
        tokio::spawn(Self::run_loop(shared.clone(), target, run));
        Self { shared }
    }

    /// Requests a run as soon as possible.
    pub fn restart(&self) {
        self.schedule(Duration::ZERO)
    }

    /// Requests a run no sooner than `delay` from now.
    ///
    /// If an earlier run is already pending, this is a no-op.
    pub fn schedule(&self, delay: Duration) {
        self.schedule_at(Instant::now() + delay)
    }

    /// Requests a run no sooner than `due`.
    pub fn schedule_at(&self, due: Instant) {
        {
            let mut state = self.shared.state.lock();
            match state.due {
                Some(current) if current <= due => return,
                _ => state.due = Some(due),
            }
        }
        self.shared.notify.notify_one();
    }

    /// Returns when the next run is due, if one is pending.
    pub fn due(&self) -> Option<Instant> {
        self.shared.state.lock().due
    }

    /// The task loop.
    async fn run_loop<T, F, Fut>(shared: Arc<Shared>, target: Weak<T>, run: F)
    where
        T: Send + Sync + 'static,
        F: Fn(Arc<T>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        loop {
            let due = {
                let state = shared.state.lock();
                if state.closed {
                    break;
                }
                state.due
            };
            match due {
                None => shared.notify.notified().await,
                Some(due) if due > Instant::now() => {
                    tokio::select! {
                        _ = sleep_until(due) => {}
                        _ = shared.notify.notified() => {}
                    }
                }
                Some(_) => {
                    shared.state.lock().due = None;
                    let Some(target) = target.upgrade() else {
                        break;
                    };
                    trace!("{}: running", shared.name);
                    run(target).await;
                }
            }
        }
        trace!("{}: background task finished", shared.name);
    }
}

impl Drop for Restart {
    fn drop(&mut self) {
        self.shared.state.lock().closed = true;
        self.shared.notify.notify_one();
    }
}

//============ Testing =======================================================
