//! Delivery dispatcher.
//!
//! A single serialized worker that runs receipt-delivery jobs off the
//! transport callback path. At most [`DISPATCH_UPPER_BOUND`] submissions may
//! be outstanding; further submissions are skipped. Skipping is lossless for
//! receipt delivery because every job drains the acknowledgement queue, which
//! still holds every event the skipped job would have handled.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{self, JoinHandle};

use crate::lock::lock_ignore_poison;
use crate::macros::{log_debug, log_error};
use crate::{Result, DISPATCH_UPPER_BOUND};

/// Unit of work run on the dispatch worker.
pub(crate) type DispatchJob = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

type Submission = (DispatchJob, OwnedSemaphorePermit);

enum State {
    // ---
    Idle,
    Running {
        tx: mpsc::UnboundedSender<Submission>,
        worker: JoinHandle<()>,
    },
    Shutdown,
}

pub(crate) struct DeliveryDispatcher {
    // ---
    name: String,
    permits: Arc<Semaphore>,
    state: Mutex<State>,
}

impl DeliveryDispatcher {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_upper_bound(name, DISPATCH_UPPER_BOUND)
    }

    pub fn with_upper_bound(name: impl Into<String>, upper_bound: usize) -> Self {
        // ---
        Self {
            name: name.into(),
            permits: Arc::new(Semaphore::new(upper_bound)),
            state: Mutex::new(State::Idle),
        }
    }

    /// Spawn the worker task if it is not running yet.
    ///
    /// Must be called from within a tokio runtime. Has no effect after
    /// [`shutdown`](Self::shutdown).
    pub fn start(&self) {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        if !matches!(*state, State::Idle) {
            return;
        }

        log_debug!("{}: starting delivery dispatcher", self.name);

        let (tx, mut rx) = mpsc::unbounded_channel::<Submission>();
        let name = self.name.clone();

        // jobs call user listeners, which may block: one at a time on the
        // blocking pool, awaited in submission order
        let worker = tokio::spawn(async move {
            while let Some((job, permit)) = rx.recv().await {
                let job_name = name.clone();
                if let Err(_err) = task::spawn_blocking(move || run_isolated(&job_name, job)).await {
                    log_error!("{name}: dispatch job aborted: {_err}");
                }
                drop(permit);
            }
            log_debug!("{name}: delivery dispatcher stopped");
        });

        *state = State::Running { tx, worker };
    }

    pub fn is_running(&self) -> bool {
        matches!(*lock_ignore_poison(&self.state), State::Running { .. })
    }

    /// Submit a job.
    ///
    /// Returns `false` when the job was skipped: the dispatcher is not
    /// running, or the bound on outstanding submissions is reached.
    pub fn dispatch(&self, job: DispatchJob) -> bool {
        // ---
        let state = lock_ignore_poison(&self.state);
        let State::Running { tx, .. } = &*state else {
            log_debug!("{}: dispatcher not running, submission skipped", self.name);
            return false;
        };

        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                log_debug!(
                    "{}: {DISPATCH_UPPER_BOUND} submissions outstanding, submission skipped",
                    self.name
                );
                return false;
            }
        };

        if tx.send((job, permit)).is_err() {
            log_debug!("{}: dispatcher worker gone, submission skipped", self.name);
            return false;
        }
        true
    }

    /// Stop accepting submissions.
    ///
    /// With `wait`, returns once every already accepted job has run.
    /// Idempotent.
    pub async fn shutdown(&self, wait: bool) {
        // ---
        let previous = std::mem::replace(&mut *lock_ignore_poison(&self.state), State::Shutdown);

        // dropping the sender lets the worker finish the backlog and exit
        if let State::Running { tx, worker } = previous {
            drop(tx);
            if wait {
                if let Err(_err) = worker.await {
                    log_error!("{}: dispatcher worker failed: {_err}", self.name);
                }
            }
        }
    }
}

fn run_isolated(_name: &str, job: DispatchJob) {
    // ---
    match panic::catch_unwind(AssertUnwindSafe(job)) {
        Ok(Ok(())) => {}
        Ok(Err(_err)) => log_error!("{_name}: dispatch job failed: {_err}"),
        Err(_) => log_error!("{_name}: dispatch job panicked"),
    }
}
