use crate::{error::TaskError, id::PaneScope, watcher::panic_message};
use chartsync_integration::{
    LinkFuture, LinkTask, Spawner,
    error::{ChannelError, TransportError},
};
use fnv::FnvHashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use smol_str::SmolStr;
use std::{
    collections::VecDeque,
    fmt::Display,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{oneshot, watch},
    task::{AbortHandle, JoinHandle},
};
use tracing::{debug, info, warn};

/// Number of failed tasks retained for inspection.
pub const RECENT_FAILURE_CAPACITY: usize = 64;

/// Tracks every asynchronous unit of work launched by the compute process, so shutdown can
/// wait for outstanding work instead of racing it.
///
/// Every tracked task is removed from the set when it finishes, whatever the outcome.
/// Failures are logged and retained in a bounded list; they never propagate into unrelated
/// code. [`drain`](Self::drain) is the shutdown barrier: after it returns nothing tracked is
/// still running.
#[derive(Debug, Clone, Default)]
pub struct Emitter {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    tasks: Mutex<FnvHashMap<u64, TaskEntry>>,
    active: watch::Sender<usize>,
    next_id: AtomicU64,
    completed: AtomicU64,
    closed: AtomicBool,
    failures: Mutex<VecDeque<TaskFailure>>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            tasks: Mutex::new(FnvHashMap::default()),
            active: watch::Sender::new(0),
            next_id: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            failures: Mutex::new(VecDeque::with_capacity(RECENT_FAILURE_CAPACITY)),
        }
    }
}

#[derive(Debug)]
struct TaskEntry {
    label: SmolStr,
    scope: Option<PaneScope>,
    abort: AbortHandle,
}

/// Record of a tracked task that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub id: u64,
    pub scope: Option<PaneScope>,
    pub error: TaskError,
}

/// Outcome of [`Emitter::drain`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct DrainReport {
    /// Tasks that finished on their own while draining.
    pub completed: u64,
    /// Tasks still outstanding at the timeout, forcibly cancelled.
    pub cancelled: usize,
}

/// Handle to a tracked task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    id: u64,
    label: SmolStr,
    handle: JoinHandle<Result<T, TaskError>>,
}

impl<T> TaskHandle<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &SmolStr {
        &self.label
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.handle.abort_handle()
    }

    /// Await the task outcome. A task cancelled by scope teardown or by
    /// [`Emitter::drain`] yields [`TaskError::Cancelled`].
    pub async fn join(self) -> Result<T, TaskError> {
        match self.handle.await {
            Ok(result) => result,
            Err(error) if error.is_cancelled() => Err(TaskError::Cancelled { label: self.label }),
            Err(error) => Err(TaskError::Panicked {
                label: self.label,
                message: error.to_string(),
            }),
        }
    }
}

/// Removes a task from the tracked set when its future completes or is dropped.
struct Completion {
    inner: Arc<Inner>,
    id: u64,
    label: SmolStr,
    scope: Option<PaneScope>,
    finished: bool,
}

impl Completion {
    fn succeeded(&mut self) {
        self.finished = true;
    }

    fn failed(&mut self, error: TaskError) -> TaskError {
        self.finished = true;
        warn!(
            task = self.id,
            label = %self.label,
            scope = ?self.scope,
            %error,
            "tracked task failed"
        );
        self.inner.record_failure(TaskFailure {
            id: self.id,
            scope: self.scope.clone(),
            error: error.clone(),
        });
        error
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        let removed = self.inner.remove(self.id);
        if removed && self.finished {
            self.inner.completed.fetch_add(1, Ordering::Relaxed);
        } else if removed {
            debug!(task = self.id, label = %self.label, "tracked task dropped before completion");
        }
    }
}

impl Inner {
    fn remove(&self, id: u64) -> bool {
        let mut tasks = self.tasks.lock();
        let removed = tasks.remove(&id).is_some();
        self.active.send_replace(tasks.len());
        removed
    }

    fn record_failure(&self, failure: TaskFailure) {
        let mut failures = self.failures.lock();
        if failures.len() == RECENT_FAILURE_CAPACITY {
            failures.pop_front();
        }
        failures.push_back(failure);
    }

    /// Remove matching entries from the tracked set, abort them, and record the
    /// cancellations. Returns the number cancelled.
    fn cancel_where(&self, reason: &str, predicate: impl Fn(&TaskEntry) -> bool) -> usize {
        let cancelled: Vec<(u64, TaskEntry)> = {
            let mut tasks = self.tasks.lock();
            let ids: Vec<u64> = tasks
                .iter()
                .filter(|(_, entry)| predicate(entry))
                .map(|(id, _)| *id)
                .collect();
            let cancelled = ids
                .into_iter()
                .filter_map(|id| tasks.remove(&id).map(|entry| (id, entry)))
                .collect();
            self.active.send_replace(tasks.len());
            cancelled
        };

        for (id, entry) in &cancelled {
            entry.abort.abort();
            info!(
                task = id,
                label = %entry.label,
                scope = ?entry.scope,
                reason,
                "cancelled tracked task"
            );
            self.record_failure(TaskFailure {
                id: *id,
                scope: entry.scope.clone(),
                error: TaskError::Cancelled {
                    label: entry.label.clone(),
                },
            });
        }
        cancelled.len()
    }
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `future` as a tracked task, optionally scoped to the pane whose objects it
    /// touches.
    pub fn launch<F, T, E>(
        &self,
        label: impl Into<SmolStr>,
        scope: Option<PaneScope>,
        future: F,
    ) -> Result<TaskHandle<T>, TaskError>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
    {
        if self.is_closed() {
            return Err(TaskError::Closed);
        }

        let label = label.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut completion = Completion {
            inner: Arc::clone(&self.inner),
            id,
            label: label.clone(),
            scope: scope.clone(),
            finished: false,
        };

        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let task_label = label.clone();
        let handle = tokio::spawn(async move {
            // Hold back until tracked, so completion always finds the entry
            let _ = registered_rx.await;

            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(value)) => {
                    completion.succeeded();
                    Ok(value)
                }
                Ok(Err(error)) => Err(completion.failed(TaskError::Failed {
                    label: task_label,
                    message: error.to_string(),
                })),
                Err(payload) => Err(completion.failed(TaskError::Panicked {
                    label: task_label,
                    message: panic_message(payload.as_ref()),
                })),
            }
        });

        {
            let mut tasks = self.inner.tasks.lock();
            tasks.insert(
                id,
                TaskEntry {
                    label: label.clone(),
                    scope,
                    abort: handle.abort_handle(),
                },
            );
            self.inner.active.send_replace(tasks.len());
        }
        let _ = registered_tx.send(());

        debug!(task = id, %label, "launched tracked task");
        Ok(TaskHandle { id, label, handle })
    }

    /// Run CPU heavy `job` on the blocking pool as a tracked task.
    ///
    /// Cancelling the task stops its result from being delivered; the blocking job itself
    /// runs to completion and its output is discarded.
    pub fn offload<J, T>(
        &self,
        label: impl Into<SmolStr>,
        scope: Option<PaneScope>,
        job: J,
    ) -> Result<TaskHandle<T>, TaskError>
    where
        J: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.launch(label, scope, async move { tokio::task::spawn_blocking(job).await })
    }

    /// Number of tracked tasks still running.
    pub fn active(&self) -> usize {
        *self.inner.active.borrow()
    }

    /// Labels of tracked tasks still running, sorted.
    pub fn labels(&self) -> Vec<SmolStr> {
        let mut labels: Vec<_> = self
            .inner
            .tasks
            .lock()
            .values()
            .map(|entry| entry.label.clone())
            .collect();
        labels.sort();
        labels
    }

    /// Most recent failures, oldest first.
    pub fn recent_failures(&self) -> Vec<TaskFailure> {
        self.inner.failures.lock().iter().cloned().collect()
    }

    /// Cancel every tracked task scoped to `scope`. A cancelled task never delivers its
    /// result.
    pub fn cancel_scope(&self, scope: &PaneScope) -> usize {
        self.inner
            .cancel_where("scope teardown", |entry| entry.scope.as_ref() == Some(scope))
    }

    /// Reject further launches with [`TaskError::Closed`].
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            debug!(active = self.active(), "emitter closed to new tasks");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Wait until every tracked task has finished or `timeout` elapses. Tasks still running
    /// at the timeout are cancelled and logged.
    pub async fn drain(&self, timeout: Duration) -> DrainReport {
        let completed_before = self.inner.completed.load(Ordering::Relaxed);
        let mut active = self.inner.active.subscribe();

        let drained = tokio::time::timeout(timeout, active.wait_for(|count| *count == 0))
            .await
            .is_ok();

        let cancelled = if drained {
            0
        } else {
            self.inner.cancel_where("drain timeout", |_| true)
        };

        let report = DrainReport {
            completed: self
                .inner
                .completed
                .load(Ordering::Relaxed)
                .saturating_sub(completed_before),
            cancelled,
        };

        if cancelled > 0 {
            warn!(?report, timeout_ms = timeout.as_millis() as u64, "emitter drain timed out");
        } else {
            debug!(?report, "emitter drained");
        }
        report
    }

    /// [`close`](Self::close) then [`drain`](Self::drain).
    pub async fn shutdown(&self, timeout: Duration) -> DrainReport {
        self.close();
        self.drain(timeout).await
    }
}

/// Forward channel writer and reader run as unscoped tracked tasks, so a drain accounts for
/// socket writes too.
impl Spawner for Emitter {
    fn spawn(&self, label: &'static str, task: LinkFuture) -> Result<LinkTask, ChannelError> {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let handle = self
            .launch(label, None, async move {
                let result = task.await;
                let _ = outcome_tx.send(result.clone());
                result
            })
            .map_err(|_| ChannelError::ChannelClosed)?;
        let abort = handle.abort_handle();

        let join = async move {
            let joined = handle.join().await;
            match (outcome_rx.await, joined) {
                (Ok(result), _) => result,
                (Err(_), Err(TaskError::Panicked { label, message })) => Err(
                    ChannelError::Transport(TransportError::Closed(format!(
                        "{label} panicked: {message}"
                    ))),
                ),
                // Cancelled before finishing
                (Err(_), _) => Ok(()),
            }
        };
        Ok(LinkTask::new(join.boxed(), abort))
    }
}
