use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use lazyscale_core::status::QueueStatus;
use lazyscale_events::{Callback, Emitter, SubscriptionId};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::driver;

/// Future produced by a task. An `Err` is logged and counted as completed.
pub type TaskFuture = BoxFuture<'static, anyhow::Result<()>>;

/// A zero-argument async closure.
pub type Task = Box<dyn FnOnce() -> TaskFuture + Send>;

/// Handle identifying one queued item, returned by [`TaskQueue::add`].
///
/// Priority is not identity: two items with the same task body and
/// priority still receive distinct ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

/// Queue tuning.
#[derive(Debug, Clone, Default)]
pub struct QueueConfig {
    /// Upper bound on a single job's run time. `None` (the default) lets a
    /// hung job stall the queue indefinitely.
    pub job_timeout: Option<Duration>,
}

pub(crate) struct QueueItem {
    pub(crate) id: TaskId,
    pub(crate) priority: i32,
    pub(crate) task: Task,
}

struct QueueState {
    pending: Vec<QueueItem>,
    status: QueueStatus,
    running: bool,
    /// Bumped by `clear()`, so that the in-flight job's completion is not
    /// counted against the reset counters.
    epoch: u64,
    next_id: u64,
}

pub(crate) struct Shared {
    state: Mutex<QueueState>,
    /// Serialises "mutate + emit" so observers see snapshots in order.
    emit_gate: Mutex<()>,
    emitter: Emitter<QueueStatus>,
    idle: Notify,
    pub(crate) config: QueueConfig,
}

pub(crate) enum DriverMessage {
    Wake,
}

impl Shared {
    /// Apply `f` to the state, then emit the new snapshot if `f` reports a
    /// change. Status callbacks run outside the state lock.
    fn mutate<R>(&self, f: impl FnOnce(&mut QueueState) -> (R, bool)) -> R {
        let _gate = lock(&self.emit_gate);
        let (result, snapshot) = {
            let mut state = lock(&self.state);
            let (result, changed) = f(&mut state);
            (result, changed.then_some(state.status))
        };
        if let Some(snapshot) = snapshot {
            self.emitter.emit(&snapshot);
        }
        result
    }

    /// Dequeue the next item and mark it running.
    pub(crate) fn begin_next(&self) -> Option<(QueueItem, u64)> {
        self.mutate(|state| {
            if state.running {
                return (None, false);
            }
            let Some(idx) = next_index(&state.pending) else {
                return (None, false);
            };
            let item = state.pending.remove(idx);
            state.running = true;
            state.status.processing = 1;
            (Some((item, state.epoch)), true)
        })
    }

    /// Mark the running item finished.
    pub(crate) fn finish(&self, epoch: u64) {
        self.mutate(|state| {
            state.running = false;
            if state.epoch != epoch {
                return ((), false);
            }
            state.status.processing = 0;
            state.status.completed += 1;
            ((), true)
        });
        self.notify_if_idle();
    }

    pub(crate) fn notify_if_idle(&self) {
        if self.is_idle() {
            self.idle.notify_waiters();
        }
    }

    fn is_idle(&self) -> bool {
        let state = lock(&self.state);
        state.pending.is_empty() && !state.running
    }
}

/// Index of the highest-priority item; the earliest-inserted wins ties.
fn next_index(pending: &[QueueItem]) -> Option<usize> {
    let mut best: Option<(usize, i32)> = None;
    for (idx, item) in pending.iter().enumerate() {
        match best {
            Some((_, priority)) if item.priority <= priority => {}
            _ => best = Some((idx, item.priority)),
        }
    }
    best.map(|(idx, _)| idx)
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Priority-ordered, single-concurrency async job runner.
///
/// Must be created inside a Tokio runtime; the driver task is spawned on
/// construction and stops when the queue is shut down or dropped.
///
/// Status callbacks registered through [`TaskQueue::on_status_update`] run
/// synchronously inside the mutating call and must not mutate the queue.
pub struct TaskQueue {
    shared: Arc<Shared>,
    wake_tx: mpsc::UnboundedSender<DriverMessage>,
    cancel: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    pub fn with_config(config: QueueConfig) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                pending: Vec::new(),
                status: QueueStatus::default(),
                running: false,
                epoch: 0,
                next_id: 0,
            }),
            emit_gate: Mutex::new(()),
            emitter: Emitter::new(),
            idle: Notify::new(),
            config,
        });
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(driver::run(Arc::clone(&shared), wake_rx, cancel.clone()));

        Self {
            shared,
            wake_tx,
            cancel,
            driver: Mutex::new(Some(handle)),
        }
    }

    /// Enqueue a task. Never blocks on the task itself.
    pub fn add<F, Fut>(&self, task: F, priority: i32) -> TaskId
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_boxed(Box::new(move || task().boxed()), priority)
    }

    /// Enqueue an already boxed task.
    pub fn add_boxed(&self, task: Task, priority: i32) -> TaskId {
        let id = self.shared.mutate(|state| {
            let id = TaskId(state.next_id);
            state.next_id += 1;
            state.pending.push(QueueItem { id, priority, task });
            state.status.total += 1;
            (id, true)
        });

        if self.wake_tx.send(DriverMessage::Wake).is_err() {
            tracing::warn!(task_id = id.0, "Task added after queue shutdown; it will not run");
        }
        id
    }

    /// Remove a pending item by handle. No-op if it already started or is
    /// unknown. Returns whether an item was removed.
    pub fn remove(&self, id: TaskId) -> bool {
        self.shared.mutate(|state| {
            match state.pending.iter().position(|item| item.id == id) {
                Some(idx) => {
                    state.pending.remove(idx);
                    state.status.total = state.status.total.saturating_sub(1);
                    (true, true)
                }
                None => (false, false),
            }
        })
    }

    /// Discard every pending item and reset the counters.
    ///
    /// A job that is already executing keeps running to completion, but its
    /// completion is not counted.
    pub fn clear(&self) {
        let dropped = self.shared.mutate(|state| {
            let dropped = state.pending.len();
            state.pending.clear();
            state.status = QueueStatus::default();
            state.epoch += 1;
            (dropped, true)
        });
        tracing::debug!(dropped, "Task queue cleared");
        self.shared.notify_if_idle();
    }

    pub fn status(&self) -> QueueStatus {
        lock(&self.shared.state).status
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.shared.state).pending.len()
    }

    pub fn is_idle(&self) -> bool {
        self.shared.is_idle()
    }

    pub fn on_status_update(&self, callback: Callback<QueueStatus>) -> SubscriptionId {
        self.shared.emitter.on(callback)
    }

    pub fn off_status_update(&self, id: SubscriptionId) -> bool {
        self.shared.emitter.off(id)
    }

    /// Resolve once nothing is pending and nothing is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Stop the driver after the in-flight job (if any) finishes.
    ///
    /// Pending items are left unexecuted.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = lock(&self.driver).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Task queue driver panicked");
            }
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
