//! The queue's sequential driver task.
//!
//! Woken through an unbounded channel whenever an item is added, the driver
//! drains the pending set one item at a time. It is the only code path that
//! dequeues, which is what bounds concurrency to one.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::queue::{DriverMessage, QueueItem, Shared};

/// How a single job ended. All four count as "completed".
#[derive(Debug)]
enum Outcome {
    Succeeded,
    Failed(anyhow::Error),
    Panicked(String),
    TimedOut(Duration),
}

/// Run until cancelled or until every queue handle is dropped.
pub(crate) async fn run(
    shared: Arc<Shared>,
    mut wake_rx: mpsc::UnboundedReceiver<DriverMessage>,
    cancel: CancellationToken,
) {
    tracing::debug!("Task queue driver started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = wake_rx.recv() => match msg {
                Some(DriverMessage::Wake) => {}
                None => break,
            },
        }

        drain(&shared, &cancel).await;
    }

    tracing::debug!("Task queue driver stopped");
}

/// Process items until the pending set is empty.
async fn drain(shared: &Shared, cancel: &CancellationToken) {
    while let Some((item, epoch)) = shared.begin_next() {
        let started = Instant::now();
        let priority = item.priority;
        let outcome = execute(item, shared.config.job_timeout).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &outcome {
            Outcome::Succeeded => {
                tracing::debug!(priority, elapsed_ms, "Queue job finished");
            }
            Outcome::Failed(e) => {
                tracing::warn!(priority, elapsed_ms, error = %e, "Queue job returned an error");
            }
            Outcome::Panicked(msg) => {
                tracing::error!(priority, elapsed_ms, error = %msg, "Queue job panicked");
            }
            Outcome::TimedOut(limit) => {
                tracing::warn!(
                    priority,
                    timeout_ms = limit.as_millis() as u64,
                    "Queue job timed out and was dropped",
                );
            }
        }

        shared.finish(epoch);

        if cancel.is_cancelled() {
            return;
        }
    }
    shared.notify_if_idle();
}

async fn execute(item: QueueItem, timeout: Option<Duration>) -> Outcome {
    let QueueItem { id, task, .. } = item;
    tracing::trace!(task_id = ?id, "Starting queue job");

    // Invoke the closure inside the future so a panic while building the
    // future is caught as well.
    let run = AssertUnwindSafe(async move { task().await }).catch_unwind();

    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, run).await {
            Ok(result) => result,
            Err(_) => return Outcome::TimedOut(limit),
        },
        None => run.await,
    };

    match result {
        Ok(Ok(())) => Outcome::Succeeded,
        Ok(Err(e)) => Outcome::Failed(e),
        Err(panic) => Outcome::Panicked(panic_message(panic.as_ref())),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "job panicked".to_string()
    }
}
