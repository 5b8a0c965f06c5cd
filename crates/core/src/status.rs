//! Queue status snapshots and the job lifecycle.

use serde::{Deserialize, Serialize};

/// Immutable snapshot of the task queue counters.
///
/// `total` and `completed` only grow between two `clear()` calls;
/// `processing` is either 0 or 1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Items ever enqueued since the last reset (minus explicit removals).
    pub total: usize,
    /// 1 while a job is running, 0 otherwise.
    pub processing: usize,
    /// Items that finished, successfully or not.
    pub completed: usize,
}

impl QueueStatus {
    /// Items that were added but have neither started nor finished.
    pub fn pending(&self) -> usize {
        self.total
            .saturating_sub(self.completed)
            .saturating_sub(self.processing)
    }
}

/// Lifecycle of one job, from discovery to a terminal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Discovered,
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Transitions are one-way: a state may only move forward.
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Discovered, JobState::Queued)
                | (JobState::Queued, JobState::Processing)
                | (JobState::Processing, JobState::Completed)
                | (JobState::Processing, JobState::Failed)
        )
    }
}
