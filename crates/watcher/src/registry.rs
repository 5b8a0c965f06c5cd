//! Per-element lifecycle state, owned by the watcher.
//!
//! Each element gets an [`ElementRecord`] holding the four processing
//! markers, its phase and the current attempt's [`JobState`]. The markers
//! make discovery, enqueueing and swapping idempotent under repeated
//! mutation callbacks.

use std::collections::HashMap;

use lazyscale_core::status::JobState;
use lazyscale_core::types::{ElementId, Locator};
use lazyscale_queue::TaskId;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ElementMarkers {
    pub observed: bool,
    pub queued: bool,
    pub processed: bool,
    pub succeeded: bool,
}

/// `Unobserved -> Observed -> Queued -> Processing -> Swapped | Failed`,
/// with `Processing -> Queued` while retries remain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementPhase {
    Unobserved,
    Observed,
    Queued,
    Processing,
    Swapped,
    Failed,
}

impl ElementPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, ElementPhase::Swapped | ElementPhase::Failed)
    }

    /// Queued or running, including a retry waiting out its backoff.
    pub fn is_in_flight(self) -> bool {
        matches!(self, ElementPhase::Queued | ElementPhase::Processing)
    }
}

#[derive(Debug, Clone)]
pub struct ElementRecord {
    pub locator: Locator,
    pub markers: ElementMarkers,
    pub phase: ElementPhase,
    /// State of the current attempt; every retry starts a fresh job.
    pub job: JobState,
    pub attempts: u32,
    /// Queue handle while the attempt is pending.
    pub task: Option<TaskId>,
    /// Node that replaced this one, once swapped.
    pub replaced_by: Option<ElementId>,
}

impl ElementRecord {
    fn new(locator: Locator) -> Self {
        Self {
            locator,
            markers: ElementMarkers::default(),
            phase: ElementPhase::Unobserved,
            job: JobState::Discovered,
            attempts: 0,
            task: None,
            replaced_by: None,
        }
    }

    fn advance_job(&mut self, next: JobState, id: ElementId) {
        if !self.job.can_transition_to(next) {
            tracing::warn!(element_id = %id, from = ?self.job, to = ?next, "Unexpected job transition");
        }
        self.job = next;
    }
}

/// Counts of elements per phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySummary {
    pub observed: usize,
    pub queued: usize,
    pub processing: usize,
    pub swapped: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
pub struct ElementRegistry {
    records: HashMap<ElementId, ElementRecord>,
}

impl ElementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// First sighting of an eligible element. Returns `false` if it was
    /// already observed or is itself a processed replacement.
    pub fn mark_observed(&mut self, id: ElementId, locator: &str) -> bool {
        let record = self
            .records
            .entry(id)
            .or_insert_with(|| ElementRecord::new(locator.to_string()));
        if record.markers.observed || record.markers.processed {
            return false;
        }
        record.markers.observed = true;
        record.phase = ElementPhase::Observed;
        true
    }

    /// Claim the element for enqueueing. Only succeeds once per element.
    pub fn mark_queued(&mut self, id: ElementId) -> bool {
        let Some(record) = self.records.get_mut(&id) else {
            return false;
        };
        if !record.markers.observed || record.markers.queued {
            return false;
        }
        record.markers.queued = true;
        record.phase = ElementPhase::Queued;
        record.advance_job(JobState::Queued, id);
        true
    }

    /// Remember the queue handle of the pending attempt.
    pub fn set_task(&mut self, id: ElementId, task: TaskId) {
        if let Some(record) = self.records.get_mut(&id) {
            if record.phase == ElementPhase::Queued {
                record.task = Some(task);
            }
        }
    }

    /// The attempt started. Returns the 1-based attempt number, or `None`
    /// if the element is gone or not waiting to run.
    pub fn begin(&mut self, id: ElementId) -> Option<u32> {
        let record = self.records.get_mut(&id)?;
        if record.phase != ElementPhase::Queued {
            return None;
        }
        record.phase = ElementPhase::Processing;
        record.task = None;
        record.attempts += 1;
        record.advance_job(JobState::Processing, id);
        Some(record.attempts)
    }

    /// The original was replaced by `replacement`, which is recorded as
    /// already processed so it is never picked up again.
    pub fn mark_swapped(&mut self, id: ElementId, replacement: ElementId) {
        if let Some(record) = self.records.get_mut(&id) {
            record.markers.processed = true;
            record.markers.succeeded = true;
            record.phase = ElementPhase::Swapped;
            record.replaced_by = Some(replacement);
            record.advance_job(JobState::Completed, id);

            let mut successor = ElementRecord::new(record.locator.clone());
            successor.markers.processed = true;
            successor.markers.succeeded = true;
            successor.phase = ElementPhase::Swapped;
            successor.job = JobState::Completed;
            self.records.insert(replacement, successor);
        }
    }

    /// The attempt failed and another one will follow. Undoes a swap that
    /// was recorded before the document refused the replacement.
    pub fn mark_retrying(&mut self, id: ElementId) {
        if let Some(record) = self.records.get_mut(&id) {
            record.advance_job(JobState::Failed, id);
            record.markers.processed = false;
            record.markers.succeeded = false;
            record.replaced_by = None;
            record.phase = ElementPhase::Queued;
            record.job = JobState::Queued;
        }
    }

    /// Terminal failure. The `queued` marker stays set, so the element is
    /// not rediscovered.
    pub fn mark_failed(&mut self, id: ElementId) {
        if let Some(record) = self.records.get_mut(&id) {
            record.markers.processed = true;
            record.markers.succeeded = false;
            record.phase = ElementPhase::Failed;
            record.task = None;
            record.replaced_by = None;
            record.advance_job(JobState::Failed, id);
        }
    }

    /// Drop the record of an element that left the document.
    pub fn forget(&mut self, id: ElementId) -> Option<ElementRecord> {
        self.records.remove(&id)
    }

    /// Reset every pending element to `Observed`, dropping queue handles.
    pub fn abandon_pending(&mut self) -> usize {
        let mut abandoned = 0;
        for record in self.records.values_mut() {
            if record.phase.is_in_flight() {
                record.phase = ElementPhase::Observed;
                record.markers.queued = false;
                record.job = JobState::Discovered;
                record.task = None;
                abandoned += 1;
            }
        }
        abandoned
    }

    pub fn get(&self, id: ElementId) -> Option<&ElementRecord> {
        self.records.get(&id)
    }

    pub fn markers(&self, id: ElementId) -> Option<ElementMarkers> {
        self.records.get(&id).map(|r| r.markers)
    }

    pub fn phase(&self, id: ElementId) -> ElementPhase {
        self.records
            .get(&id)
            .map_or(ElementPhase::Unobserved, |r| r.phase)
    }

    pub fn in_flight(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.phase.is_in_flight())
            .count()
    }

    pub fn summary(&self) -> RegistrySummary {
        let mut summary = RegistrySummary::default();
        for record in self.records.values() {
            match record.phase {
                ElementPhase::Unobserved => {}
                ElementPhase::Observed => summary.observed += 1,
                ElementPhase::Queued => summary.queued += 1,
                ElementPhase::Processing => summary.processing += 1,
                ElementPhase::Swapped => summary.swapped += 1,
                ElementPhase::Failed => summary.failed += 1,
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: ElementId = ElementId(1);
    const B: ElementId = ElementId(2);

    fn queued(registry: &mut ElementRegistry, id: ElementId) {
        assert!(registry.mark_observed(id, "a.png"));
        assert!(registry.mark_queued(id));
    }

    #[test]
    fn observe_and_queue_happen_once() {
        let mut registry = ElementRegistry::new();
        assert!(registry.mark_observed(A, "a.png"));
        assert!(!registry.mark_observed(A, "a.png"));
        assert!(registry.mark_queued(A));
        assert!(!registry.mark_queued(A));
        assert_eq!(registry.phase(A), ElementPhase::Queued);
    }

    #[test]
    fn unobserved_element_cannot_be_queued() {
        let mut registry = ElementRegistry::new();
        assert!(!registry.mark_queued(A));
        assert_eq!(registry.phase(A), ElementPhase::Unobserved);
    }

    #[test]
    fn swap_marks_replacement_processed() {
        let mut registry = ElementRegistry::new();
        queued(&mut registry, A);
        assert_eq!(registry.begin(A), Some(1));

        registry.mark_swapped(A, B);

        let original = registry.get(A).unwrap();
        assert_eq!(original.phase, ElementPhase::Swapped);
        assert_eq!(original.job, JobState::Completed);
        assert_eq!(original.replaced_by, Some(B));

        let markers = registry.markers(B).unwrap();
        assert!(markers.processed && markers.succeeded);
        assert!(!registry.mark_observed(B, "data:image/png;base64,AAAA"));
    }

    #[test]
    fn failure_keeps_queued_marker() {
        let mut registry = ElementRegistry::new();
        queued(&mut registry, A);
        registry.begin(A);

        registry.mark_failed(A);

        let markers = registry.markers(A).unwrap();
        assert!(markers.queued);
        assert!(!markers.succeeded);
        assert_eq!(registry.phase(A), ElementPhase::Failed);
        assert!(!registry.mark_queued(A));
    }

    #[test]
    fn retry_after_refused_swap_clears_success() {
        let mut registry = ElementRegistry::new();
        queued(&mut registry, A);
        registry.begin(A);
        registry.mark_swapped(A, B);
        registry.forget(B);

        registry.mark_retrying(A);

        let markers = registry.markers(A).unwrap();
        assert!(markers.queued);
        assert!(!markers.processed);
        assert!(!markers.succeeded);
        assert_eq!(registry.phase(A), ElementPhase::Queued);
        assert_eq!(registry.get(A).unwrap().replaced_by, None);
        assert_eq!(registry.begin(A), Some(2));
    }

    #[test]
    fn failure_after_refused_swap_clears_replacement() {
        let mut registry = ElementRegistry::new();
        queued(&mut registry, A);
        registry.begin(A);
        registry.mark_swapped(A, B);
        registry.forget(B);

        registry.mark_failed(A);

        let record = registry.get(A).unwrap();
        assert!(!record.markers.succeeded);
        assert_eq!(record.replaced_by, None);
        assert_eq!(record.phase, ElementPhase::Failed);
    }

    #[test]
    fn retry_counts_attempts() {
        let mut registry = ElementRegistry::new();
        queued(&mut registry, A);
        assert_eq!(registry.begin(A), Some(1));
        registry.mark_retrying(A);
        assert_eq!(registry.phase(A), ElementPhase::Queued);
        assert_eq!(registry.get(A).unwrap().job, JobState::Queued);
        assert_eq!(registry.begin(A), Some(2));
    }

    #[test]
    fn begin_requires_queued_phase() {
        let mut registry = ElementRegistry::new();
        registry.mark_observed(A, "a.png");
        assert_eq!(registry.begin(A), None);
        assert_eq!(registry.begin(B), None);
    }

    #[test]
    fn begin_clears_task_handle() {
        let mut registry = ElementRegistry::new();
        queued(&mut registry, A);
        registry.begin(A);
        assert!(registry.get(A).unwrap().task.is_none());
    }

    #[test]
    fn abandon_pending_resets_in_flight() {
        let mut registry = ElementRegistry::new();
        queued(&mut registry, A);
        registry.mark_observed(B, "b.png");
        registry.mark_queued(B);
        registry.begin(B);

        assert_eq!(registry.in_flight(), 2);
        assert_eq!(registry.abandon_pending(), 2);
        assert_eq!(registry.in_flight(), 0);
        assert_eq!(registry.summary().observed, 2);
    }

    #[test]
    fn summary_counts_phases() {
        let mut registry = ElementRegistry::new();
        queued(&mut registry, A);
        registry.begin(A);
        registry.mark_swapped(A, B);
        registry.mark_observed(ElementId(3), "c.png");

        let summary = registry.summary();
        assert_eq!(summary.swapped, 2);
        assert_eq!(summary.observed, 1);
        assert_eq!(summary.queued + summary.processing + summary.failed, 0);
    }
}
