//! Per-job latency and resource usage aggregation.
//!
//! [`PerformanceAggregator`] is the only writer of [`PerformanceSample`];
//! everyone else reads snapshots through [`PerformanceAggregator::snapshot`]
//! or the display-oriented [`PerformanceAggregator::feed`].

use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

/// Live and peak tensor bookkeeping, as reported by the buffer tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceUsage {
    pub live_tensors: usize,
    pub live_bytes: usize,
    pub peak_tensors: usize,
    pub peak_bytes: usize,
}

impl ResourceUsage {
    /// Field-wise maximum of two usage reports.
    pub fn max(self, other: ResourceUsage) -> ResourceUsage {
        ResourceUsage {
            live_tensors: self.live_tensors.max(other.live_tensors),
            live_bytes: self.live_bytes.max(other.live_bytes),
            peak_tensors: self.peak_tensors.max(other.peak_tensors),
            peak_bytes: self.peak_bytes.max(other.peak_bytes),
        }
    }
}

/// Running statistics over completed jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PerformanceSample {
    pub last_duration: Option<Duration>,
    /// Arithmetic mean over every recorded job since the last reset.
    pub average_duration: Option<Duration>,
    pub peak_resource_usage: Option<ResourceUsage>,
    pub samples: u64,
}

/// Serializable view handed to display layers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PerformanceFeed {
    pub last_duration_ms: Option<f64>,
    pub average_duration_ms: Option<f64>,
    pub resource_usage: Option<ResourceUsage>,
}

/// Thread-safe aggregator shared between the pipeline and its readers.
#[derive(Debug, Default)]
pub struct PerformanceAggregator {
    sample: Mutex<PerformanceSample>,
}

impl PerformanceAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finished job.
    pub fn record(&self, duration: Duration, usage: ResourceUsage) {
        let mut sample = lock(&self.sample);
        let samples = sample.samples + 1;

        let average = match sample.average_duration {
            Some(avg) => {
                let total = avg.as_secs_f64() * sample.samples as f64 + duration.as_secs_f64();
                Duration::from_secs_f64(total / samples as f64)
            }
            None => duration,
        };

        sample.last_duration = Some(duration);
        sample.average_duration = Some(average);
        sample.peak_resource_usage = Some(match sample.peak_resource_usage {
            Some(peak) => peak.max(usage),
            None => usage,
        });
        sample.samples = samples;
    }

    pub fn snapshot(&self) -> PerformanceSample {
        *lock(&self.sample)
    }

    pub fn feed(&self) -> PerformanceFeed {
        let sample = self.snapshot();
        PerformanceFeed {
            last_duration_ms: sample.last_duration.map(as_millis_f64),
            average_duration_ms: sample.average_duration.map(as_millis_f64),
            resource_usage: sample.peak_resource_usage,
        }
    }

    /// Zero every statistic.
    pub fn reset(&self) {
        *lock(&self.sample) = PerformanceSample::default();
    }
}

fn as_millis_f64(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

// A poisoned lock only means a writer panicked mid-update of plain counters.
fn lock(m: &Mutex<PerformanceSample>) -> std::sync::MutexGuard<'_, PerformanceSample> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
