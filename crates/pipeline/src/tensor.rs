//! Tracked tensor buffers.
//!
//! Every intermediate array a job allocates is wrapped in a [`Tensor`]
//! registered with a [`BufferTracker`]. Dropping the tensor releases it, so
//! a job's buffers are gone once its stack frame unwinds, whether it
//! returned `Ok`, `Err` or panicked.

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lazyscale_core::performance::ResourceUsage;
use ndarray::{Array, ArrayView, Dimension};

#[derive(Debug, Default)]
struct Counters {
    live: AtomicUsize,
    live_bytes: AtomicUsize,
    peak: AtomicUsize,
    peak_bytes: AtomicUsize,
}

#[derive(Debug, Default)]
struct TrackerInner {
    counters: Counters,
    parent: Option<BufferTracker>,
}

/// Live/peak bookkeeping for tensor buffers.
///
/// Trackers form a tree: [`BufferTracker::scoped`] creates a child whose
/// allocations are also counted by every ancestor. A job runs against its
/// own child so its usage can be read in isolation.
#[derive(Debug, Clone, Default)]
pub struct BufferTracker {
    inner: Arc<TrackerInner>,
}

impl BufferTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A child tracker that reports into `self`.
    pub fn scoped(&self) -> BufferTracker {
        BufferTracker {
            inner: Arc::new(TrackerInner {
                counters: Counters::default(),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Register `data` and hand back its tracked wrapper.
    pub fn track<D: Dimension>(&self, data: Array<f32, D>) -> Tensor<D> {
        let bytes = data.len() * std::mem::size_of::<f32>();
        self.alloc(bytes);
        Tensor {
            data,
            bytes,
            tracker: self.clone(),
        }
    }

    pub fn live_buffers(&self) -> usize {
        self.inner.counters.live.load(Ordering::SeqCst)
    }

    pub fn usage(&self) -> ResourceUsage {
        let c = &self.inner.counters;
        ResourceUsage {
            live_tensors: c.live.load(Ordering::SeqCst),
            live_bytes: c.live_bytes.load(Ordering::SeqCst),
            peak_tensors: c.peak.load(Ordering::SeqCst),
            peak_bytes: c.peak_bytes.load(Ordering::SeqCst),
        }
    }

    fn alloc(&self, bytes: usize) {
        let mut node = Some(self);
        while let Some(tracker) = node {
            let c = &tracker.inner.counters;
            let live = c.live.fetch_add(1, Ordering::SeqCst) + 1;
            let live_bytes = c.live_bytes.fetch_add(bytes, Ordering::SeqCst) + bytes;
            c.peak.fetch_max(live, Ordering::SeqCst);
            c.peak_bytes.fetch_max(live_bytes, Ordering::SeqCst);
            node = tracker.inner.parent.as_ref();
        }
    }

    fn release(&self, bytes: usize) {
        let mut node = Some(self);
        while let Some(tracker) = node {
            let c = &tracker.inner.counters;
            c.live.fetch_sub(1, Ordering::SeqCst);
            c.live_bytes.fetch_sub(bytes, Ordering::SeqCst);
            node = tracker.inner.parent.as_ref();
        }
    }
}

/// An `f32` array whose lifetime is accounted for by a [`BufferTracker`].
#[derive(Debug)]
pub struct Tensor<D: Dimension> {
    data: Array<f32, D>,
    bytes: usize,
    tracker: BufferTracker,
}

impl<D: Dimension> Tensor<D> {
    pub fn view(&self) -> ArrayView<'_, f32, D> {
        self.data.view()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl<D: Dimension> Deref for Tensor<D> {
    type Target = Array<f32, D>;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl<D: Dimension> Drop for Tensor<D> {
    fn drop(&mut self) {
        self.tracker.release(self.bytes);
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array2, Array3};

    use super::*;

    #[test]
    fn drop_releases_buffer() {
        let tracker = BufferTracker::new();
        let t = tracker.track(Array2::<f32>::zeros((4, 4)));
        assert_eq!(tracker.live_buffers(), 1);
        assert_eq!(tracker.usage().live_bytes, 64);

        drop(t);

        assert_eq!(tracker.live_buffers(), 0);
        assert_eq!(tracker.usage().live_bytes, 0);
    }

    #[test]
    fn peak_survives_release() {
        let tracker = BufferTracker::new();
        {
            let _a = tracker.track(Array2::<f32>::zeros((2, 2)));
            let _b = tracker.track(Array2::<f32>::zeros((2, 2)));
        }
        let _c = tracker.track(Array2::<f32>::zeros((1, 1)));

        let usage = tracker.usage();
        assert_eq!(usage.live_tensors, 1);
        assert_eq!(usage.peak_tensors, 2);
        assert_eq!(usage.peak_bytes, 32);
    }

    #[test]
    fn scoped_allocations_count_in_parent() {
        let root = BufferTracker::new();
        let job = root.scoped();

        let t = job.track(Array3::<f32>::zeros((2, 2, 3)));
        assert_eq!(job.live_buffers(), 1);
        assert_eq!(root.live_buffers(), 1);

        drop(t);
        assert_eq!(job.live_buffers(), 0);
        assert_eq!(root.live_buffers(), 0);
        assert_eq!(root.usage().peak_tensors, 1);
    }

    #[test]
    fn sibling_scopes_are_isolated() {
        let root = BufferTracker::new();
        let a = root.scoped();
        let b = root.scoped();

        let _ta = a.track(Array2::<f32>::zeros((1, 1)));
        assert_eq!(a.live_buffers(), 1);
        assert_eq!(b.live_buffers(), 0);
        assert_eq!(root.live_buffers(), 1);
    }

    #[test]
    fn release_on_unwind() {
        let tracker = BufferTracker::new();
        let inner = tracker.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _t = inner.track(Array2::<f32>::zeros((8, 8)));
            panic!("stage failed");
        }));
        assert!(result.is_err());
        assert_eq!(tracker.live_buffers(), 0);
    }
}
