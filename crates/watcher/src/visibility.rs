//! Proximity-triggered visibility observation.

use std::collections::BTreeSet;

use lazyscale_core::types::ElementId;

use crate::document::{Document, Rect, Viewport};

/// Default pre-load distance above and below the viewport.
pub const DEFAULT_PRELOAD_MARGIN_PX: f64 = 500.0;

/// Tracks observed elements and reports which of them are within the
/// viewport grown vertically by `margin`. Touching the edge counts.
#[derive(Debug)]
pub struct VisibilityObserver {
    margin: f64,
    observed: BTreeSet<ElementId>,
}

impl VisibilityObserver {
    pub fn new(margin: f64) -> Self {
        Self {
            margin: margin.max(0.0),
            observed: BTreeSet::new(),
        }
    }

    /// Returns `false` if the element was already observed.
    pub fn observe(&mut self, id: ElementId) -> bool {
        self.observed.insert(id)
    }

    pub fn unobserve(&mut self, id: ElementId) -> bool {
        self.observed.remove(&id)
    }

    pub fn disconnect(&mut self) {
        self.observed.clear();
    }

    pub fn is_observing(&self, id: ElementId) -> bool {
        self.observed.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.observed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observed.is_empty()
    }

    /// Observed elements that currently intersect the grown viewport.
    /// Elements no longer in the document are dropped from observation.
    pub fn intersecting(&mut self, document: &Document) -> Vec<ElementId> {
        let viewport = document.viewport();
        let mut hits = Vec::new();
        let mut gone = Vec::new();
        for id in &self.observed {
            match document.get(*id) {
                Some(el) if intersects(&el.rect, &viewport, self.margin) => hits.push(*id),
                Some(_) => {}
                None => gone.push(*id),
            }
        }
        for id in gone {
            self.observed.remove(&id);
        }
        hits
    }
}

fn intersects(rect: &Rect, viewport: &Viewport, margin: f64) -> bool {
    let top = viewport.scroll_y - margin;
    let bottom = viewport.scroll_y + viewport.height + margin;
    rect.bottom() >= top && rect.y <= bottom && rect.right() >= 0.0 && rect.x <= viewport.width
}
