//! In-process model of the displayed document.
//!
//! The document is an ordered set of image elements plus a viewport. Every
//! structural change is announced on a broadcast feed of [`Mutation`]s,
//! the way a mutation observer would see it.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use lazyscale_core::types::{ElementId, Locator};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Opt-in attribute; only elements with `data-upscale="true"` are enhanced.
pub const UPSCALE_MARKER: &str = "data-upscale";

const MUTATION_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

/// Layout box in document coordinates (CSS pixels).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }
}

/// The visible window onto the document.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub scroll_y: f64,
    pub width: f64,
    pub height: f64,
}

impl Viewport {
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            scroll_y: 0.0,
            width,
            height,
        }
    }
}

// ---------------------------------------------------------------------------
// Elements
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageElement {
    pub src: Locator,
    #[serde(default)]
    pub alt: String,
    #[serde(default)]
    pub class_name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub style: BTreeMap<String, String>,
    #[serde(default)]
    pub rect: Rect,
}

impl ImageElement {
    pub fn new(src: impl Into<Locator>, rect: Rect) -> Self {
        Self {
            src: src.into(),
            alt: String::new(),
            class_name: String::new(),
            attributes: BTreeMap::new(),
            style: BTreeMap::new(),
            rect,
        }
    }

    pub fn with_alt(mut self, alt: impl Into<String>) -> Self {
        self.alt = alt.into();
        self
    }

    pub fn with_class(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = class_name.into();
        self
    }

    /// Set the opt-in marker.
    pub fn opted_in(mut self) -> Self {
        self.attributes
            .insert(UPSCALE_MARKER.to_string(), "true".to_string());
        self
    }

    pub fn is_opted_in(&self) -> bool {
        self.attributes.get(UPSCALE_MARKER).map(String::as_str) == Some("true")
    }

    /// Node that takes this one's place once `upscaled` is ready: same alt
    /// text, class and box, full-width styling, opt-in marker kept.
    pub fn replacement(&self, upscaled: impl Into<Locator>) -> ImageElement {
        let mut style = BTreeMap::new();
        style.insert("width".to_string(), "100%".to_string());
        style.insert("height".to_string(), "auto".to_string());
        ImageElement {
            src: upscaled.into(),
            alt: self.alt.clone(),
            class_name: self.class_name.clone(),
            attributes: BTreeMap::new(),
            style,
            rect: self.rect,
        }
        .opted_in()
    }
}

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    NodesAdded(Vec<ElementId>),
    NodeRemoved(ElementId),
    /// `old` was swapped out for `new` at the same position.
    Replaced { old: ElementId, new: ElementId },
    Scrolled(Viewport),
}

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("Element {0} is not in the document")]
    NotFound(ElementId),

    #[error("Element {0} is already in the document")]
    Duplicate(ElementId),
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

struct Tree {
    order: Vec<ElementId>,
    nodes: HashMap<ElementId, ImageElement>,
    viewport: Viewport,
}

pub struct Document {
    tree: RwLock<Tree>,
    next_id: AtomicU64,
    mutations: broadcast::Sender<Mutation>,
}

impl Document {
    pub fn new(viewport: Viewport) -> Self {
        let (mutations, _) = broadcast::channel(MUTATION_CAPACITY);
        Self {
            tree: RwLock::new(Tree {
                order: Vec::new(),
                nodes: HashMap::new(),
                viewport,
            }),
            next_id: AtomicU64::new(1),
            mutations,
        }
    }

    /// Feed of every change made from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Mutation> {
        self.mutations.subscribe()
    }

    /// Reserve an id for a node that is about to be inserted.
    pub fn allocate_id(&self) -> ElementId {
        ElementId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn insert(&self, element: ImageElement) -> ElementId {
        let id = self.allocate_id();
        {
            let mut tree = self.write();
            tree.order.push(id);
            tree.nodes.insert(id, element);
        }
        self.announce(Mutation::NodesAdded(vec![id]));
        id
    }

    /// Append several nodes as one mutation.
    pub fn insert_all(&self, elements: impl IntoIterator<Item = ImageElement>) -> Vec<ElementId> {
        let ids: Vec<ElementId> = {
            let mut tree = self.write();
            elements
                .into_iter()
                .map(|element| {
                    let id = self.allocate_id();
                    tree.order.push(id);
                    tree.nodes.insert(id, element);
                    id
                })
                .collect()
        };
        if !ids.is_empty() {
            self.announce(Mutation::NodesAdded(ids.clone()));
        }
        ids
    }

    pub fn remove(&self, id: ElementId) -> Result<ImageElement, DocumentError> {
        let element = {
            let mut tree = self.write();
            let element = tree.nodes.remove(&id).ok_or(DocumentError::NotFound(id))?;
            tree.order.retain(|e| *e != id);
            element
        };
        self.announce(Mutation::NodeRemoved(id));
        Ok(element)
    }

    /// Put `element` under `new` where `old` was.
    pub fn replace(
        &self,
        old: ElementId,
        new: ElementId,
        element: ImageElement,
    ) -> Result<(), DocumentError> {
        {
            let mut tree = self.write();
            if tree.nodes.contains_key(&new) {
                return Err(DocumentError::Duplicate(new));
            }
            let pos = tree
                .order
                .iter()
                .position(|e| *e == old)
                .ok_or(DocumentError::NotFound(old))?;
            tree.order[pos] = new;
            tree.nodes.remove(&old);
            tree.nodes.insert(new, element);
        }
        self.announce(Mutation::Replaced { old, new });
        Ok(())
    }

    pub fn scroll_to(&self, scroll_y: f64) {
        let viewport = {
            let mut tree = self.write();
            tree.viewport.scroll_y = scroll_y.max(0.0);
            tree.viewport
        };
        self.announce(Mutation::Scrolled(viewport));
    }

    pub fn viewport(&self) -> Viewport {
        self.read().viewport
    }

    pub fn get(&self, id: ElementId) -> Option<ImageElement> {
        self.read().nodes.get(&id).cloned()
    }

    pub fn contains(&self, id: ElementId) -> bool {
        self.read().nodes.contains_key(&id)
    }

    /// Element ids in document order.
    pub fn ids(&self) -> Vec<ElementId> {
        self.read().order.clone()
    }

    pub fn len(&self) -> usize {
        self.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lowest point of any element; used to bound scrolling.
    pub fn content_height(&self) -> f64 {
        self.read()
            .nodes
            .values()
            .map(|e| e.rect.bottom())
            .fold(0.0, f64::max)
    }

    /// Opted-in elements, in document order.
    pub fn query_eligible(&self) -> Vec<(ElementId, ImageElement)> {
        let tree = self.read();
        tree.order
            .iter()
            .filter_map(|id| {
                tree.nodes
                    .get(id)
                    .filter(|e| e.is_opted_in())
                    .map(|e| (*id, e.clone()))
            })
            .collect()
    }

    fn announce(&self, mutation: Mutation) {
        // No receivers is fine: nobody is observing yet.
        let _ = self.mutations.send(mutation);
    }

    fn read(&self) -> RwLockReadGuard<'_, Tree> {
        self.tree.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tree> {
        self.tree.write().unwrap_or_else(|p| p.into_inner())
    }
}
