//! The page seam: everything the engine needs from a live page.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dom::{Document, NodeKey, Rect, join_frames, split_frames};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PageError {
    #[error("no node at {0}")]
    NodeGone(NodeAddress),

    #[error("page script failed: {0}")]
    Script(String),

    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("page is not reachable: {0}")]
    Unavailable(String),
}

/// Where a node lives: the chain of frame elements leading to its document, and its
/// locator path inside that document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    pub frames: Vec<String>,
    pub path: String,
}

impl NodeAddress {
    pub fn new(frames: Vec<String>, path: impl Into<String>) -> Self {
        Self {
            frames,
            path: path.into(),
        }
    }

    pub fn parse(raw: &str) -> Self {
        let (frames, inner) = split_frames(raw);
        Self {
            frames: frames.into_iter().map(str::to_string).collect(),
            path: inner.to_string(),
        }
    }

    /// Resolve against a document, descending through accessible frames.
    pub fn locate<'a>(&self, doc: &'a Document) -> Option<(&'a Document, NodeKey)> {
        let mut current = doc;
        for frame in &self.frames {
            let key = current.evaluate_path(frame)?;
            match current.frame(key)? {
                crate::dom::FrameAccess::Accessible(inner) => current = inner,
                crate::dom::FrameAccess::Inaccessible(_) => return None,
            }
        }
        current.evaluate_path(&self.path).map(|key| (current, key))
    }

    fn locate_mut<'a>(&self, doc: &'a mut Document) -> Option<(&'a mut Document, NodeKey)> {
        let mut current = doc;
        for frame in &self.frames {
            let key = current.evaluate_path(frame)?;
            current = current.frame_mut(key)?;
        }
        let key = current.evaluate_path(&self.path)?;
        Some((current, key))
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&join_frames(&self.frames, &self.path))
    }
}

/// Input events synthesized against a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "key", rename_all = "snake_case")]
pub enum DomEvent {
    PointerOver,
    PointerDown,
    PointerUp,
    Click,
    Focus,
    KeyDown(char),
    KeyUp(char),
    Input,
    Change,
}

impl DomEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomEvent::PointerOver => "mouseover",
            DomEvent::PointerDown => "mousedown",
            DomEvent::PointerUp => "mouseup",
            DomEvent::Click => "click",
            DomEvent::Focus => "focus",
            DomEvent::KeyDown(_) => "keydown",
            DomEvent::KeyUp(_) => "keyup",
            DomEvent::Input => "input",
            DomEvent::Change => "change",
        }
    }
}

#[async_trait]
pub trait Page: Send + Sync {
    /// Read the live document.
    async fn capture(&self) -> Result<Document, PageError>;

    async fn url(&self) -> Result<String, PageError>;

    /// Scroll the node into view and return its box afterwards.
    async fn scroll_into_view(&self, target: &NodeAddress) -> Result<Rect, PageError>;

    async fn dispatch(&self, target: &NodeAddress, event: DomEvent) -> Result<(), PageError>;

    /// Replace the node's current value (form fields).
    async fn set_value(&self, target: &NodeAddress, value: &str) -> Result<(), PageError>;

    async fn value(&self, target: &NodeAddress) -> Result<String, PageError>;

    /// Scroll the node, or the window for `html`/`body`, by `amount` pixels.
    async fn scroll_by(&self, target: &NodeAddress, amount: i64) -> Result<(), PageError>;

    async fn navigate(&self, url: &str) -> Result<(), PageError>;

    /// Whether the in-page helpers are installed.
    async fn is_ready(&self) -> bool {
        true
    }

    /// (Re-)install the in-page helpers.
    async fn install(&self) -> Result<(), PageError> {
        Ok(())
    }

    /// Move the cursor indicator to a point, or hide it.
    async fn show_cursor(&self, _at: Option<(f64, f64)>) -> Result<(), PageError> {
        Ok(())
    }
}

/// An in-process page backed by a [`Document`]. Input is applied to the document and
/// recorded so callers can inspect what was dispatched.
#[derive(Debug, Default)]
pub struct MemoryPage {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    doc: Document,
    routes: HashMap<String, Document>,
    events: Vec<(NodeAddress, DomEvent)>,
    cursor: Option<(f64, f64)>,
    ready: bool,
    scrolls: Vec<(NodeAddress, i64)>,
}

impl MemoryPage {
    pub fn new(doc: impl Into<Document>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                doc: doc.into(),
                ready: true,
                ..Default::default()
            }),
        }
    }

    /// Document served after navigating to `url`.
    pub fn route(&self, url: &str, doc: impl Into<Document>) {
        self.lock().routes.insert(url.to_string(), doc.into());
    }

    /// Swap the live document, as a page mutation or reload would.
    pub fn replace(&self, doc: impl Into<Document>) {
        self.lock().doc = doc.into();
    }

    /// Drop the in-page helpers, as a navigation does in a real browser.
    pub fn unload_helpers(&self) {
        self.lock().ready = false;
    }

    pub fn events(&self) -> Vec<(NodeAddress, DomEvent)> {
        self.lock().events.clone()
    }

    pub fn events_for(&self, path: &str) -> Vec<DomEvent> {
        self.lock()
            .events
            .iter()
            .filter(|(a, _)| a.to_string() == path)
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn scrolls(&self) -> Vec<(NodeAddress, i64)> {
        self.lock().scrolls.clone()
    }

    pub fn cursor(&self) -> Option<(f64, f64)> {
        self.lock().cursor
    }

    pub fn current_url(&self) -> String {
        self.lock().doc.url().to_string()
    }

    pub fn document(&self) -> Document {
        self.lock().doc.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Page for MemoryPage {
    async fn capture(&self) -> Result<Document, PageError> {
        Ok(self.lock().doc.clone())
    }

    async fn url(&self) -> Result<String, PageError> {
        Ok(self.current_url())
    }

    async fn scroll_into_view(&self, target: &NodeAddress) -> Result<Rect, PageError> {
        let state = self.lock();
        let (doc, key) = target
            .locate(&state.doc)
            .ok_or_else(|| PageError::NodeGone(target.clone()))?;
        doc.element(key)
            .map(|e| e.rect)
            .map_err(|e| PageError::Script(e.to_string()))
    }

    async fn dispatch(&self, target: &NodeAddress, event: DomEvent) -> Result<(), PageError> {
        let mut state = self.lock();
        if target.locate(&state.doc).is_none() {
            return Err(PageError::NodeGone(target.clone()));
        }
        state.events.push((target.clone(), event));
        Ok(())
    }

    async fn set_value(&self, target: &NodeAddress, value: &str) -> Result<(), PageError> {
        let mut state = self.lock();
        let (doc, key) = target
            .locate_mut(&mut state.doc)
            .ok_or_else(|| PageError::NodeGone(target.clone()))?;
        doc.set_attribute(key, "value", value)
            .map_err(|e| PageError::Script(e.to_string()))
    }

    async fn value(&self, target: &NodeAddress) -> Result<String, PageError> {
        let state = self.lock();
        let (doc, key) = target
            .locate(&state.doc)
            .ok_or_else(|| PageError::NodeGone(target.clone()))?;
        let element = doc.element(key).map_err(|e| PageError::Script(e.to_string()))?;
        Ok(element.attr("value").unwrap_or_default().to_string())
    }

    async fn scroll_by(&self, target: &NodeAddress, amount: i64) -> Result<(), PageError> {
        let mut state = self.lock();
        if target.locate(&state.doc).is_none() {
            return Err(PageError::NodeGone(target.clone()));
        }
        state.scrolls.push((target.clone(), amount));
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<(), PageError> {
        let mut state = self.lock();
        let next = match state.routes.get(url) {
            Some(doc) => {
                let mut doc = doc.clone();
                doc.set_url(url);
                doc
            }
            None => Document::new(url),
        };
        state.doc = next;
        state.ready = false;
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        self.lock().ready
    }

    async fn install(&self) -> Result<(), PageError> {
        self.lock().ready = true;
        Ok(())
    }

    async fn show_cursor(&self, at: Option<(f64, f64)>) -> Result<(), PageError> {
        self.lock().cursor = at;
        Ok(())
    }
}
