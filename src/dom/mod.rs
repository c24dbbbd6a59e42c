//! In-memory document model.
//!
//! A [`Document`] is an arena of nodes read from a live page (or built by hand in tests).
//! Every read-side component works against it: the snapshotter walks it, the resolver
//! queries it, and `MemoryPage` mutates it when replaying input.

mod build;
mod classify;
mod path;
mod selector;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use build::{DocumentSpec, ElementSpec, FrameSpec, NodeSpec, Probe, el, text};
pub use path::{FRAME_SEPARATOR, join_frames, split_frames};
pub use selector::{Selector, SelectorError};

pub type NodeKey = usize;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }

    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.x && y >= self.y && x < self.x + self.width && y < self.y + self.height
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280.0,
            height: 800.0,
        }
    }
}

impl Viewport {
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= 0.0 && y >= 0.0 && x < self.width && y < self.height
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DomError {
    #[error("node {0} does not exist")]
    Missing(NodeKey),

    #[error("node {key} could not be read: {reason}")]
    Unreadable { key: NodeKey, reason: String },

    #[error("node {0} is not an element")]
    NotElement(NodeKey),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    /// Lower-cased tag name.
    pub tag: String,
    pub attributes: Vec<(String, String)>,
    pub rect: Rect,
    /// Hidden through computed style (display, visibility, opacity) at capture time.
    pub style_hidden: bool,
    pub frame: Option<FrameContent>,
}

impl Element {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attr(name).is_some()
    }

    pub fn id(&self) -> Option<&str> {
        self.attr("id").filter(|id| !id.is_empty())
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.attr("class").unwrap_or_default().split_whitespace()
    }

    pub fn set_attr(&mut self, name: &str, value: &str) {
        match self
            .attributes
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            Some((_, v)) => *v = value.to_string(),
            None => self.attributes.push((name.to_string(), value.to_string())),
        }
    }
}

/// What sits behind a frame element.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameContent {
    Loaded(Box<Document>),
    CrossOrigin { src: String },
    /// One of our own overlay frames; never part of the page's content.
    Overlay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameBlock {
    CrossOrigin,
    Overlay,
}

/// Result of reaching into a frame element.
#[derive(Debug, Clone, Copy)]
pub enum FrameAccess<'a> {
    Accessible(&'a Document),
    Inaccessible(FrameBlock),
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeData {
    Element(Element),
    Text(String),
    /// A node whose accessors failed while it was being read.
    Unreadable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub parent: Option<NodeKey>,
    pub children: Vec<NodeKey>,
    pub data: NodeData,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    url: String,
    viewport: Viewport,
    nodes: Vec<Node>,
    root: Option<NodeKey>,
    /// Hit-test results recorded at each element's center when the page was read.
    probes: HashMap<NodeKey, Option<NodeKey>>,
}

impl Document {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn set_url(&mut self, url: impl Into<String>) {
        self.url = url.into();
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
    }

    pub fn root(&self) -> Option<NodeKey> {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, key: NodeKey) -> Result<&Node, DomError> {
        self.nodes.get(key).ok_or(DomError::Missing(key))
    }

    pub fn element(&self, key: NodeKey) -> Result<&Element, DomError> {
        match &self.node(key)?.data {
            NodeData::Element(element) => Ok(element),
            NodeData::Text(_) => Err(DomError::NotElement(key)),
            NodeData::Unreadable(reason) => Err(DomError::Unreadable {
                key,
                reason: reason.clone(),
            }),
        }
    }

    pub fn element_mut(&mut self, key: NodeKey) -> Result<&mut Element, DomError> {
        match self.nodes.get_mut(key).map(|n| &mut n.data) {
            Some(NodeData::Element(element)) => Ok(element),
            Some(NodeData::Text(_)) => Err(DomError::NotElement(key)),
            Some(NodeData::Unreadable(reason)) => Err(DomError::Unreadable {
                key,
                reason: reason.clone(),
            }),
            None => Err(DomError::Missing(key)),
        }
    }

    pub fn children(&self, key: NodeKey) -> &[NodeKey] {
        self.nodes
            .get(key)
            .map(|n| n.children.as_slice())
            .unwrap_or_default()
    }

    pub fn parent(&self, key: NodeKey) -> Option<NodeKey> {
        self.nodes.get(key).and_then(|n| n.parent)
    }

    /// Nearest ancestor that is a readable element.
    pub fn parent_element(&self, key: NodeKey) -> Option<NodeKey> {
        let mut current = self.parent(key);
        while let Some(candidate) = current {
            if self.element(candidate).is_ok() {
                return Some(candidate);
            }
            current = self.parent(candidate);
        }
        None
    }

    /// Pre-order walk of `key`'s subtree, `key` included.
    pub fn subtree(&self, key: NodeKey) -> Vec<NodeKey> {
        let mut out = Vec::new();
        let mut stack = vec![key];
        while let Some(next) = stack.pop() {
            if next >= self.nodes.len() {
                continue;
            }
            out.push(next);
            stack.extend(self.children(next).iter().rev());
        }
        out
    }

    /// Every readable element in document order.
    pub fn elements(&self) -> Vec<NodeKey> {
        self.root
            .map(|root| self.subtree(root))
            .unwrap_or_default()
            .into_iter()
            .filter(|&k| self.element(k).is_ok())
            .collect()
    }

    pub fn element_by_id(&self, id: &str) -> Option<NodeKey> {
        self.elements()
            .into_iter()
            .find(|&k| self.element(k).is_ok_and(|e| e.id() == Some(id)))
    }

    pub fn is_self_or_ancestor(&self, ancestor: NodeKey, key: NodeKey) -> bool {
        let mut current = Some(key);
        while let Some(k) = current {
            if k == ancestor {
                return true;
            }
            current = self.parent(k);
        }
        false
    }

    /// Text of all descendant text nodes, joined by single spaces.
    pub fn text_content(&self, key: NodeKey) -> String {
        let mut parts = Vec::new();
        for k in self.subtree(key) {
            if let Ok(Node {
                data: NodeData::Text(t),
                ..
            }) = self.node(k)
            {
                let t = t.trim();
                if !t.is_empty() {
                    parts.push(t);
                }
            }
        }
        parts.join(" ")
    }

    pub fn frame(&self, key: NodeKey) -> Option<FrameAccess<'_>> {
        let element = self.element(key).ok()?;
        match element.frame.as_ref()? {
            FrameContent::Loaded(doc) => Some(FrameAccess::Accessible(doc)),
            FrameContent::CrossOrigin { .. } => {
                Some(FrameAccess::Inaccessible(FrameBlock::CrossOrigin))
            }
            FrameContent::Overlay => Some(FrameAccess::Inaccessible(FrameBlock::Overlay)),
        }
    }

    pub fn frame_mut(&mut self, key: NodeKey) -> Option<&mut Document> {
        match self.element_mut(key).ok()?.frame.as_mut()? {
            FrameContent::Loaded(doc) => Some(doc),
            _ => None,
        }
    }

    /// Topmost element painted at a point, by geometry: later and deeper nodes paint over
    /// earlier ones.
    pub fn element_at(&self, x: f64, y: f64) -> Option<NodeKey> {
        self.elements().into_iter().rev().find(|&k| {
            self.element(k)
                .is_ok_and(|e| !e.rect.is_empty() && e.rect.contains(x, y))
                && !self.is_style_hidden(k)
        })
    }

    /// Hit test at the center of an element. A hit recorded by the live page wins over the
    /// geometric fallback.
    pub fn element_at_center(&self, key: NodeKey) -> Option<NodeKey> {
        if let Some(hit) = self.probes.get(&key) {
            return *hit;
        }
        let (x, y) = self.element(key).ok()?.rect.center();
        self.element_at(x, y)
    }

    pub fn is_style_hidden(&self, key: NodeKey) -> bool {
        let mut current = Some(key);
        while let Some(k) = current {
            if let Ok(element) = self.element(k) {
                if classify::hidden_by_style(element) {
                    return true;
                }
            }
            current = self.parent(k);
        }
        false
    }

    /// Rendered with a non-zero box and not hidden through style. Text follows its parent.
    pub fn is_visible(&self, key: NodeKey) -> bool {
        match self.node(key).map(|n| &n.data) {
            Ok(NodeData::Element(element)) => {
                !element.rect.is_empty() && !self.is_style_hidden(key)
            }
            Ok(NodeData::Text(_)) => self
                .parent_element(key)
                .is_some_and(|parent| self.is_visible(parent)),
            _ => false,
        }
    }

    pub fn is_interactive(&self, key: NodeKey) -> bool {
        classify::is_interactive(self, key)
    }

    pub fn set_attribute(&mut self, key: NodeKey, name: &str, value: &str) -> Result<(), DomError> {
        self.element_mut(key)?.set_attr(name, value);
        Ok(())
    }

    pub(crate) fn push(&mut self, parent: Option<NodeKey>, data: NodeData) -> NodeKey {
        let key = self.nodes.len();
        self.nodes.push(Node {
            parent,
            children: Vec::new(),
            data,
        });
        match parent {
            Some(p) => self.nodes[p].children.push(key),
            None if self.root.is_none() => self.root = Some(key),
            None => {}
        }
        key
    }

    pub(crate) fn record_probe(&mut self, key: NodeKey, hit: Option<NodeKey>) {
        self.probes.insert(key, hit);
    }
}

/// Lower-case, collapse whitespace, trim.
pub fn normalize_text(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> Document {
        DocumentSpec::new("https://example.test/")
            .root(
                el("html").child(
                    el("body")
                        .rect(0.0, 0.0, 1280.0, 800.0)
                        .child(
                            el("div")
                                .attr("id", "wrap")
                                .rect(0.0, 0.0, 400.0, 400.0)
                                .child(el("button").attr("id", "go").rect(10.0, 10.0, 80.0, 30.0).text("Go")),
                        )
                        .child(el("p").attr("style", "display: none").rect(0.0, 500.0, 100.0, 20.0).text("gone")),
                ),
            )
            .build()
    }

    #[test]
    fn test_element_by_id_and_text() {
        let doc = page();
        let go = doc.element_by_id("go").unwrap();
        assert_eq!(doc.element(go).unwrap().tag, "button");
        assert_eq!(doc.text_content(go), "Go");
        assert!(doc.element_by_id("nope").is_none());
    }

    #[test]
    fn test_element_at_prefers_deepest() {
        let doc = page();
        let go = doc.element_by_id("go").unwrap();
        assert_eq!(doc.element_at(20.0, 20.0), Some(go));
        let wrap = doc.element_by_id("wrap").unwrap();
        assert_eq!(doc.element_at(300.0, 300.0), Some(wrap));
    }

    #[test]
    fn test_inline_style_hides_subtree() {
        let doc = page();
        let p = doc
            .elements()
            .into_iter()
            .find(|&k| doc.element(k).unwrap().tag == "p")
            .unwrap();
        assert!(!doc.is_visible(p));
        let text = doc.children(p)[0];
        assert!(!doc.is_visible(text));
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  Sign \n  IN "), "sign in");
    }
}
