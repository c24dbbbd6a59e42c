//! Flattens a document, frames included, into the id-addressed structure the planning
//! service consumes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::dom::{Document, FrameAccess, NodeData, NodeKey, join_frames};

/// Attribute carried by frame wrapper records.
pub const FRAME_ID_ATTR: &str = "data-frame-id";

const SKIPPED_TAGS: &[&str] = &["script", "style", "noscript"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementRecord {
    pub tag_name: String,
    pub attributes: BTreeMap<String, String>,
    /// Locator path, frame chain included.
    pub xpath: String,
    pub children: Vec<u32>,
    pub is_visible: bool,
    pub is_interactive: bool,
    pub is_top_element: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextMarker {
    #[serde(rename = "TEXT_NODE")]
    TextNode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextRecord {
    #[serde(rename = "type")]
    pub marker: TextMarker,
    pub text: String,
    pub is_visible: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeRecord {
    Text(TextRecord),
    Element(ElementRecord),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub url: String,
    pub root: Option<String>,
    pub nodes: BTreeMap<String, NodeRecord>,
}

impl Snapshot {
    pub fn empty(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: u32) -> Option<&NodeRecord> {
        self.nodes.get(&id.to_string())
    }

    pub fn elements(&self) -> impl Iterator<Item = &ElementRecord> {
        self.nodes.values().filter_map(|n| match n {
            NodeRecord::Element(e) => Some(e),
            NodeRecord::Text(_) => None,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Snapshotter;

impl Snapshotter {
    pub fn new() -> Self {
        Self
    }

    /// Capture a snapshot. Never fails: unreadable nodes are dropped and a document with no
    /// root yields an empty snapshot.
    pub fn capture(&self, doc: &Document) -> Snapshot {
        let mut walk = Walk {
            next_id: 0,
            nodes: BTreeMap::new(),
        };
        let root = doc
            .root()
            .and_then(|root| walk.visit(doc, root, &[]))
            .map(|id| id.to_string());

        if root.is_none() {
            debug!(url = doc.url(), "document has no readable root; empty snapshot");
        }
        debug!(url = doc.url(), nodes = walk.nodes.len(), "snapshot captured");

        Snapshot {
            url: doc.url().to_string(),
            root,
            nodes: walk.nodes,
        }
    }
}

struct Walk {
    next_id: u32,
    nodes: BTreeMap<String, NodeRecord>,
}

impl Walk {
    fn alloc(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn visit(&mut self, doc: &Document, key: NodeKey, frames: &[String]) -> Option<u32> {
        let node = match doc.node(key) {
            Ok(node) => node,
            Err(err) => {
                trace!(%err, "dropping node");
                return None;
            }
        };

        let element = match &node.data {
            NodeData::Text(raw) => {
                let text = raw.trim();
                if text.is_empty() {
                    return None;
                }
                let id = self.alloc();
                self.nodes.insert(
                    id.to_string(),
                    NodeRecord::Text(TextRecord {
                        marker: TextMarker::TextNode,
                        text: text.to_string(),
                        is_visible: doc.is_visible(key),
                    }),
                );
                return Some(id);
            }
            NodeData::Unreadable(reason) => {
                debug!(key, reason = reason.as_str(), "dropping unreadable node");
                return None;
            }
            NodeData::Element(element) => element,
        };

        if SKIPPED_TAGS.contains(&element.tag.as_str()) {
            return None;
        }

        let id = self.alloc();
        let xpath = join_frames(frames, &doc.locator_path(key));
        let mut attributes: BTreeMap<String, String> = element.attributes.iter().cloned().collect();
        let mut children = Vec::new();

        match doc.frame(key) {
            Some(FrameAccess::Accessible(inner)) => {
                attributes.insert(FRAME_ID_ATTR.to_string(), xpath.clone());
                let mut chain = frames.to_vec();
                chain.push(doc.locator_path(key));
                if let Some(child) = inner.root().and_then(|root| self.visit(inner, root, &chain)) {
                    children.push(child);
                }
            }
            Some(FrameAccess::Inaccessible(block)) => {
                attributes.insert(FRAME_ID_ATTR.to_string(), xpath.clone());
                debug!(frame = xpath.as_str(), ?block, "skipping inaccessible frame");
            }
            None => {
                for &child in doc.children(key) {
                    if let Some(child_id) = self.visit(doc, child, frames) {
                        children.push(child_id);
                    }
                }
            }
        }

        let record = ElementRecord {
            tag_name: element.tag.clone(),
            attributes,
            xpath,
            children,
            is_visible: doc.is_visible(key),
            is_interactive: doc.is_interactive(key),
            is_top_element: is_topmost(doc, key),
        };
        self.nodes.insert(id.to_string(), NodeRecord::Element(record));
        Some(id)
    }
}

/// The element (or one of its descendants) is what a pointer at its center would hit.
/// Centers outside the viewport count as topmost.
fn is_topmost(doc: &Document, key: NodeKey) -> bool {
    let Ok(element) = doc.element(key) else {
        return false;
    };
    let (x, y) = element.rect.center();
    if !doc.viewport().contains(x, y) {
        return true;
    }
    doc.element_at_center(key)
        .is_some_and(|hit| doc.is_self_or_ancestor(key, hit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{DocumentSpec, NodeSpec, el};

    fn records(snapshot: &Snapshot) -> Vec<&ElementRecord> {
        snapshot.elements().collect()
    }

    fn by_tag<'a>(snapshot: &'a Snapshot, tag: &str) -> &'a ElementRecord {
        snapshot
            .elements()
            .find(|e| e.tag_name == tag)
            .unwrap_or_else(|| panic!("no <{tag}> in snapshot"))
    }

    #[test]
    fn test_children_reference_existing_ids() {
        let doc = DocumentSpec::new("https://example.test/")
            .root(
                el("html").child(
                    el("body")
                        .rect(0.0, 0.0, 1280.0, 800.0)
                        .text("   ")
                        .child(el("h1").rect(0.0, 0.0, 200.0, 40.0).text(" Title "))
                        .child(NodeSpec::unreadable("accessor threw"))
                        .child(el("script").text("var x = 1;"))
                        .child(el("button").attr("id", "go").rect(0.0, 50.0, 80.0, 30.0).text("Go")),
                ),
            )
            .build();

        let snapshot = Snapshotter::new().capture(&doc);
        for record in records(&snapshot) {
            for child in &record.children {
                assert!(snapshot.get(*child).is_some(), "dangling child id {child}");
            }
        }
        assert_eq!(snapshot.root.as_deref(), Some("0"));
        assert!(snapshot.elements().all(|e| e.tag_name != "script"));

        let texts: Vec<&str> = snapshot
            .nodes
            .values()
            .filter_map(|n| match n {
                NodeRecord::Text(t) => Some(t.text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(texts.len(), 2);
        assert!(texts.contains(&"Title"));
        // html, body, h1, button
        assert_eq!(records(&snapshot).len(), 4);
    }

    #[test]
    fn test_visibility_and_interactivity() {
        let doc = DocumentSpec::new("https://example.test/")
            .root(
                el("html").child(
                    el("body")
                        .rect(0.0, 0.0, 1280.0, 800.0)
                        .child(el("button").attr("id", "shown").rect(0.0, 0.0, 80.0, 30.0))
                        .child(el("button").attr("id", "collapsed").rect(0.0, 40.0, 0.0, 0.0))
                        .child(el("button").attr("id", "styled").rect(0.0, 80.0, 80.0, 30.0).hidden()),
                ),
            )
            .build();
        let snapshot = Snapshotter::new().capture(&doc);
        let find = |id: &str| {
            snapshot
                .elements()
                .find(|e| e.attributes.get("id").map(String::as_str) == Some(id))
                .unwrap()
        };
        assert!(find("shown").is_visible && find("shown").is_interactive);
        assert!(!find("collapsed").is_visible);
        assert!(!find("styled").is_visible);
        assert!(!by_tag(&snapshot, "body").is_interactive);
    }

    #[test]
    fn test_topmost_detects_occlusion() {
        let doc = DocumentSpec::new("https://example.test/")
            .viewport(1000.0, 600.0)
            .root(
                el("html").child(
                    el("body")
                        .rect(0.0, 0.0, 1000.0, 600.0)
                        .child(el("button").attr("id", "covered").rect(10.0, 10.0, 100.0, 40.0).text("Buy"))
                        .child(el("div").attr("id", "modal").rect(0.0, 0.0, 500.0, 500.0))
                        .child(el("a").attr("id", "below").rect(10.0, 2000.0, 100.0, 20.0)),
                ),
            )
            .build();
        let snapshot = Snapshotter::new().capture(&doc);
        let find = |id: &str| {
            snapshot
                .elements()
                .find(|e| e.attributes.get("id").map(String::as_str) == Some(id))
                .unwrap()
        };
        assert!(!find("covered").is_top_element);
        assert!(find("modal").is_top_element);
        // center is outside the viewport
        assert!(find("below").is_top_element);
    }

    #[test]
    fn test_frames_are_flattened_under_wrappers() {
        let inner = DocumentSpec::new("https://example.test/embed").root(
            el("html").child(
                el("body")
                    .rect(0.0, 0.0, 300.0, 200.0)
                    .child(el("a").attr("href", "/next").rect(0.0, 0.0, 50.0, 20.0).text("Next")),
            ),
        );
        let doc = DocumentSpec::new("https://example.test/")
            .root(
                el("html").child(
                    el("body")
                        .rect(0.0, 0.0, 1280.0, 800.0)
                        .child(el("iframe").rect(0.0, 0.0, 300.0, 200.0).frame_document(inner))
                        .child(el("iframe").rect(0.0, 300.0, 300.0, 200.0).cross_origin("https://ads.test/"))
                        .child(el("iframe").rect(0.0, 600.0, 10.0, 10.0).overlay()),
                ),
            )
            .build();

        let snapshot = Snapshotter::new().capture(&doc);
        let wrappers: Vec<&ElementRecord> = snapshot
            .elements()
            .filter(|e| e.tag_name == "iframe")
            .collect();
        assert_eq!(wrappers.len(), 3);
        assert!(wrappers.iter().all(|w| w.attributes.contains_key(FRAME_ID_ATTR)));

        let loaded = wrappers.iter().find(|w| !w.children.is_empty()).unwrap();
        assert_eq!(loaded.attributes[FRAME_ID_ATTR], "/html/body/iframe[1]");
        assert_eq!(wrappers.iter().filter(|w| w.children.is_empty()).count(), 2);

        let link = by_tag(&snapshot, "a");
        assert_eq!(link.xpath, "/html/body/iframe[1] >> /html/body/a");
    }

    #[test]
    fn test_rootless_document_is_empty() {
        let snapshot = Snapshotter::new().capture(&Document::new("about:blank"));
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.root, None);
        assert_eq!(snapshot.url, "about:blank");
    }

    #[test]
    fn test_wire_format() {
        let doc = DocumentSpec::new("https://example.test/")
            .root(el("html").rect(0.0, 0.0, 10.0, 10.0).text("hi"))
            .build();
        let value = serde_json::to_value(Snapshotter::new().capture(&doc)).unwrap();
        assert_eq!(value["nodes"]["0"]["tagName"], "html");
        assert_eq!(value["nodes"]["0"]["xpath"], "/html");
        assert_eq!(value["nodes"]["0"]["children"][0], 1);
        assert_eq!(value["nodes"]["1"]["type"], "TEXT_NODE");
        assert_eq!(value["nodes"]["1"]["isVisible"], true);
    }
}
