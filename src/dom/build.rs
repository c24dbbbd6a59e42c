//! Document specs: the serialized capture format produced by the in-page reader, and the
//! builder used to assemble documents by hand.

use serde::{Deserialize, Serialize};

use super::{Document, Element, FrameContent, NodeData, NodeKey, Rect, Viewport};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSpec {
    pub url: String,
    #[serde(default)]
    pub viewport: Viewport,
    #[serde(default)]
    pub root: Option<NodeSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeSpec {
    Element(ElementSpec),
    Text { text: String },
    Unreadable { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementSpec {
    pub tag: String,
    #[serde(default)]
    pub attributes: Vec<(String, String)>,
    #[serde(default)]
    pub rect: Rect,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub children: Vec<NodeSpec>,
    #[serde(default)]
    pub frame: Option<FrameSpec>,
    #[serde(default)]
    pub probe: Option<Probe>,
}

/// Result of `elementFromPoint` at the element's center, as a pre-order index into the
/// same document.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Probe {
    pub hit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FrameSpec {
    Document(Box<DocumentSpec>),
    CrossOrigin { src: String },
    Overlay,
}

pub fn el(tag: &str) -> ElementSpec {
    ElementSpec {
        tag: tag.to_ascii_lowercase(),
        ..Default::default()
    }
}

pub fn text(content: &str) -> NodeSpec {
    NodeSpec::Text {
        text: content.to_string(),
    }
}

impl NodeSpec {
    pub fn unreadable(reason: &str) -> Self {
        NodeSpec::Unreadable {
            reason: reason.to_string(),
        }
    }
}

impl From<ElementSpec> for NodeSpec {
    fn from(spec: ElementSpec) -> Self {
        NodeSpec::Element(spec)
    }
}

impl ElementSpec {
    pub fn attr(mut self, name: &str, value: &str) -> Self {
        self.attributes.push((name.to_string(), value.to_string()));
        self
    }

    pub fn rect(mut self, x: f64, y: f64, width: f64, height: f64) -> Self {
        self.rect = Rect::new(x, y, width, height);
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn child(mut self, child: impl Into<NodeSpec>) -> Self {
        self.children.push(child.into());
        self
    }

    pub fn text(self, content: &str) -> Self {
        self.child(text(content))
    }

    pub fn frame_document(mut self, doc: DocumentSpec) -> Self {
        self.frame = Some(FrameSpec::Document(Box::new(doc)));
        self
    }

    pub fn cross_origin(mut self, src: &str) -> Self {
        self.frame = Some(FrameSpec::CrossOrigin {
            src: src.to_string(),
        });
        self
    }

    pub fn overlay(mut self) -> Self {
        self.frame = Some(FrameSpec::Overlay);
        self
    }

    pub fn probe(mut self, hit: Option<usize>) -> Self {
        self.probe = Some(Probe { hit });
        self
    }
}

impl DocumentSpec {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            viewport: Viewport::default(),
            root: None,
        }
    }

    pub fn viewport(mut self, width: f64, height: f64) -> Self {
        self.viewport = Viewport { width, height };
        self
    }

    pub fn root(mut self, root: impl Into<NodeSpec>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn build(self) -> Document {
        Document::from(self)
    }
}

impl From<DocumentSpec> for Document {
    fn from(spec: DocumentSpec) -> Self {
        let mut doc = Document::new(spec.url);
        doc.set_viewport(spec.viewport);
        let mut probes = Vec::new();
        if let Some(root) = spec.root {
            insert(&mut doc, None, root, &mut probes);
        }
        let len = doc.len();
        for (key, hit) in probes {
            doc.record_probe(key, hit.filter(|&h| h < len));
        }
        doc
    }
}

fn insert(
    doc: &mut Document,
    parent: Option<NodeKey>,
    spec: NodeSpec,
    probes: &mut Vec<(NodeKey, Option<NodeKey>)>,
) {
    match spec {
        NodeSpec::Text { text } => {
            doc.push(parent, NodeData::Text(text));
        }
        NodeSpec::Unreadable { reason } => {
            doc.push(parent, NodeData::Unreadable(reason));
        }
        NodeSpec::Element(element) => {
            let frame = element.frame.map(|frame| match frame {
                FrameSpec::Document(inner) => FrameContent::Loaded(Box::new(Document::from(*inner))),
                FrameSpec::CrossOrigin { src } => FrameContent::CrossOrigin { src },
                FrameSpec::Overlay => FrameContent::Overlay,
            });
            let key = doc.push(
                parent,
                NodeData::Element(Element {
                    tag: element.tag.to_ascii_lowercase(),
                    attributes: element.attributes,
                    rect: element.rect,
                    style_hidden: element.hidden,
                    frame,
                }),
            );
            if let Some(probe) = element.probe {
                probes.push((key, probe.hit));
            }
            for child in element.children {
                insert(doc, Some(key), child, probes);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::FrameAccess;

    #[test]
    fn test_capture_json_builds_document() {
        let raw = serde_json::json!({
            "url": "https://example.test/",
            "viewport": {"width": 800.0, "height": 600.0},
            "root": {
                "kind": "element",
                "tag": "HTML",
                "children": [{
                    "kind": "element",
                    "tag": "body",
                    "rect": {"x": 0.0, "y": 0.0, "width": 800.0, "height": 600.0},
                    "probe": {"hit": 0},
                    "children": [
                        {"kind": "text", "text": "hello"},
                        {"kind": "element", "tag": "div", "rect": {"x": 0.0, "y": 0.0, "width": 800.0, "height": 600.0}},
                        {"kind": "unreadable", "reason": "SecurityError"},
                        {"kind": "element", "tag": "iframe", "frame": {"kind": "cross_origin", "src": "https://ads.test/"}}
                    ]
                }]
            }
        });
        let spec: DocumentSpec = serde_json::from_value(raw).unwrap();
        let doc = Document::from(spec);

        assert_eq!(doc.len(), 6);
        assert_eq!(doc.element(0).unwrap().tag, "html");
        // the recorded probe wins over geometry, which would answer the div
        assert_eq!(doc.element_at_center(1), Some(0));
        assert!(doc.element(4).is_err());
        assert!(matches!(doc.frame(5), Some(FrameAccess::Inaccessible(_))));
    }
}
