//! Locator paths: absolute, XPath-compatible child steps such as `/html/body/div[2]/a`.
//!
//! An index is only written when a parent holds more than one child with the same tag, so a
//! path survives mutations that keep the sibling tag composition intact. Paths inside frames
//! are prefixed with the frame element's own path, joined by [`FRAME_SEPARATOR`].

use super::{Document, NodeKey};

pub const FRAME_SEPARATOR: &str = " >> ";

/// Split a locator path into its frame chain and the path inside the innermost document.
pub fn split_frames(path: &str) -> (Vec<&str>, &str) {
    let mut parts: Vec<&str> = path.split(FRAME_SEPARATOR).map(str::trim).collect();
    let inner = parts.pop().unwrap_or_default();
    (parts, inner)
}

pub fn join_frames<S: AsRef<str>>(frames: &[S], inner: &str) -> String {
    let mut out = String::new();
    for frame in frames {
        out.push_str(frame.as_ref());
        out.push_str(FRAME_SEPARATOR);
    }
    out.push_str(inner);
    out
}

struct Step<'a> {
    tag: &'a str,
    index: Option<usize>,
}

fn parse_steps(path: &str) -> Option<Vec<Step<'_>>> {
    let rest = path.trim().strip_prefix('/')?;
    rest.split('/')
        .map(|raw| {
            let raw = raw.trim();
            if raw.is_empty() {
                return None;
            }
            match raw.split_once('[') {
                Some((tag, idx)) => {
                    let index = idx.strip_suffix(']')?.trim().parse::<usize>().ok()?;
                    (index > 0).then_some(Step {
                        tag,
                        index: Some(index),
                    })
                }
                None => Some(Step {
                    tag: raw,
                    index: None,
                }),
            }
        })
        .collect()
}

impl Document {
    /// Same-tag sibling index (1-based) and count among the element children of `key`'s parent.
    fn sibling_position(&self, key: NodeKey, tag: &str) -> (usize, usize) {
        let Some(parent) = self.parent(key) else {
            return (1, 1);
        };
        let mut position = 1;
        let mut count = 0;
        for &sibling in self.children(parent) {
            if self.element(sibling).is_ok_and(|e| e.tag == tag) {
                count += 1;
                if sibling == key {
                    position = count;
                }
            }
        }
        (position, count)
    }

    pub fn locator_path(&self, key: NodeKey) -> String {
        let mut steps = Vec::new();
        let mut current = Some(key);
        while let Some(k) = current {
            if let Ok(element) = self.element(k) {
                let (position, count) = self.sibling_position(k, &element.tag);
                if count > 1 {
                    steps.push(format!("{}[{}]", element.tag, position));
                } else {
                    steps.push(element.tag.clone());
                }
            }
            current = self.parent(k);
        }
        steps.reverse();
        format!("/{}", steps.join("/"))
    }

    /// Evaluate a path (without frame prefix) against this document.
    pub fn evaluate_path(&self, path: &str) -> Option<NodeKey> {
        let steps = parse_steps(path)?;
        let (first, rest) = steps.split_first()?;

        let root = self.root?;
        let root_tag = &self.element(root).ok()?.tag;
        if !root_tag.eq_ignore_ascii_case(first.tag) || first.index.is_some_and(|i| i != 1) {
            return None;
        }

        let mut current = root;
        for step in rest {
            let index = step.index.unwrap_or(1);
            current = self
                .children(current)
                .iter()
                .copied()
                .filter(|&c| {
                    self.element(c)
                        .is_ok_and(|e| e.tag.eq_ignore_ascii_case(step.tag))
                })
                .nth(index - 1)?;
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{DocumentSpec, el};

    fn doc() -> Document {
        DocumentSpec::new("https://example.test/")
            .root(
                el("html").child(
                    el("body")
                        .child(el("div").child(el("a").attr("id", "first")))
                        .child(el("p"))
                        .child(
                            el("div")
                                .child(el("span"))
                                .child(el("a").attr("id", "second"))
                                .child(el("a").attr("id", "third")),
                        ),
                ),
            )
            .build()
    }

    #[test]
    fn test_paths_only_index_ambiguous_tags() {
        let doc = doc();
        let first = doc.element_by_id("first").unwrap();
        let third = doc.element_by_id("third").unwrap();
        assert_eq!(doc.locator_path(first), "/html/body/div[1]/a");
        assert_eq!(doc.locator_path(third), "/html/body/div[2]/a[2]");
        let p = doc.evaluate_path("/html/body/p").unwrap();
        assert_eq!(doc.locator_path(p), "/html/body/p");
    }

    #[test]
    fn test_every_element_path_round_trips() {
        let doc = doc();
        for key in doc.elements() {
            assert_eq!(doc.evaluate_path(&doc.locator_path(key)), Some(key));
        }
    }

    #[test]
    fn test_svg_icon_paths() {
        let doc = DocumentSpec::new("https://example.test/")
            .root(
                el("html").child(
                    el("body").child(
                        el("button").child(
                            el("svg")
                                .child(el("path").attr("id", "outline"))
                                .child(el("path").attr("id", "fill")),
                        ),
                    ),
                ),
            )
            .build();
        let fill = doc.element_by_id("fill").unwrap();
        assert_eq!(doc.locator_path(fill), "/html/body/button/svg/path[2]");
        assert_eq!(doc.evaluate_path("/html/body/button/SVG/path[2]"), Some(fill));
    }

    #[test]
    fn test_bad_paths() {
        let doc = doc();
        assert_eq!(doc.evaluate_path("html/body"), None);
        assert_eq!(doc.evaluate_path("/html/body/div[9]"), None);
        assert_eq!(doc.evaluate_path("/html/body/div[0]"), None);
        assert_eq!(doc.evaluate_path("/body"), None);
    }

    #[test]
    fn test_split_frames() {
        let (frames, inner) = split_frames("/html/body/iframe >> /html/body/a");
        assert_eq!(frames, vec!["/html/body/iframe"]);
        assert_eq!(inner, "/html/body/a");
        assert_eq!(join_frames(&frames, inner), "/html/body/iframe >> /html/body/a");

        let (frames, inner) = split_frames("/html/body");
        assert!(frames.is_empty());
        assert_eq!(inner, "/html/body");
    }
}
