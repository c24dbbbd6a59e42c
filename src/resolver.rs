//! Element resolver with a fixed fallback chain and bounded retry.
//!
//! Strategies run in order and the first hit wins:
//!
//! 1. exact element id
//! 2. selectors that pin an id
//! 3. locator path (main document, then the named frame, then every accessible frame)
//! 4. the remaining selectors
//! 5. id-pinning selectors with their ids wildcarded
//! 6. descriptive text over interactive elements
//!
//! Every scope search walks the main document first and then each accessible frame in
//! document order. Resolution never changes the document.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dom::{Document, FrameAccess, NodeKey, Rect, Selector, normalize_text, split_frames};
use crate::page::{NodeAddress, Page, PageError};
use crate::types::Locator;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no element matches {locator} after {attempts} attempts")]
    NotFound { locator: String, attempts: u32 },

    #[error(transparent)]
    Page(#[from] PageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    ElementId,
    IdSelector,
    LocatorPath,
    Selector,
    GenericSelector,
    Text,
}

impl Strategy {
    pub fn chain() -> [Strategy; 6] {
        [
            Strategy::ElementId,
            Strategy::IdSelector,
            Strategy::LocatorPath,
            Strategy::Selector,
            Strategy::GenericSelector,
            Strategy::Text,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::ElementId => "element-id",
            Strategy::IdSelector => "id-selector",
            Strategy::LocatorPath => "locator-path",
            Strategy::Selector => "selector",
            Strategy::GenericSelector => "generic-selector",
            Strategy::Text => "text",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What the caller will do with the element. Clicks on hidden nodes get a visible
/// stand-in when one is close by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Click,
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub address: NodeAddress,
    pub strategy: Strategy,
    pub rect: Rect,
    pub visible: bool,
    /// The located node was hidden and a visible sibling-level control was used instead.
    pub substituted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Wait `attempt * backoff_unit` after each failed attempt except the last.
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_unit: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff_unit * attempt
    }
}

/// A document searched by the resolver, with the frame chain that leads to it.
struct Scope<'a> {
    frames: Vec<String>,
    doc: &'a Document,
}

impl<'a> Scope<'a> {
    fn hit(&self, key: NodeKey) -> Hit<'a> {
        Hit {
            frames: self.frames.clone(),
            doc: self.doc,
            key,
        }
    }
}

struct Hit<'a> {
    frames: Vec<String>,
    doc: &'a Document,
    key: NodeKey,
}

fn scopes(doc: &Document) -> Vec<Scope<'_>> {
    let mut out = vec![Scope {
        frames: Vec::new(),
        doc,
    }];
    let mut next = 0;
    while next < out.len() {
        let (frames, current) = (out[next].frames.clone(), out[next].doc);
        for key in current.elements() {
            if let Some(FrameAccess::Accessible(inner)) = current.frame(key) {
                let mut chain = frames.clone();
                chain.push(current.locator_path(key));
                out.push(Scope {
                    frames: chain,
                    doc: inner,
                });
            }
        }
        next += 1;
    }
    out
}

#[derive(Debug, Clone, Default)]
pub struct Resolver {
    policy: RetryPolicy,
}

impl Resolver {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Resolve against the live page, re-reading it on every attempt.
    pub async fn resolve(
        &self,
        page: &dyn Page,
        locator: &Locator,
        intent: Intent,
    ) -> Result<Resolved, ResolveError> {
        let attempts = self.policy.attempts.max(1);
        for attempt in 1..=attempts {
            match page.capture().await {
                Ok(doc) => {
                    if let Some(found) = resolve_in(&doc, locator, intent) {
                        info!(
                            strategy = %found.strategy,
                            address = %found.address,
                            attempt,
                            "resolved {locator}"
                        );
                        return Ok(found);
                    }
                    debug!(attempt, "no match for {locator}");
                }
                Err(e) => warn!(attempt, "could not read page while resolving: {e}"),
            }
            if attempt < attempts {
                tokio::time::sleep(self.policy.delay_after(attempt)).await;
            }
        }
        Err(ResolveError::NotFound {
            locator: locator.to_string(),
            attempts,
        })
    }
}

/// One pass of the strategy chain over an already captured document.
pub fn resolve_in(doc: &Document, locator: &Locator, intent: Intent) -> Option<Resolved> {
    let scopes = scopes(doc);
    let parsed: Vec<Selector> = locator
        .selectors
        .iter()
        .filter(|s| !s.trim().is_empty())
        .filter_map(|s| match Selector::parse(s) {
            Ok(selector) => Some(selector),
            Err(e) => {
                debug!("skipping selector {s:?}: {e}");
                None
            }
        })
        .collect();

    for strategy in Strategy::chain() {
        let hit = match strategy {
            Strategy::ElementId => by_id(&scopes, locator),
            Strategy::IdSelector => first_selector_hit(&scopes, parsed.iter().filter(|s| s.has_id_fragment())),
            Strategy::LocatorPath => by_path(doc, &scopes, locator),
            Strategy::Selector => first_selector_hit(&scopes, parsed.iter().filter(|s| !s.has_id_fragment())),
            Strategy::GenericSelector => {
                let generic: Vec<Selector> = parsed.iter().filter_map(Selector::wildcard_ids).collect();
                first_selector_hit(&scopes, generic.iter())
            }
            Strategy::Text => by_text(&scopes, locator),
        };
        if let Some(hit) = hit {
            return Some(finish(hit, strategy, intent));
        }
    }
    None
}

fn by_id<'a>(scopes: &[Scope<'a>], locator: &Locator) -> Option<Hit<'a>> {
    let id = locator.id.as_deref().map(str::trim).filter(|id| !id.is_empty())?;
    scopes
        .iter()
        .find_map(|scope| scope.doc.element_by_id(id).map(|key| scope.hit(key)))
}

fn first_selector_hit<'a, 's>(
    scopes: &[Scope<'a>],
    selectors: impl Iterator<Item = &'s Selector>,
) -> Option<Hit<'a>> {
    for selector in selectors {
        for scope in scopes {
            if let Some(key) = scope.doc.query_selector(selector) {
                return Some(scope.hit(key));
            }
        }
    }
    None
}

fn by_path<'a>(doc: &'a Document, scopes: &[Scope<'a>], locator: &Locator) -> Option<Hit<'a>> {
    let raw = locator.path.as_deref().map(str::trim).filter(|p| !p.is_empty())?;
    let (frames, inner) = split_frames(raw);

    if frames.is_empty() {
        if let Some(key) = doc.evaluate_path(inner) {
            return Some(scopes[0].hit(key));
        }
    } else {
        let address = NodeAddress::parse(raw);
        if let Some((frame_doc, key)) = address.locate(doc) {
            return Some(Hit {
                frames: address.frames,
                doc: frame_doc,
                key,
            });
        }
    }

    scopes
        .iter()
        .skip(1)
        .find_map(|scope| scope.doc.evaluate_path(inner).map(|key| scope.hit(key)))
}

const TEXT_ATTRIBUTES: [&str; 4] = ["aria-label", "title", "alt", "placeholder"];

fn by_text<'a>(scopes: &[Scope<'a>], locator: &Locator) -> Option<Hit<'a>> {
    let needle = normalize_text(locator.text.as_deref()?);
    if needle.is_empty() {
        return None;
    }

    // rank: 0 visible exact, 1 visible contains, 2 hidden exact, 3 hidden contains
    let mut best: Option<(u8, Hit<'a>)> = None;
    for scope in scopes {
        for key in scope.doc.elements() {
            if !scope.doc.is_interactive(key) {
                continue;
            }
            let Some(exact) = text_match(scope.doc, key, &needle) else {
                continue;
            };
            let rank = match (scope.doc.is_visible(key), exact) {
                (true, true) => 0,
                (true, false) => 1,
                (false, true) => 2,
                (false, false) => 3,
            };
            if best.as_ref().is_none_or(|(r, _)| rank < *r) {
                best = Some((rank, scope.hit(key)));
                if rank == 0 {
                    return best.map(|(_, hit)| hit);
                }
            }
        }
    }
    best.map(|(_, hit)| hit)
}

/// `Some(true)` for an exact match on any label, `Some(false)` when one only contains the
/// needle.
fn text_match(doc: &Document, key: NodeKey, needle: &str) -> Option<bool> {
    let element = doc.element(key).ok()?;
    let mut labels = vec![normalize_text(&doc.text_content(key))];
    labels.extend(
        TEXT_ATTRIBUTES
            .iter()
            .filter_map(|name| element.attr(name))
            .map(normalize_text),
    );
    labels.retain(|l| !l.is_empty());

    if labels.iter().any(|l| l == needle) {
        Some(true)
    } else if labels.iter().any(|l| l.contains(needle)) {
        Some(false)
    } else {
        None
    }
}

/// Nearest visible interactive control under the hidden node's parent.
fn visible_substitute(doc: &Document, key: NodeKey) -> Option<NodeKey> {
    let parent = doc.parent_element(key)?;
    doc.subtree(parent).into_iter().skip(1).find(|&k| {
        k != key && doc.element(k).is_ok() && doc.is_visible(k) && doc.is_interactive(k)
    })
}

fn finish(hit: Hit<'_>, strategy: Strategy, intent: Intent) -> Resolved {
    let mut key = hit.key;
    let mut visible = hit.doc.is_visible(key);
    let mut substituted = false;

    if intent == Intent::Click && !visible {
        if let Some(sub) = visible_substitute(hit.doc, key) {
            debug!(
                from = %hit.doc.locator_path(key),
                to = %hit.doc.locator_path(sub),
                "clicking visible substitute for hidden target"
            );
            key = sub;
            visible = true;
            substituted = true;
        }
    }

    Resolved {
        address: NodeAddress::new(hit.frames, hit.doc.locator_path(key)),
        strategy,
        rect: hit.doc.element(key).map(|e| e.rect).unwrap_or_default(),
        visible,
        substituted,
    }
}
