//! Runs planned actions against the page with human-like pacing.
//!
//! Each action is isolated: a failure becomes a failed [`ActionResult`] and the next action
//! still runs. Delays are `tokio::time::sleep`s so a paused test clock runs them instantly.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::page::{DomEvent, NodeAddress, Page, PageError};
use crate::resolver::{Intent, ResolveError, Resolved, Resolver};
use crate::types::{ActionResult, Locator, PlanStep, PlannedAction};

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Page(#[from] PageError),

    #[error("invalid destination '{url}': {reason}")]
    BadUrl { url: String, reason: String },
}

/// A randomized delay between `min_ms` and `max_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jitter {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl Jitter {
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    pub fn sample(&self) -> Duration {
        let span = self.max_ms.saturating_sub(self.min_ms) as f64;
        Duration::from_millis(self.min_ms + (rand::random::<f64>() * span) as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorTiming {
    pub post_action_ms: u64,
    pub navigate_settle_ms: u64,
    /// Full re-resolutions after the resolver's own retries give up.
    pub resolve_retries: u32,
    pub resolve_retry_delay_ms: u64,
    pub click_jitter: Jitter,
    pub key_delay: Jitter,
    /// Probability of a pause after any keystroke.
    pub hesitation_chance: f64,
    pub hesitation: Jitter,
    pub show_cursor: bool,
}

impl Default for ExecutorTiming {
    fn default() -> Self {
        Self {
            post_action_ms: 1000,
            navigate_settle_ms: 1500,
            resolve_retries: 2,
            resolve_retry_delay_ms: 1000,
            click_jitter: Jitter::new(40, 120),
            key_delay: Jitter::new(50, 150),
            hesitation_chance: 0.05,
            hesitation: Jitter::new(300, 900),
            show_cursor: true,
        }
    }
}

pub struct Executor {
    page: Arc<dyn Page>,
    resolver: Resolver,
    timing: ExecutorTiming,
}

impl Executor {
    pub fn new(page: Arc<dyn Page>, resolver: Resolver, timing: ExecutorTiming) -> Self {
        Self {
            page,
            resolver,
            timing,
        }
    }

    /// One result per step, in order. Never stops early.
    pub async fn execute_all(&self, steps: &[PlanStep]) -> Vec<ActionResult> {
        let mut results = Vec::with_capacity(steps.len());
        for (index, step) in steps.iter().enumerate() {
            let result = self.execute_step(step).await;
            debug!(index, success = result.success, "{}", result.message);
            results.push(result);
        }
        results
    }

    pub async fn execute_step(&self, step: &PlanStep) -> ActionResult {
        match step {
            PlanStep::Action(action) => self.execute_one(action).await,
            PlanStep::Rejected { error, .. } => {
                warn!("rejected action: {error}");
                ActionResult::failed(error.to_string())
            }
        }
    }

    pub async fn execute_one(&self, action: &PlannedAction) -> ActionResult {
        info!(kind = action.kind(), "executing action");
        let outcome = self.run(action).await;

        if self.timing.show_cursor {
            if let Err(e) = self.page.show_cursor(None).await {
                debug!("could not hide cursor: {e}");
            }
        }
        tokio::time::sleep(Duration::from_millis(self.timing.post_action_ms)).await;

        match outcome {
            Ok(message) => ActionResult::ok(message),
            Err(e) => {
                warn!(kind = action.kind(), "action failed: {e}");
                ActionResult::failed(e.to_string())
            }
        }
    }

    async fn run(&self, action: &PlannedAction) -> Result<String, ExecuteError> {
        match action {
            PlannedAction::Click { target } => {
                let resolved = self.locate(target, Intent::Click).await?;
                self.click(&resolved.address).await?;
                Ok(format!("clicked {}", resolved.address))
            }
            PlannedAction::Input { target, text } => {
                let resolved = self.locate(target, Intent::Other).await?;
                self.type_text(&resolved.address, text).await?;
                Ok(format!("typed {} characters into {}", text.chars().count(), resolved.address))
            }
            PlannedAction::Scroll { target, amount } => {
                let resolved = self.locate(target, Intent::Other).await?;
                self.page.scroll_by(&resolved.address, *amount).await?;
                Ok(format!("scrolled {} by {amount}px", resolved.address))
            }
            PlannedAction::Navigate { url } => {
                let destination = self.destination(url).await?;
                self.page.navigate(destination.as_str()).await?;
                tokio::time::sleep(Duration::from_millis(self.timing.navigate_settle_ms)).await;
                Ok(format!("navigated to {destination}"))
            }
        }
    }

    /// Resolve with outer retries, then bring the element into view.
    async fn locate(&self, target: &Locator, intent: Intent) -> Result<Resolved, ExecuteError> {
        let mut attempt = 0;
        let resolved = loop {
            match self.resolver.resolve(self.page.as_ref(), target, intent).await {
                Ok(resolved) => break resolved,
                Err(e) if attempt < self.timing.resolve_retries => {
                    attempt += 1;
                    debug!(attempt, "re-resolving after: {e}");
                    tokio::time::sleep(Duration::from_millis(self.timing.resolve_retry_delay_ms)).await;
                }
                Err(e) => return Err(e.into()),
            }
        };

        let rect = self.page.scroll_into_view(&resolved.address).await?;
        if self.timing.show_cursor {
            if let Err(e) = self.page.show_cursor(Some(rect.center())).await {
                debug!("could not move cursor: {e}");
            }
        }
        Ok(resolved)
    }

    async fn click(&self, address: &NodeAddress) -> Result<(), PageError> {
        for event in [DomEvent::PointerOver, DomEvent::PointerDown, DomEvent::PointerUp] {
            self.page.dispatch(address, event).await?;
            tokio::time::sleep(self.timing.click_jitter.sample()).await;
        }
        self.page.dispatch(address, DomEvent::Click).await
    }

    async fn type_text(&self, address: &NodeAddress, text: &str) -> Result<(), PageError> {
        self.page.dispatch(address, DomEvent::Focus).await?;
        let mut typed = String::with_capacity(text.len());
        self.page.set_value(address, &typed).await?;

        for c in text.chars() {
            self.page.dispatch(address, DomEvent::KeyDown(c)).await?;
            typed.push(c);
            self.page.set_value(address, &typed).await?;
            self.page.dispatch(address, DomEvent::KeyUp(c)).await?;

            tokio::time::sleep(self.timing.key_delay.sample()).await;
            if rand::random::<f64>() < self.timing.hesitation_chance {
                tokio::time::sleep(self.timing.hesitation.sample()).await;
            }
        }

        self.page.dispatch(address, DomEvent::Input).await?;
        self.page.dispatch(address, DomEvent::Change).await
    }

    /// Absolute destination; relative ones are joined onto the current page.
    async fn destination(&self, raw: &str) -> Result<Url, ExecuteError> {
        let bad = |reason: String| ExecuteError::BadUrl {
            url: raw.to_string(),
            reason,
        };
        match Url::parse(raw) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let current = self.page.url().await?;
                Url::parse(&current)
                    .and_then(|base| base.join(raw))
                    .map_err(|e| bad(e.to_string()))
            }
            Err(e) => Err(bad(e.to_string())),
        }
    }
}
