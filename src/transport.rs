//! Message channel between the coordinator and the page-side agent.
//!
//! The agent is a tokio task that owns the page, the snapshotter and the executor. It serves
//! one request at a time. The coordinator talks to it through a [`PageLink`], where every
//! request is bounded by a timeout and an unanswered ping gets the agent respawned.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::executor::{Executor, ExecutorTiming};
use crate::page::{Page, PageError};
use crate::resolver::Resolver;
use crate::snapshot::{Snapshot, Snapshotter};
use crate::types::{ActionResult, PlanStep, TaskStatus};

const CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("page agent did not answer {request} within {waited:?}")]
    NoResponse { request: &'static str, waited: Duration },

    #[error("page agent is gone")]
    Closed,

    #[error("page agent could not reinstall its helpers: {0}")]
    Reinstall(String),

    #[error("page error: {0}")]
    Page(String),
}

/// Read-only task identity pushed to the page side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskIdentity {
    pub task_id: String,
    pub status: TaskStatus,
    pub iteration: u32,
}

pub enum PageRequest {
    /// Answered with the task id the agent last heard about.
    Ping(oneshot::Sender<Option<String>>),
    Snapshot(oneshot::Sender<Snapshot>),
    Url(oneshot::Sender<Result<String, PageError>>),
    Execute {
        steps: Vec<PlanStep>,
        reply: oneshot::Sender<Vec<ActionResult>>,
    },
    /// Fire-and-forget.
    Notify(TaskIdentity),
    Shutdown,
}

impl PageRequest {
    fn name(&self) -> &'static str {
        match self {
            PageRequest::Ping(_) => "ping",
            PageRequest::Snapshot(_) => "snapshot",
            PageRequest::Url(_) => "url",
            PageRequest::Execute { .. } => "execute",
            PageRequest::Notify(_) => "notify",
            PageRequest::Shutdown => "shutdown",
        }
    }
}

struct PageAgent {
    page: Arc<dyn Page>,
    snapshotter: Snapshotter,
    executor: Executor,
    identity: Option<TaskIdentity>,
}

impl PageAgent {
    async fn run(mut self, mut rx: mpsc::Receiver<PageRequest>) {
        while let Some(request) = rx.recv().await {
            debug!(request = request.name(), "page agent request");
            match request {
                PageRequest::Ping(reply) => {
                    let _ = reply.send(self.identity.as_ref().map(|i| i.task_id.clone()));
                }
                PageRequest::Snapshot(reply) => {
                    let _ = reply.send(self.snapshot().await);
                }
                PageRequest::Url(reply) => {
                    let _ = reply.send(self.page.url().await);
                }
                PageRequest::Execute { steps, reply } => {
                    let results = self.executor.execute_all(&steps).await;
                    let _ = reply.send(results);
                }
                PageRequest::Notify(identity) => {
                    debug!(task_id = %identity.task_id, status = ?identity.status, iteration = identity.iteration, "task update");
                    self.identity = Some(identity);
                }
                PageRequest::Shutdown => break,
            }
        }
        debug!("page agent stopped");
    }

    async fn snapshot(&self) -> Snapshot {
        match self.page.capture().await {
            Ok(doc) => self.snapshotter.capture(&doc),
            Err(e) => {
                warn!("page capture failed, sending empty snapshot: {e}");
                let url = self.page.url().await.unwrap_or_default();
                Snapshot::empty(&url)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportTimeouts {
    pub request_ms: u64,
    /// Executing a batch includes typing and settle delays, so it gets its own bound.
    pub execute_ms: u64,
}

impl Default for TransportTimeouts {
    fn default() -> Self {
        Self {
            request_ms: 5_000,
            execute_ms: 120_000,
        }
    }
}

/// Everything needed to (re)start an agent.
#[derive(Clone)]
struct AgentParts {
    page: Arc<dyn Page>,
    resolver: Resolver,
    timing: ExecutorTiming,
}

impl AgentParts {
    fn spawn(&self) -> AgentSlot {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let agent = PageAgent {
            page: self.page.clone(),
            snapshotter: Snapshotter::new(),
            executor: Executor::new(self.page.clone(), self.resolver.clone(), self.timing.clone()),
            identity: None,
        };
        AgentSlot {
            tx,
            handle: tokio::spawn(agent.run(rx)),
        }
    }
}

struct AgentSlot {
    tx: mpsc::Sender<PageRequest>,
    handle: JoinHandle<()>,
}

/// Coordinator-side handle to the page agent. Cheap to clone.
#[derive(Clone)]
pub struct PageLink {
    parts: AgentParts,
    slot: Arc<Mutex<AgentSlot>>,
    timeouts: TransportTimeouts,
    last_identity: Arc<std::sync::Mutex<Option<TaskIdentity>>>,
}

impl PageLink {
    pub fn spawn(
        page: Arc<dyn Page>,
        resolver: Resolver,
        timing: ExecutorTiming,
        timeouts: TransportTimeouts,
    ) -> Self {
        let parts = AgentParts {
            page,
            resolver,
            timing,
        };
        let slot = parts.spawn();
        Self {
            parts,
            slot: Arc::new(Mutex::new(slot)),
            timeouts,
            last_identity: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    async fn sender(&self) -> mpsc::Sender<PageRequest> {
        self.slot.lock().await.tx.clone()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> PageRequest,
        waited: Duration,
    ) -> Result<T, TransportError> {
        let (reply, rx) = oneshot::channel();
        let request = make(reply);
        let name = request.name();
        self.sender()
            .await
            .send(request)
            .await
            .map_err(|_| TransportError::Closed)?;
        match tokio::time::timeout(waited, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::NoResponse {
                request: name,
                waited,
            }),
        }
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.request_ms)
    }

    pub async fn ping(&self) -> Result<Option<String>, TransportError> {
        self.request(PageRequest::Ping, self.request_timeout()).await
    }

    pub async fn snapshot(&self) -> Result<Snapshot, TransportError> {
        self.request(PageRequest::Snapshot, self.request_timeout()).await
    }

    pub async fn url(&self) -> Result<String, TransportError> {
        self.request(PageRequest::Url, self.request_timeout())
            .await?
            .map_err(|e| TransportError::Page(e.to_string()))
    }

    pub async fn execute(&self, steps: Vec<PlanStep>) -> Result<Vec<ActionResult>, TransportError> {
        self.request(
            |reply| PageRequest::Execute { steps, reply },
            Duration::from_millis(self.timeouts.execute_ms),
        )
        .await
    }

    /// Push task identity to the agent without waiting.
    pub async fn notify(&self, identity: TaskIdentity) {
        if let Ok(mut last) = self.last_identity.lock() {
            *last = Some(identity.clone());
        }
        if let Err(e) = self.sender().await.try_send(PageRequest::Notify(identity)) {
            debug!("dropped task update for page agent: {e}");
        }
    }

    /// Ping the agent, respawning it when it does not answer, then make sure the page still
    /// has its helpers installed.
    pub async fn ensure_live(&self) -> Result<(), TransportError> {
        if let Err(e) = self.ping().await {
            warn!("page agent unresponsive ({e}); respawning");
            self.respawn().await;
            self.ping().await?;
        }

        if !self.parts.page.is_ready().await {
            info!("page helpers missing; reinstalling");
            self.parts
                .page
                .install()
                .await
                .map_err(|e| TransportError::Reinstall(e.to_string()))?;
        }
        Ok(())
    }

    async fn respawn(&self) {
        let mut slot = self.slot.lock().await;
        slot.handle.abort();
        *slot = self.parts.spawn();

        let identity = self.last_identity.lock().ok().and_then(|last| last.clone());
        if let Some(identity) = identity {
            let _ = slot.tx.try_send(PageRequest::Notify(identity));
        }
    }

    /// Stop the current agent. A later [`ensure_live`](Self::ensure_live) brings up a new one.
    pub async fn shutdown(&self) {
        let _ = self.sender().await.send(PageRequest::Shutdown).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{Document, DocumentSpec, Rect, el};
    use crate::page::{DomEvent, MemoryPage, NodeAddress};
    use crate::types::{Locator, PlannedAction};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn doc() -> DocumentSpec {
        DocumentSpec::new("https://shop.test/").root(
            el("html").child(
                el("body")
                    .rect(0.0, 0.0, 1280.0, 800.0)
                    .child(el("button").attr("id", "buy").rect(10.0, 10.0, 80.0, 30.0).text("Buy")),
            ),
        )
    }

    fn link(page: Arc<dyn Page>) -> PageLink {
        PageLink::spawn(page, Resolver::default(), ExecutorTiming::default(), TransportTimeouts::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_and_execute_round_trip() {
        let page = Arc::new(MemoryPage::new(doc()));
        let link = link(page.clone());

        let snapshot = link.snapshot().await.unwrap();
        assert!(snapshot.elements().any(|e| e.tag_name == "button"));

        let results = link
            .execute(vec![PlannedAction::click(Locator::by_id("buy")).unwrap().into()])
            .await
            .unwrap();
        assert!(results[0].success);
        assert!(page.events_for("/html/body/button").contains(&DomEvent::Click));
        assert_eq!(link.url().await.unwrap(), "https://shop.test/");
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_reaches_agent() {
        let link = link(Arc::new(MemoryPage::new(doc())));
        assert_eq!(link.ping().await.unwrap(), None);
        link.notify(TaskIdentity {
            task_id: "t-1".into(),
            status: TaskStatus::Running,
            iteration: 0,
        })
        .await;
        assert_eq!(link.ping().await.unwrap().as_deref(), Some("t-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_agent_is_respawned_with_identity() {
        let link = link(Arc::new(MemoryPage::new(doc())));
        link.notify(TaskIdentity {
            task_id: "t-2".into(),
            status: TaskStatus::Running,
            iteration: 3,
        })
        .await;
        link.shutdown().await;
        assert!(link.ping().await.is_err());

        link.ensure_live().await.unwrap();
        assert_eq!(link.ping().await.unwrap().as_deref(), Some("t-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_helpers_are_reinstalled() {
        let page = Arc::new(MemoryPage::new(doc()));
        let link = link(page.clone());
        page.unload_helpers();
        link.ensure_live().await.unwrap();
        assert!(page.is_ready().await);
    }

    /// A page whose reads hang until released.
    struct StallingPage {
        inner: MemoryPage,
        stalled: AtomicBool,
    }

    #[async_trait]
    impl Page for StallingPage {
        async fn capture(&self) -> Result<Document, PageError> {
            if self.stalled.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.inner.capture().await
        }
        async fn url(&self) -> Result<String, PageError> {
            self.inner.url().await
        }
        async fn scroll_into_view(&self, target: &NodeAddress) -> Result<Rect, PageError> {
            self.inner.scroll_into_view(target).await
        }
        async fn dispatch(&self, target: &NodeAddress, event: DomEvent) -> Result<(), PageError> {
            self.inner.dispatch(target, event).await
        }
        async fn set_value(&self, target: &NodeAddress, value: &str) -> Result<(), PageError> {
            self.inner.set_value(target, value).await
        }
        async fn value(&self, target: &NodeAddress) -> Result<String, PageError> {
            self.inner.value(target).await
        }
        async fn scroll_by(&self, target: &NodeAddress, amount: i64) -> Result<(), PageError> {
            self.inner.scroll_by(target, amount).await
        }
        async fn navigate(&self, url: &str) -> Result<(), PageError> {
            self.inner.navigate(url).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_agent_times_out_and_recovers() {
        let page = Arc::new(StallingPage {
            inner: MemoryPage::new(doc()),
            stalled: AtomicBool::new(true),
        });
        let link = link(page.clone());

        let err = link.snapshot().await.unwrap_err();
        assert!(matches!(err, TransportError::NoResponse { request: "snapshot", .. }));

        page.stalled.store(false, Ordering::SeqCst);
        link.ensure_live().await.unwrap();
        assert!(!link.snapshot().await.unwrap().is_empty());
    }
}
