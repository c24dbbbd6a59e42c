//! One observe-act cycle, run off the coordinator loop. Everything it learns goes back to the
//! coordinator as [`Outcome`] messages stamped with the generation it was started under.
//!
//! A cycle is never aborted from outside. It checks the coordinator's current generation
//! before it reads the page and again before it hands actions over, and bows out when it has
//! been superseded. A batch that already reached the page runs to the end.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use url::Url;

use crate::brain::{PlanRequest, Planner, PlannerError};
use crate::transport::{PageLink, TransportError};
use crate::types::{ActionResult, PlanStep, PlanningRecord, ProcessingStatus};

pub(crate) enum Outcome {
    Created {
        generation: u64,
        result: Result<String, PlannerError>,
    },
    Progress {
        generation: u64,
        status: ProcessingStatus,
    },
    Finished {
        generation: u64,
        report: Report,
    },
}

pub(crate) enum Report {
    Planned {
        record: PlanningRecord,
        rejected: Vec<String>,
        origin: Option<String>,
    },
    DomainChanged {
        from: String,
        to: String,
    },
    PageUnavailable(TransportError),
    PlannerFailed(PlannerError),
    /// Stopped before touching the page because a newer generation took over.
    Superseded,
}

/// Origin of a page url, or `None` for opaque origins such as `about:blank`.
pub(crate) fn origin_of(raw: &str) -> Option<String> {
    let origin = Url::parse(raw).ok()?.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}

pub(crate) async fn create(
    generation: u64,
    description: String,
    planner: Arc<dyn Planner>,
    outcomes: mpsc::Sender<Outcome>,
) {
    let result = planner.create_task(&description).await;
    let _ = outcomes.send(Outcome::Created { generation, result }).await;
}

pub(crate) struct Iteration {
    pub generation: u64,
    pub task_id: String,
    pub number: u32,
    pub last_origin: Option<String>,
    pub prior_results: Vec<ActionResult>,
    pub link: PageLink,
    pub planner: Arc<dyn Planner>,
    pub outcomes: mpsc::Sender<Outcome>,
    pub current: watch::Receiver<u64>,
}

impl Iteration {
    fn superseded(&self) -> bool {
        *self.current.borrow() != self.generation
    }

    pub(crate) async fn run(self) {
        let report = self.cycle().await;
        let _ = self
            .outcomes
            .send(Outcome::Finished {
                generation: self.generation,
                report,
            })
            .await;
    }

    async fn progress(&self, status: ProcessingStatus) {
        let _ = self
            .outcomes
            .send(Outcome::Progress {
                generation: self.generation,
                status,
            })
            .await;
    }

    async fn cycle(&self) -> Report {
        if self.superseded() {
            return Report::Superseded;
        }
        if let Err(e) = self.link.ensure_live().await {
            return Report::PageUnavailable(e);
        }

        let url = match self.link.url().await {
            Ok(url) => url,
            Err(e) => return Report::PageUnavailable(e),
        };
        let origin = origin_of(&url);
        if let (Some(from), Some(to)) = (&self.last_origin, &origin) {
            if from != to {
                return Report::DomainChanged {
                    from: from.clone(),
                    to: to.clone(),
                };
            }
        }

        self.progress(ProcessingStatus::Parsing).await;
        let snapshot = match self.link.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => return Report::PageUnavailable(e),
        };
        debug!(iteration = self.number, nodes = snapshot.len(), "snapshot taken");

        self.progress(ProcessingStatus::WaitingForServer).await;
        let request = PlanRequest {
            task_id: self.task_id.clone(),
            url,
            iteration: self.number,
            snapshot,
            prior_results: self.prior_results.clone(),
        };
        let plan = match self.planner.update(&request).await {
            Ok(plan) => plan,
            Err(e) => return Report::PlannerFailed(e),
        };
        info!(
            iteration = self.number,
            actions = plan.actions.len(),
            is_done = plan.is_done,
            "plan received"
        );

        let rejected = plan
            .actions
            .iter()
            .filter_map(|step| match step {
                PlanStep::Rejected { error, .. } => Some(error.to_string()),
                PlanStep::Action(_) => None,
            })
            .collect();

        if self.superseded() {
            debug!(iteration = self.number, "superseded; plan not executed");
            return Report::Superseded;
        }
        self.progress(ProcessingStatus::ExecutingActions).await;
        let results = if plan.actions.is_empty() {
            Vec::new()
        } else {
            match self.link.execute(plan.actions).await {
                Ok(results) => results,
                Err(e) => return Report::PageUnavailable(e),
            }
        };

        self.progress(ProcessingStatus::Updating).await;
        Report::Planned {
            record: PlanningRecord {
                iteration: self.number,
                is_done: plan.is_done,
                results,
            },
            rejected,
            origin,
        }
    }
}
