//! Task orchestration.
//!
//! The coordinator is a single tokio task that owns the [`Task`] and its state machine:
//!
//! ```text
//! idle --start--> running <--pause/resume--> paused
//! running --done / domain change--> completed
//! running --planner failure--> error
//! running|paused --stop--> idle        any --reset--> idle (fresh id)
//! ```
//!
//! A fixed-period ticker drives iterations. Each iteration runs in its own task and reports
//! back over a channel, so commands are served while it is in flight. Only one iteration per
//! task may be outstanding; ticks that arrive meanwhile are dropped.
//!
//! Nothing is ever aborted. Stop, reset and the terminal transitions bump the generation: work
//! started under an older one finishes on its own and its outcome is thrown away. While such a
//! superseded iteration may still be acting on the page, no new iteration starts.

mod completion;
mod iteration;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub use completion::CompletionEvidence;
use iteration::{Iteration, Outcome, Report};

use crate::brain::Planner;
use crate::config::EngineConfig;
use crate::store::{StoreError, StoreKey, TaskStore, load, save};
use crate::transport::{PageLink, TaskIdentity};
use crate::types::{PlanningRecord, ProcessingStatus, Task, TaskStatus};

const COMMAND_CAPACITY: usize = 16;
const EVENT_CAPACITY: usize = 128;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum OrchestratorError {
    #[error("cannot {command} while {status:?}")]
    InvalidTransition {
        command: &'static str,
        status: TaskStatus,
    },

    #[error("orchestrator has shut down")]
    Closed,

    #[error("task state could not be restored: {0}")]
    Restore(String),
}

impl From<StoreError> for OrchestratorError {
    fn from(e: StoreError) -> Self {
        OrchestratorError::Restore(e.to_string())
    }
}

/// Commands a control surface can issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Control {
    Start { description: String },
    Pause,
    Resume,
    Stop,
    Reset,
    /// Declare the session finished.
    Complete,
}

impl Control {
    pub fn name(&self) -> &'static str {
        match self {
            Control::Start { .. } => "start",
            Control::Pause => "pause",
            Control::Resume => "resume",
            Control::Stop => "stop",
            Control::Reset => "reset",
            Control::Complete => "complete",
        }
    }
}

/// Events pushed to every subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    StatusChanged { task_id: String, status: TaskStatus },
    Iteration { task_id: String, iteration: u32 },
    ActionRejected { iteration: u32, error: String },
    LimitReached { iterations: u32 },
    Recovered { reason: String },
    DomainChanged { from: String, to: String },
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub task: Task,
    pub last_result: Option<PlanningRecord>,
    pub in_flight: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrchestratorConfig {
    pub tick_interval: Duration,
    pub max_iterations: u32,
    pub stuck_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for OrchestratorConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            max_iterations: config.max_iterations,
            stuck_timeout: config.stuck_timeout(),
        }
    }
}

enum Command {
    Control(Control, oneshot::Sender<Result<TaskView, OrchestratorError>>),
    Status(oneshot::Sender<TaskView>),
}

#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<Notification>,
}

impl OrchestratorHandle {
    pub async fn send(&self, control: Control) -> Result<TaskView, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Control(control, reply))
            .await
            .map_err(|_| OrchestratorError::Closed)?;
        rx.await.map_err(|_| OrchestratorError::Closed)?
    }

    pub async fn start(&self, description: impl Into<String>) -> Result<TaskView, OrchestratorError> {
        self.send(Control::Start {
            description: description.into(),
        })
        .await
    }

    pub async fn pause(&self) -> Result<TaskView, OrchestratorError> {
        self.send(Control::Pause).await
    }

    pub async fn resume(&self) -> Result<TaskView, OrchestratorError> {
        self.send(Control::Resume).await
    }

    pub async fn stop(&self) -> Result<TaskView, OrchestratorError> {
        self.send(Control::Stop).await
    }

    pub async fn reset(&self) -> Result<TaskView, OrchestratorError> {
        self.send(Control::Reset).await
    }

    pub async fn complete(&self) -> Result<TaskView, OrchestratorError> {
        self.send(Control::Complete).await
    }

    pub async fn status(&self) -> Result<TaskView, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Status(reply))
            .await
            .map_err(|_| OrchestratorError::Closed)?;
        rx.await.map_err(|_| OrchestratorError::Closed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.events.subscribe()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Work {
    Create,
    Iterate,
}

#[derive(Debug)]
struct InFlight {
    generation: u64,
    work: Work,
    /// Last time the processing status moved.
    since: Instant,
}

impl InFlight {
    fn new(generation: u64, work: Work) -> Self {
        Self {
            generation,
            work,
            since: Instant::now(),
        }
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    link: PageLink,
    planner: Arc<dyn Planner>,
    store: Arc<dyn TaskStore>,
    events: broadcast::Sender<Notification>,

    task: Task,
    last_result: Option<PlanningRecord>,
    generation: u64,
    /// Mirrors `generation` so running iterations can tell they were superseded.
    current: watch::Sender<u64>,
    in_flight: Option<InFlight>,
    /// Superseded work that has not reported back yet.
    retired: Vec<InFlight>,
    /// Fire the next tick immediately.
    kick: bool,

    outcomes_tx: mpsc::Sender<Outcome>,
    outcomes_rx: Option<mpsc::Receiver<Outcome>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        link: PageLink,
        planner: Arc<dyn Planner>,
        store: Arc<dyn TaskStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (outcomes_tx, outcomes_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (current, _) = watch::channel(0);
        Self {
            config,
            link,
            planner,
            store,
            events,
            task: Task::fresh(),
            last_result: None,
            generation: 0,
            current,
            in_flight: None,
            retired: Vec::new(),
            kick: false,
            outcomes_tx,
            outcomes_rx: Some(outcomes_rx),
        }
    }

    /// Rebuild the task from the store. A running task resumes ticking; a paused one stays
    /// paused. Work that was in flight when the process died is not replayed.
    pub async fn restore(
        config: OrchestratorConfig,
        link: PageLink,
        planner: Arc<dyn Planner>,
        store: Arc<dyn TaskStore>,
    ) -> Result<Self, OrchestratorError> {
        let mut orchestrator = Self::new(config, link, planner, store.clone());
        let db = store.as_ref();

        let Some(id) = load::<String>(db, StoreKey::TaskId).await? else {
            info!("no stored task; starting idle");
            orchestrator.persist().await;
            return Ok(orchestrator);
        };

        let paused = load::<bool>(db, StoreKey::Paused).await?.unwrap_or(false);
        let mut status = load::<TaskStatus>(db, StoreKey::Status).await?.unwrap_or_default();
        if paused && status == TaskStatus::Running {
            status = TaskStatus::Paused;
        }
        let processing = match load::<ProcessingStatus>(db, StoreKey::ProcessingStatus).await? {
            Some(p @ (ProcessingStatus::Completed | ProcessingStatus::Error | ProcessingStatus::Paused)) => p,
            _ if status == TaskStatus::Paused => ProcessingStatus::Paused,
            _ => ProcessingStatus::Idle,
        };

        orchestrator.task = Task {
            id,
            description: load(db, StoreKey::Description).await?.unwrap_or_default(),
            status,
            iteration: load(db, StoreKey::Iterations).await?.unwrap_or(0),
            paused: status == TaskStatus::Paused,
            last_origin: load(db, StoreKey::LastOrigin).await?,
            processing,
        };
        orchestrator.last_result = load(db, StoreKey::LastResult).await?;
        orchestrator.kick = status == TaskStatus::Running;
        info!(
            task_id = %orchestrator.task.id,
            status = ?orchestrator.task.status,
            iteration = orchestrator.task.iteration,
            "restored task"
        );
        orchestrator.persist().await;
        Ok(orchestrator)
    }

    pub fn spawn(self) -> OrchestratorHandle {
        let (commands, rx) = mpsc::channel(COMMAND_CAPACITY);
        let handle = OrchestratorHandle {
            commands,
            events: self.events.clone(),
        };
        tokio::spawn(self.run(rx));
        handle
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let Some(mut outcomes) = self.outcomes_rx.take() else {
            return;
        };
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick of a fresh interval completes immediately
        ticker.tick().await;
        if self.kick {
            self.kick = false;
            self.on_tick().await;
        }

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                Some(outcome) = outcomes.recv() => self.on_outcome(outcome).await,
                _ = ticker.tick() => self.on_tick().await,
            }
            if self.kick {
                self.kick = false;
                ticker.reset_immediately();
            }
        }

        debug!(
            outstanding = self.in_flight.iter().count() + self.retired.len(),
            "orchestrator stopped"
        );
    }

    fn view(&self) -> TaskView {
        TaskView {
            task: self.task.clone(),
            last_result: self.last_result.clone(),
            in_flight: self.in_flight.is_some() || !self.retired.is_empty(),
        }
    }

    fn emit(&self, notification: Notification) {
        // no subscribers is fine
        let _ = self.events.send(notification);
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Status(reply) => {
                let _ = reply.send(self.view());
            }
            Command::Control(control, reply) => {
                let name = control.name();
                let result = self.apply(control).await.map(|()| self.view());
                if let Err(e) = &result {
                    debug!("rejected {name}: {e}");
                }
                let _ = reply.send(result);
            }
        }
    }

    async fn apply(&mut self, control: Control) -> Result<(), OrchestratorError> {
        let status = self.task.status;
        let invalid = |command| Err(OrchestratorError::InvalidTransition { command, status });

        match control {
            Control::Start { description } => {
                if status != TaskStatus::Idle {
                    return invalid("start");
                }
                self.bump_generation();
                self.task.description = description.clone();
                self.task.iteration = 0;
                self.task.paused = false;
                self.task.last_origin = None;
                self.task.processing = ProcessingStatus::Idle;
                self.last_result = None;
                self.remove(StoreKey::SessionStatus).await;
                self.remove(StoreKey::LastResult).await;
                self.set_status(TaskStatus::Running).await;

                info!(description = %description, "starting task");
                tokio::spawn(iteration::create(
                    self.generation,
                    description,
                    self.planner.clone(),
                    self.outcomes_tx.clone(),
                ));
                self.in_flight = Some(InFlight::new(self.generation, Work::Create));
            }
            Control::Pause => {
                if status != TaskStatus::Running {
                    return invalid("pause");
                }
                self.task.paused = true;
                self.task.processing = ProcessingStatus::Paused;
                self.set_status(TaskStatus::Paused).await;
            }
            Control::Resume => {
                if status != TaskStatus::Paused {
                    return invalid("resume");
                }
                self.task.paused = false;
                self.task.processing = ProcessingStatus::Idle;
                self.set_status(TaskStatus::Running).await;
            }
            Control::Stop => {
                if !matches!(status, TaskStatus::Running | TaskStatus::Paused) {
                    return invalid("stop");
                }
                self.halt();
                self.task.paused = false;
                self.task.processing = ProcessingStatus::Idle;
                self.set_status(TaskStatus::Idle).await;
            }
            Control::Reset => {
                self.halt();
                if let Err(e) = self.store.clear().await {
                    warn!("could not clear stored task: {e}");
                }
                self.task = Task::fresh();
                self.last_result = None;
                info!(task_id = %self.task.id, "task reset");
                self.set_status(TaskStatus::Idle).await;
            }
            Control::Complete => {
                if !matches!(status, TaskStatus::Running | TaskStatus::Paused) {
                    return invalid("complete");
                }
                if let Err(e) = save(self.store.as_ref(), StoreKey::SessionStatus, &TaskStatus::Completed).await {
                    warn!("could not record session completion: {e}");
                }
                // an in-flight iteration picks the flag up when it finishes
                if self.in_flight.is_none() {
                    self.evaluate_completion().await;
                }
            }
        }
        Ok(())
    }

    fn bump_generation(&mut self) {
        self.generation += 1;
        self.current.send_replace(self.generation);
    }

    /// Supersede outstanding work without interrupting it.
    fn halt(&mut self) {
        self.bump_generation();
        if let Some(work) = self.in_flight.take() {
            debug!(generation = work.generation, work = ?work.work, "superseding in-flight work");
            self.retired.push(work);
        }
    }

    /// Forget superseded work that went quiet for longer than the stuck timeout.
    fn expire_retired(&mut self) {
        let timeout = self.config.stuck_timeout;
        self.retired.retain(|work| {
            let quiet = work.since.elapsed() >= timeout;
            if quiet {
                warn!(generation = work.generation, work = ?work.work, "superseded work never reported back");
            }
            !quiet
        });
    }

    fn page_busy(&self) -> bool {
        self.retired.iter().any(|work| work.work == Work::Iterate)
    }

    async fn on_tick(&mut self) {
        if self.task.status != TaskStatus::Running || self.task.paused {
            return;
        }
        self.expire_retired();

        if let Some(in_flight) = &self.in_flight {
            let stalled = in_flight.since.elapsed();
            if stalled >= self.config.stuck_timeout {
                self.recover(stalled).await;
            } else {
                debug!("iteration still in flight; tick dropped");
            }
            return;
        }
        if self.page_busy() {
            debug!("superseded iteration still on the page; tick dropped");
            return;
        }

        if self.task.iteration >= self.config.max_iterations {
            self.limit_reached().await;
            return;
        }

        let prior_results = self
            .last_result
            .as_ref()
            .map(|r| r.results.clone())
            .unwrap_or_default();
        let iteration = Iteration {
            generation: self.generation,
            task_id: self.task.id.clone(),
            number: self.task.iteration,
            last_origin: self.task.last_origin.clone(),
            prior_results,
            link: self.link.clone(),
            planner: self.planner.clone(),
            outcomes: self.outcomes_tx.clone(),
            current: self.current.subscribe(),
        };
        debug!(iteration = self.task.iteration, "starting iteration");
        tokio::spawn(iteration.run());
        self.in_flight = Some(InFlight::new(self.generation, Work::Iterate));
    }

    /// Give up on in-flight work that stopped making progress. The work itself keeps running
    /// under a stale generation; only its outcome is ignored.
    async fn recover(&mut self, stalled: Duration) {
        let Some(stuck) = self.in_flight.take() else {
            return;
        };
        self.bump_generation();
        if stuck.work == Work::Create {
            self.fail(format!(
                "planning service never created the task ({}s without an answer)",
                stalled.as_secs()
            ))
            .await;
            return;
        }

        let stuck_in = self.task.processing;
        warn!(
            processing = ?stuck_in,
            stalled_ms = stalled.as_millis() as u64,
            "iteration stuck; abandoning it"
        );
        self.set_processing(ProcessingStatus::Completed).await;
        self.emit(Notification::Recovered {
            reason: format!("processing stayed {stuck_in:?} for {}s", stalled.as_secs()),
        });
    }

    async fn on_outcome(&mut self, outcome: Outcome) {
        let (generation, settled) = match &outcome {
            Outcome::Created { generation, .. } | Outcome::Finished { generation, .. } => (*generation, true),
            Outcome::Progress { generation, .. } => (*generation, false),
        };
        if generation != self.generation {
            self.on_stale(generation, settled);
            return;
        }

        match outcome {
            Outcome::Created { result, .. } => {
                self.in_flight = None;
                match result {
                    Ok(task_id) => {
                        self.task.id = task_id;
                        self.persist().await;
                        self.announce().await;
                        self.kick = true;
                    }
                    Err(e) => self.fail(format!("could not create task: {e}")).await,
                }
            }
            Outcome::Progress { status, .. } => {
                if self.in_flight.is_some() {
                    self.set_processing(status).await;
                }
            }
            Outcome::Finished { report, .. } => {
                if self.in_flight.take().is_none() {
                    return;
                }
                self.on_report(report).await;
            }
        }
    }

    fn on_stale(&mut self, generation: u64, settled: bool) {
        let Some(at) = self.retired.iter().position(|work| work.generation == generation) else {
            debug!(generation, current = self.generation, "discarding stale outcome");
            return;
        };
        if !settled {
            self.retired[at].since = Instant::now();
            return;
        }
        let work = self.retired.swap_remove(at);
        debug!(generation, work = ?work.work, "superseded work finished; outcome discarded");
        if work.work == Work::Iterate && !self.page_busy() && self.task.status == TaskStatus::Running {
            self.kick = true;
        }
    }

    async fn on_report(&mut self, report: Report) {
        match report {
            Report::Planned {
                record,
                rejected,
                origin,
            } => {
                for error in rejected {
                    warn!(iteration = record.iteration, "planner sent an unusable action: {error}");
                    self.emit(Notification::ActionRejected {
                        iteration: record.iteration,
                        error,
                    });
                }
                if self.task.last_origin.is_none() && origin.is_some() {
                    self.task.last_origin = origin;
                }
                self.last_result = Some(record);
                self.persist().await;

                if self.evaluate_completion().await {
                    return;
                }

                self.task.iteration += 1;
                self.task.processing = if self.task.paused {
                    ProcessingStatus::Paused
                } else {
                    ProcessingStatus::Idle
                };
                self.persist().await;
                info!(task_id = %self.task.id, iteration = self.task.iteration, "iteration complete");
                self.emit(Notification::Iteration {
                    task_id: self.task.id.clone(),
                    iteration: self.task.iteration,
                });
                self.announce().await;

                if self.task.iteration >= self.config.max_iterations {
                    self.limit_reached().await;
                }
            }
            Report::DomainChanged { from, to } => {
                info!(%from, %to, "page left the task's site; finishing");
                self.emit(Notification::DomainChanged { from, to });
                self.finish(TaskStatus::Completed).await;
            }
            Report::PageUnavailable(e) => {
                warn!("page unavailable; iteration not counted: {e}");
                self.set_processing(ProcessingStatus::Idle).await;
                self.evaluate_completion().await;
            }
            Report::PlannerFailed(e) => {
                self.fail(format!("planning service failed: {e}")).await;
            }
            Report::Superseded => debug!("iteration bowed out"),
        }
    }

    /// Finish the task when any completion signal is set.
    async fn evaluate_completion(&mut self) -> bool {
        let evidence = CompletionEvidence::gather(self.store.as_ref()).await;
        if !evidence.is_done() {
            return false;
        }
        info!(
            task_id = %self.task.id,
            sources = ?evidence.sources(),
            iterations = self.task.iteration,
            "task complete"
        );
        self.finish(TaskStatus::Completed).await;
        true
    }

    async fn limit_reached(&mut self) {
        warn!(
            task_id = %self.task.id,
            iterations = self.task.iteration,
            "iteration limit reached"
        );
        self.emit(Notification::LimitReached {
            iterations: self.task.iteration,
        });
        self.finish(TaskStatus::Idle).await;
    }

    async fn fail(&mut self, message: String) {
        error!(task_id = %self.task.id, "{message}");
        self.emit(Notification::Failed { message });
        self.task.processing = ProcessingStatus::Error;
        self.finish(TaskStatus::Error).await;
    }

    /// Leave the running/paused states for good (until the next start or reset).
    async fn finish(&mut self, status: TaskStatus) {
        self.halt();
        self.task.paused = false;
        if status != TaskStatus::Error {
            self.task.processing = ProcessingStatus::Idle;
        }
        self.set_status(status).await;
    }

    async fn set_status(&mut self, status: TaskStatus) {
        self.task.status = status;
        self.persist().await;
        info!(task_id = %self.task.id, ?status, "status changed");
        self.emit(Notification::StatusChanged {
            task_id: self.task.id.clone(),
            status,
        });
        self.announce().await;
    }

    async fn set_processing(&mut self, processing: ProcessingStatus) {
        if self.task.processing != processing {
            debug!(from = ?self.task.processing, to = ?processing, "processing");
            if let Some(in_flight) = &mut self.in_flight {
                in_flight.since = Instant::now();
            }
        }
        self.task.processing = processing;
        if let Err(e) = save(self.store.as_ref(), StoreKey::ProcessingStatus, &processing).await {
            warn!("could not persist processing status: {e}");
        }
    }

    /// Tell the page side who it is working for.
    async fn announce(&self) {
        self.link
            .notify(TaskIdentity {
                task_id: self.task.id.clone(),
                status: self.task.status,
                iteration: self.task.iteration,
            })
            .await;
    }

    async fn remove(&self, key: StoreKey) {
        if let Err(e) = self.store.remove(key).await {
            warn!("could not remove {key}: {e}");
        }
    }

    /// Write the whole task through to the store. Failures are logged; the in-memory task
    /// stays authoritative.
    async fn persist(&self) {
        let db = self.store.as_ref();
        let task = &self.task;
        let writes = [
            save(db, StoreKey::TaskId, &task.id).await,
            save(db, StoreKey::Description, &task.description).await,
            save(db, StoreKey::Status, &task.status).await,
            save(db, StoreKey::Iterations, &task.iteration).await,
            save(db, StoreKey::Paused, &task.paused).await,
            save(db, StoreKey::ProcessingStatus, &task.processing).await,
        ];
        let mut failures: Vec<StoreError> = writes.into_iter().filter_map(Result::err).collect();

        if let Some(origin) = &task.last_origin {
            if let Err(e) = save(db, StoreKey::LastOrigin, origin).await {
                failures.push(e);
            }
        } else if let Err(e) = db.remove(StoreKey::LastOrigin).await {
            failures.push(e);
        }
        if let Some(record) = &self.last_result {
            if let Err(e) = save(db, StoreKey::LastResult, record).await {
                failures.push(e);
            }
        }

        for e in failures {
            warn!("could not persist task state: {e}");
        }
    }
}
