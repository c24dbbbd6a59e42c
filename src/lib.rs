//! Observe-plan-act engine for a live web page.
//!
//! Each tick the [`orchestrator`] asks the page side for a [`snapshot`], sends it to a remote
//! planner ([`brain`]), and hands the returned actions to the [`executor`], which finds their
//! targets with the [`resolver`] and replays them as human-paced input.

pub mod brain;
pub mod config;
pub mod dom;
pub mod executor;
pub mod face;
pub mod hands;
pub mod orchestrator;
pub mod page;
pub mod resolver;
pub mod snapshot;
pub mod store;
pub mod transport;
pub mod types;

pub use brain::{HttpPlanner, PlanRequest, PlanResponse, Planner, ScriptedPlanner};
pub use config::EngineConfig;
pub use executor::{Executor, ExecutorTiming};
pub use orchestrator::{Control, Notification, Orchestrator, OrchestratorConfig, OrchestratorHandle, TaskView};
pub use page::{MemoryPage, NodeAddress, Page, PageError};
pub use resolver::{Resolved, Resolver, RetryPolicy, Strategy};
pub use snapshot::{Snapshot, Snapshotter};
pub use store::{JsonFileStore, MemoryStore, StoreKey, TaskStore};
pub use transport::{PageLink, TransportTimeouts};
pub use types::{ActionResult, Locator, PlanStep, PlannedAction, Task, TaskStatus};
