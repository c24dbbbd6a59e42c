//! Client for the remote planning service.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::snapshot::Snapshot;
use crate::types::{ActionResult, PlanStep};

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("planning service unreachable: {0}")]
    Request(#[from] reqwest::Error),

    #[error("planning service answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected planning response: {0}")]
    Decode(String),

    #[error("invalid planning service url '{0}'")]
    InvalidUrl(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRequest {
    pub task_id: String,
    pub url: String,
    pub iteration: u32,
    pub snapshot: Snapshot,
    pub prior_results: Vec<ActionResult>,
}

/// The planner's own reading of the page, when it shares one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerState {
    pub page_summary: String,
    pub evaluation_previous_goal: String,
    pub next_goal: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanResponse {
    #[serde(default)]
    pub actions: Vec<PlanStep>,
    #[serde(default)]
    pub is_done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_state: Option<PlannerState>,
}

impl PlanResponse {
    pub fn new(actions: Vec<PlanStep>, is_done: bool) -> Self {
        Self {
            actions,
            is_done,
            current_state: None,
        }
    }
}

/// Update replies arrive either bare or wrapped in a `result` envelope.
#[derive(Deserialize)]
#[serde(untagged)]
enum UpdateReply {
    Envelope { result: PlanResponse },
    Bare(PlanResponse),
}

#[async_trait]
pub trait Planner: Send + Sync {
    /// Register a task and return the id the service assigned.
    async fn create_task(&self, description: &str) -> Result<String, PlannerError>;

    async fn update(&self, request: &PlanRequest) -> Result<PlanResponse, PlannerError>;
}

pub struct HttpPlanner {
    client: Client,
    base: Url,
}

impl HttpPlanner {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, PlannerError> {
        let mut raw = base_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base = Url::parse(&raw).map_err(|_| PlannerError::InvalidUrl(base_url.to_string()))?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base })
    }

    fn endpoint(&self, path: &str) -> Result<Url, PlannerError> {
        self.base
            .join(path)
            .map_err(|_| PlannerError::InvalidUrl(format!("{}{path}", self.base)))
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value, PlannerError> {
        let url = self.endpoint(path)?;
        let response = self.client.post(url).json(body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "planning service error: {body}");
            return Err(PlannerError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl Planner for HttpPlanner {
    async fn create_task(&self, description: &str) -> Result<String, PlannerError> {
        let reply = self
            .post("tasks/create", &json!({ "task_description": description }))
            .await?;
        let task_id = reply["task_id"]
            .as_str()
            .ok_or_else(|| PlannerError::Decode(format!("no task_id in {reply}")))?;
        info!(task_id, "planning service created task");
        Ok(task_id.to_string())
    }

    async fn update(&self, request: &PlanRequest) -> Result<PlanResponse, PlannerError> {
        let body = serde_json::to_value(request).map_err(|e| PlannerError::Decode(e.to_string()))?;
        let reply = self.post("tasks/update", &body).await?;
        let plan = match serde_json::from_value::<UpdateReply>(reply) {
            Ok(UpdateReply::Envelope { result }) | Ok(UpdateReply::Bare(result)) => result,
            Err(e) => return Err(PlannerError::Decode(e.to_string())),
        };
        if let Some(state) = &plan.current_state {
            debug!(next_goal = %state.next_goal, "planner: {}", state.page_summary);
        }
        Ok(plan)
    }
}

/// Replays canned responses in order, then repeats a fallback. Records every request.
pub struct ScriptedPlanner {
    task_id: String,
    script: Mutex<VecDeque<PlanResponse>>,
    fallback: PlanResponse,
    requests: Mutex<Vec<PlanRequest>>,
    delay: Duration,
}

impl ScriptedPlanner {
    pub fn new(task_id: &str, fallback: PlanResponse) -> Self {
        Self {
            task_id: task_id.to_string(),
            script: Mutex::new(VecDeque::new()),
            fallback,
            requests: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    pub fn then(self, response: PlanResponse) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(response);
        }
        self
    }

    /// Answer every update only after `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn requests(&self) -> Vec<PlanRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn create_task(&self, _description: &str) -> Result<String, PlannerError> {
        Ok(self.task_id.clone())
    }

    async fn update(&self, request: &PlanRequest) -> Result<PlanResponse, PlannerError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Locator, PlannedAction};
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::Value;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn request() -> PlanRequest {
        PlanRequest {
            task_id: "task-1".into(),
            url: "https://shop.test/".into(),
            iteration: 2,
            snapshot: Snapshot::empty("https://shop.test/"),
            prior_results: vec![ActionResult::ok("clicked")],
        }
    }

    #[tokio::test]
    async fn test_create_and_update() {
        let app = Router::new()
            .route(
                "/tasks/create",
                post(|Json(body): Json<Value>| async move {
                    assert_eq!(body["task_description"], "buy socks");
                    Json(json!({"task_id": "task-1", "status": "created"}))
                }),
            )
            .route(
                "/tasks/update",
                post(|Json(body): Json<PlanRequest>| async move {
                    assert_eq!(body.iteration, 2);
                    assert_eq!(body.prior_results.len(), 1);
                    Json(json!({
                        "actions": [
                            {"type": "click", "target": {"id": "buy"}},
                            {"type": "wiggle"}
                        ],
                        "is_done": false,
                        "current_state": {"page_summary": "shop", "next_goal": "buy"}
                    }))
                }),
            );
        let planner = HttpPlanner::new(&serve(app).await, Duration::from_secs(5)).unwrap();

        assert_eq!(planner.create_task("buy socks").await.unwrap(), "task-1");
        let plan = planner.update(&request()).await.unwrap();
        assert_eq!(plan.actions.len(), 2);
        assert_eq!(
            plan.actions[0],
            PlanStep::Action(PlannedAction::click(Locator::by_id("buy")).unwrap())
        );
        assert!(matches!(plan.actions[1], PlanStep::Rejected { .. }));
        assert!(!plan.is_done);
        assert_eq!(plan.current_state.unwrap().next_goal, "buy");
    }

    #[tokio::test]
    async fn test_enveloped_update_reply() {
        let app = Router::new().route(
            "/api/tasks/update",
            post(|| async { Json(json!({"status": "success", "result": {"actions": [], "is_done": true}})) }),
        );
        let base = format!("{}/api", serve(app).await);
        let planner = HttpPlanner::new(&base, Duration::from_secs(5)).unwrap();
        assert!(planner.update(&request()).await.unwrap().is_done);
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let app = Router::new().route(
            "/tasks/update",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "model overloaded") }),
        );
        let planner = HttpPlanner::new(&serve(app).await, Duration::from_secs(5)).unwrap();
        match planner.update(&request()).await {
            Err(PlannerError::Status { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "model overloaded");
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[test]
    fn test_bad_base_url() {
        assert!(matches!(
            HttpPlanner::new("not a url", Duration::from_secs(1)),
            Err(PlannerError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_scripted_planner_replays_then_falls_back() {
        let planner = ScriptedPlanner::new("t", PlanResponse::new(vec![], false))
            .then(PlanResponse::new(vec![], true));
        assert!(planner.update(&request()).await.unwrap().is_done);
        assert!(!planner.update(&request()).await.unwrap().is_done);
        assert_eq!(planner.requests().len(), 2);
    }
}
