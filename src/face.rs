//! Local control surface: a small page, a JSON command endpoint and an SSE feed of
//! orchestrator notifications.

use std::convert::Infallible;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info};

use crate::orchestrator::{Control, Notification, OrchestratorError, OrchestratorHandle, TaskView};

/// How many ports past the configured one are tried before giving up.
pub const PORT_ATTEMPTS: u16 = 10;

#[derive(Debug, Error)]
pub enum FaceError {
    #[error("could not bind any port in {first}..{last}; is another agent running?")]
    NoPort { first: u16, last: u16 },
}

fn event_name(notification: &Notification) -> &'static str {
    match notification {
        Notification::StatusChanged { .. } => "status",
        Notification::Iteration { .. } => "iteration",
        Notification::ActionRejected { .. } => "action_rejected",
        Notification::LimitReached { .. } => "limit_reached",
        Notification::Recovered { .. } => "recovered",
        Notification::DomainChanged { .. } => "domain_changed",
        Notification::Failed { .. } => "failed",
    }
}

fn to_sse_event(notification: &Notification) -> Event {
    let data = serde_json::to_string(notification).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(event_name(notification)).data(data)
}

struct ControlError(OrchestratorError);

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            OrchestratorError::InvalidTransition { .. } => StatusCode::CONFLICT,
            OrchestratorError::Closed => StatusCode::SERVICE_UNAVAILABLE,
            OrchestratorError::Restore(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub fn router(handle: OrchestratorHandle) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/command", post(command_handler))
        .route("/status", get(status_handler))
        .route("/events", get(sse_handler))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .with_state(handle)
}

/// Bind the first free port starting at `first`.
pub async fn bind(first: u16) -> Result<(TcpListener, u16), FaceError> {
    let last = first.saturating_add(PORT_ATTEMPTS);
    for port in first..last {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(e) => debug!(port, "port unavailable: {e}"),
        }
    }
    Err(FaceError::NoPort { first, last })
}

/// Serve the control surface in the background and return the port it landed on.
pub async fn serve(handle: OrchestratorHandle, first_port: u16) -> Result<u16, FaceError> {
    let (listener, port) = bind(first_port).await?;
    info!("control surface at http://localhost:{port}");
    let app = router(handle);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("control surface stopped: {e}");
        }
    });
    Ok(port)
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn command_handler(
    State(handle): State<OrchestratorHandle>,
    Json(control): Json<Control>,
) -> Result<Json<TaskView>, ControlError> {
    debug!("POST /command: {}", control.name());
    handle.send(control).await.map(Json).map_err(ControlError)
}

async fn status_handler(State(handle): State<OrchestratorHandle>) -> Result<Json<TaskView>, ControlError> {
    handle.status().await.map(Json).map_err(ControlError)
}

async fn sse_handler(
    State(handle): State<OrchestratorHandle>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(handle.subscribe()).filter_map(|result| match result {
        Ok(notification) => Some(Ok::<_, Infallible>(to_sse_event(&notification))),
        // a lagging client just misses events
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<title>Navigator</title>
<style>
  body { background: #0a0a0f; color: #e0e0e0; font-family: system-ui, sans-serif; margin: 0; }
  main { max-width: 760px; margin: 0 auto; padding: 24px; display: flex; flex-direction: column; gap: 12px; }
  #status { font-family: monospace; color: #a5b4fc; }
  .row { display: flex; gap: 8px; }
  #task { flex: 1; background: #111118; border: 1px solid #222; border-radius: 6px; padding: 10px; color: #fff; }
  button { background: #6366f1; color: #fff; border: none; border-radius: 6px; padding: 10px 16px; cursor: pointer; }
  button.quiet { background: #222; }
  #log { font-family: monospace; font-size: 13px; display: flex; flex-direction: column; gap: 4px; }
  .failed, .limit_reached { color: #fca5a5; }
  .domain_changed, .recovered { color: #fcd34d; }
</style>
</head>
<body>
<main>
  <div id="status">loading...</div>
  <div class="row">
    <input id="task" placeholder="What should the agent do?" />
    <button onclick="send({command: 'start', description: document.getElementById('task').value})">Start</button>
  </div>
  <div class="row">
    <button class="quiet" onclick="send({command: 'pause'})">Pause</button>
    <button class="quiet" onclick="send({command: 'resume'})">Resume</button>
    <button class="quiet" onclick="send({command: 'stop'})">Stop</button>
    <button class="quiet" onclick="send({command: 'complete'})">Complete</button>
    <button class="quiet" onclick="send({command: 'reset'})">Reset</button>
  </div>
  <div id="log"></div>
</main>
<script>
  const status = document.getElementById('status');
  const log = document.getElementById('log');

  function show(view) {
    const t = view.task;
    status.textContent = t.id + ' | ' + t.status + ' | iteration ' + t.iteration + ' | ' + t.processing;
  }

  function line(kind, text) {
    const div = document.createElement('div');
    div.className = kind;
    div.textContent = kind + ': ' + text;
    log.prepend(div);
  }

  async function send(body) {
    const res = await fetch('/command', {
      method: 'POST',
      headers: {'Content-Type': 'application/json'},
      body: JSON.stringify(body),
    });
    const data = await res.json();
    if (res.ok) show(data); else line('failed', data.error);
  }

  async function refresh() {
    const res = await fetch('/status');
    if (res.ok) show(await res.json());
  }

  const es = new EventSource('/events');
  for (const kind of ['status', 'iteration', 'action_rejected', 'limit_reached', 'recovered', 'domain_changed', 'failed']) {
    es.addEventListener(kind, e => { line(kind, e.data); refresh(); });
  }
  refresh();
</script>
</body>
</html>
"##;
