use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use navigator_agent::hands::BrowserSession;
use navigator_agent::{
    EngineConfig, HttpPlanner, JsonFileStore, Orchestrator, OrchestratorConfig, PageLink, Resolver, face,
};

/// Drive a browser tab on behalf of a remote planning service.
#[derive(Debug, Parser)]
#[command(name = "navigator", version, about)]
struct Cli {
    /// JSON config file; missing keys keep their defaults.
    #[arg(short, long, env = "NAVIGATOR_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "NAVIGATOR_PLANNER_URL")]
    planner_url: Option<String>,

    #[arg(long, env = "NAVIGATOR_MAX_ITERATIONS")]
    max_iterations: Option<u32>,

    /// Milliseconds between ticks.
    #[arg(long, env = "NAVIGATOR_TICK_MS")]
    tick_ms: Option<u64>,

    #[arg(long, env = "NAVIGATOR_STATE_FILE")]
    state_file: Option<PathBuf>,

    /// First port tried for the control surface.
    #[arg(short, long, env = "NAVIGATOR_PORT")]
    port: Option<u16>,

    #[arg(long, env = "NAVIGATOR_HEADLESS")]
    headless: bool,

    /// Start this task right away instead of waiting for the control surface.
    #[arg(long)]
    task: Option<String>,

    #[arg(long, env = "NAVIGATOR_LOG", default_value = "info")]
    log_level: String,
}

impl Cli {
    fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::load(path)?,
            None => EngineConfig::default(),
        };
        if let Some(url) = &self.planner_url {
            config.planner_url = url.clone();
        }
        if let Some(max) = self.max_iterations {
            config.max_iterations = max;
        }
        if let Some(ms) = self.tick_ms {
            config.tick_interval_ms = ms;
        }
        if let Some(path) = &self.state_file {
            config.state_file = Some(path.clone());
        }
        if let Some(port) = self.port {
            config.control_port = port;
        }
        config.browser.headless |= self.headless;
        Ok(config)
    }
}

fn init_logging(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let config = cli.engine_config()?;
    info!("starting navigator v{}", env!("CARGO_PKG_VERSION"));

    let session = BrowserSession::open(&config.browser)
        .await
        .context("no browser available")?;
    let page = Arc::new(session.page());

    let link = PageLink::spawn(
        page,
        Resolver::new(config.resolve.policy()),
        config.executor.clone(),
        config.transport,
    );
    let planner = Arc::new(HttpPlanner::new(&config.planner_url, config.planner_timeout())?);

    let state_path = config.state_file.clone().unwrap_or_else(JsonFileStore::default_path);
    let store = Arc::new(
        JsonFileStore::open(&state_path)
            .await
            .with_context(|| format!("cannot open task state at {}", state_path.display()))?,
    );
    info!(path = %store.path().display(), "task state");

    let orchestrator = Orchestrator::restore(OrchestratorConfig::from(&config), link, planner, store).await?;
    let handle = orchestrator.spawn();
    face::serve(handle.clone(), config.control_port).await?;

    if let Some(description) = cli.task {
        if let Err(e) = handle.start(description).await {
            warn!("could not start task: {e}");
        }
    }

    tokio::signal::ctrl_c().await.context("cannot listen for ctrl-c")?;
    info!("shutting down");
    // keep the browser alive until the orchestrator is gone
    drop(handle);
    drop(session);
    Ok(())
}
