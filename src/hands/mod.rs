//! The real browser: session setup and the [`Page`](crate::page::Page) implementation that
//! drives a Chrome tab.

mod chrome;
pub mod scripts;

use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde::Deserialize;
use tracing::{debug, info, warn};

pub use chrome::ChromePage;

use crate::config::BrowserConfig;

/// Persistent browser session. Created once, reused for every task.
pub struct BrowserSession {
    _browser: Browser,
    pub tab: Arc<Tab>,
}

#[derive(Deserialize)]
struct VersionInfo {
    #[serde(rename = "webSocketDebuggerUrl")]
    ws_url: String,
}

impl BrowserSession {
    /// Attach to a Chrome already listening on `debug_url`, else launch our own.
    pub async fn open(config: &BrowserConfig) -> Result<Self> {
        match Self::attach(&config.debug_url).await {
            Ok(session) => return Ok(session),
            Err(e) => debug!("could not attach to {}: {e:#}", config.debug_url),
        }
        warn!("no running Chrome to attach to; launching one");
        let config = config.clone();
        tokio::task::spawn_blocking(move || Self::launch(&config))
            .await
            .context("browser launch task panicked")?
    }

    async fn attach(debug_url: &str) -> Result<Self> {
        let ws_url = if debug_url.starts_with("ws://") || debug_url.starts_with("wss://") {
            debug_url.to_string()
        } else {
            let version = format!("{}/json/version", debug_url.trim_end_matches('/'));
            let info: VersionInfo = reqwest::Client::builder()
                .timeout(Duration::from_secs(2))
                .build()?
                .get(&version)
                .send()
                .await?
                .json()
                .await?;
            info.ws_url
        };

        tokio::task::spawn_blocking(move || {
            let browser = Browser::connect(ws_url.clone())?;
            let existing = browser
                .get_tabs()
                .lock()
                .map_err(|_| anyhow!("tab list lock poisoned"))?
                .first()
                .cloned();
            let tab = match existing {
                Some(tab) => {
                    debug!("using existing tab");
                    tab
                }
                None => browser.new_tab()?,
            };
            info!(%ws_url, "attached to running Chrome");
            Ok(Self {
                _browser: browser,
                tab,
            })
        })
        .await
        .context("attach task panicked")?
    }

    fn launch(config: &BrowserConfig) -> Result<Self> {
        // a profile of our own keeps logins between runs without locking the user's
        let profile = match &config.user_data_dir {
            Some(dir) => dir.clone(),
            None => default_profile_dir(),
        };
        std::fs::create_dir_all(&profile)
            .with_context(|| format!("cannot create browser profile at {}", profile.display()))?;

        let options = LaunchOptions {
            headless: config.headless,
            path: config.chrome_path.clone(),
            user_data_dir: Some(profile.clone()),
            args: vec![
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
                OsStr::new("--disable-blink-features=AutomationControlled"),
                OsStr::new("--disable-infobars"),
                OsStr::new("--password-store=basic"),
            ],
            idle_browser_timeout: Duration::from_secs(config.idle_timeout_secs),
            ..Default::default()
        };

        info!(profile = %profile.display(), headless = config.headless, "starting Chrome");
        let browser = Browser::new(options).map_err(|e| anyhow!("browser launch failed: {e}"))?;
        let tab = browser.new_tab()?;
        tab.navigate_to("about:blank")?;
        info!("Chrome ready");
        Ok(Self {
            _browser: browser,
            tab,
        })
    }

    pub fn page(&self) -> ChromePage {
        ChromePage::new(self.tab.clone())
    }
}

fn default_profile_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("navigator-agent").join("profile"))
        .unwrap_or_else(|| PathBuf::from("navigator_profile"))
}
