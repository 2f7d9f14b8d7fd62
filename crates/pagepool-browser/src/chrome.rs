//! Chrome/Chromium worker processes over CDP.

use std::path::PathBuf;

use anyhow::Context as _;
use async_trait::async_trait;
use chromiumoxide::{Browser, BrowserConfig as CdpConfig, Page};
use futures::StreamExt;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info, trace};

use pagepool_core::config::{BrowserConfig, Config};

use crate::launcher::{FallbackLauncher, LaunchedWorker, WorkerLauncher, WorkerProcess};
use crate::pool::{PoolSettings, WorkerPool};

/// Flags passed when launching the fallback executable.
pub const BASELINE_ARGS: &[&str] = &[
    "--no-sandbox",
    "--disable-gpu",
    "--disable-dev-shm-usage",
    "--no-first-run",
    "--no-default-browser-check",
];

/// Pool of Chrome processes with managed launch and a local-executable fallback.
pub type BrowserPool = WorkerPool<FallbackLauncher<ChromeLauncher, ChromeLauncher>>;

/// Build a [`BrowserPool`] from the full configuration.
pub fn browser_pool(config: &Config) -> BrowserPool {
    WorkerPool::new(
        ChromeLauncher::from_config(&config.browser()),
        PoolSettings::from_config(config),
    )
}

/// How a Chrome process is started.
#[derive(Debug, Clone)]
pub enum LaunchStrategy {
    /// chromiumoxide's own configuration; the binary is auto-detected unless given.
    Managed { chrome_path: Option<PathBuf> },
    /// A known executable with [`BASELINE_ARGS`].
    Executable(PathBuf),
}

/// Launches one headless Chrome per call.
pub struct ChromeLauncher {
    strategy: LaunchStrategy,
    headless: bool,
    extra_args: Vec<String>,
    label: String,
}

impl ChromeLauncher {
    pub fn new(strategy: LaunchStrategy, config: &BrowserConfig) -> Self {
        let label = match &strategy {
            LaunchStrategy::Managed { .. } => "chrome-managed".to_string(),
            LaunchStrategy::Executable(path) => format!("chrome-local({})", path.display()),
        };
        Self {
            strategy,
            headless: config.headless,
            extra_args: config.extra_args.clone(),
            label,
        }
    }

    /// Managed launch first, then the configured fallback executable.
    pub fn from_config(config: &BrowserConfig) -> FallbackLauncher<Self, Self> {
        let managed = Self::new(
            LaunchStrategy::Managed {
                chrome_path: config.chrome_path(),
            },
            config,
        );
        let local = Self::new(LaunchStrategy::Executable(config.fallback_path()), config);
        FallbackLauncher::new(managed, local)
    }

    fn cdp_config(&self) -> anyhow::Result<CdpConfig> {
        let mut builder = CdpConfig::builder();
        if !self.headless {
            builder = builder.with_head();
        }
        match &self.strategy {
            LaunchStrategy::Managed { chrome_path } => {
                if let Some(path) = chrome_path {
                    builder = builder.chrome_executable(path);
                }
            }
            LaunchStrategy::Executable(path) => {
                builder = builder.chrome_executable(path);
                for arg in BASELINE_ARGS {
                    builder = builder.arg(*arg);
                }
            }
        }
        for arg in &self.extra_args {
            builder = builder.arg(arg.clone());
        }
        builder
            .build()
            .map_err(|e| anyhow::anyhow!("invalid browser config: {e}"))
    }
}

#[async_trait]
impl WorkerLauncher for ChromeLauncher {
    type Process = ChromeProcess;

    fn label(&self) -> &str {
        &self.label
    }

    async fn launch(&self) -> anyhow::Result<LaunchedWorker<ChromeProcess>> {
        let config = self.cdp_config()?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .with_context(|| format!("{} failed to start", self.label))?;

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    trace!(%e, "CDP handler error");
                }
            }
            debug!("CDP connection closed");
            let _ = exit_tx.send(());
        });

        info!(launcher = %self.label, "Browser launched");
        Ok(LaunchedWorker::new(
            ChromeProcess {
                browser: Mutex::new(browser),
            },
            exit_rx,
        ))
    }
}

/// One running browser. Contexts are blank pages.
pub struct ChromeProcess {
    browser: Mutex<Browser>,
}

#[async_trait]
impl WorkerProcess for ChromeProcess {
    type Context = Page;

    async fn open_context(&self) -> anyhow::Result<Page> {
        let browser = self.browser.lock().await;
        browser
            .new_page("about:blank")
            .await
            .context("failed to open page")
    }

    async fn close_context(&self, page: Page) -> anyhow::Result<()> {
        page.close().await.context("failed to close page")
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        let mut browser = self.browser.lock().await;
        if let Err(e) = browser.close().await {
            debug!(%e, "Graceful browser close failed, killing process");
            if let Some(Err(kill_err)) = browser.kill().await {
                return Err(kill_err).context("failed to kill browser");
            }
            return Ok(());
        }
        browser
            .wait()
            .await
            .context("failed waiting for browser exit")?;
        Ok(())
    }
}
