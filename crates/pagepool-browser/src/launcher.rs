//! Process launch seam.
//!
//! The pool never spawns processes itself. A [`WorkerLauncher`] produces a
//! live [`WorkerProcess`] together with a one-shot exit notification that
//! the pool's supervisor listens on.

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// One live external worker process.
#[async_trait]
pub trait WorkerProcess: Send + Sync + 'static {
    /// Ephemeral unit of work opened on the process (e.g. a page).
    ///
    /// Cloned once per task: the task receives a copy and the pool keeps one
    /// to close afterwards.
    type Context: Clone + Send + Sync + 'static;

    /// Open a fresh context on this process.
    async fn open_context(&self) -> anyhow::Result<Self::Context>;

    /// Close a context previously returned by [`open_context`](Self::open_context).
    async fn close_context(&self, context: Self::Context) -> anyhow::Result<()>;

    /// Terminate the process.
    async fn shutdown(&self) -> anyhow::Result<()>;
}

/// A freshly launched process plus its exit notification.
pub struct LaunchedWorker<P> {
    pub process: P,
    /// Resolves (or errors because the sender was dropped) once the process is gone.
    pub exit: oneshot::Receiver<()>,
}

impl<P> LaunchedWorker<P> {
    pub fn new(process: P, exit: oneshot::Receiver<()>) -> Self {
        Self { process, exit }
    }
}

/// Launches worker processes for the pool.
#[async_trait]
pub trait WorkerLauncher: Send + Sync + 'static {
    type Process: WorkerProcess;

    /// Human-readable label for logs.
    fn label(&self) -> &str;

    /// Start one process.
    async fn launch(&self) -> anyhow::Result<LaunchedWorker<Self::Process>>;
}

/// Tries a primary launcher first and falls back to a secondary one.
pub struct FallbackLauncher<A, B> {
    primary: A,
    fallback: B,
    label: String,
}

impl<A, B> FallbackLauncher<A, B>
where
    A: WorkerLauncher,
    B: WorkerLauncher<Process = A::Process>,
{
    pub fn new(primary: A, fallback: B) -> Self {
        let label = format!("{} -> {}", primary.label(), fallback.label());
        Self {
            primary,
            fallback,
            label,
        }
    }
}

#[async_trait]
impl<A, B> WorkerLauncher for FallbackLauncher<A, B>
where
    A: WorkerLauncher,
    B: WorkerLauncher<Process = A::Process>,
{
    type Process = A::Process;

    fn label(&self) -> &str {
        &self.label
    }

    async fn launch(&self) -> anyhow::Result<LaunchedWorker<Self::Process>> {
        let primary_err = match self.primary.launch().await {
            Ok(worker) => return Ok(worker),
            Err(e) => e,
        };

        warn!(
            launcher = self.primary.label(),
            error = %format!("{primary_err:#}"),
            "Primary launch failed, trying fallback"
        );

        match self.fallback.launch().await {
            Ok(worker) => {
                info!(launcher = self.fallback.label(), "Fallback launch succeeded");
                Ok(worker)
            }
            Err(fallback_err) => Err(anyhow::anyhow!(
                "primary ({}) failed: {primary_err:#}; fallback ({}) failed: {fallback_err:#}",
                self.primary.label(),
                self.fallback.label(),
            )),
        }
    }
}
