//! Worker pool: a fixed set of slots over long-lived worker processes.
//!
//! Slots are checked out with [`WorkerPool::acquire`] and handed back when
//! the returned [`SlotLease`] is dropped. When every slot is busy, callers
//! queue in arrival order and a released slot goes straight to the oldest
//! waiter. Each process carries an exit watcher; the supervisor marks a
//! crashed slot free, launches a replacement in place, and drains the queue.
//!
//! Every handle installed in a slot gets a pool-wide unique generation.
//! Releases and exit notifications carrying a stale generation are ignored.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use pagepool_core::config::Config;

use crate::error::PoolError;
use crate::launcher::{LaunchedWorker, WorkerLauncher, WorkerProcess};

/// Fixed pool parameters, set once at construction.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Number of worker slots (at least 1).
    pub size: usize,
    /// Upper bound for a single `with_worker` task.
    pub task_timeout: Duration,
    /// Accepted from configuration; idle workers are never reaped.
    pub idle_timeout: Option<Duration>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            size: 3,
            task_timeout: Duration::from_secs(30),
            idle_timeout: None,
        }
    }
}

impl PoolSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            size: config.pool_size().max(1),
            task_timeout: config.task_timeout(),
            idle_timeout: config.idle_timeout(),
        }
    }
}

/// Point-in-time occupancy snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub busy: usize,
    /// `size - busy`; includes unavailable slots.
    pub free: usize,
    pub queued: usize,
    /// Free slots without a live process (replacement pending or failed).
    pub unavailable: usize,
    /// Crashes observed since construction.
    pub crashes: u64,
}

/// Per-slot diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SlotInfo {
    pub index: usize,
    pub busy: bool,
    pub available: bool,
    pub generation: u64,
    pub last_used_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Uninitialised,
    Ready,
    Destroyed,
}

struct Slot<P> {
    index: usize,
    /// `None` while a replacement is launching or after it failed.
    process: Option<Arc<P>>,
    busy: bool,
    last_used_at: DateTime<Utc>,
    generation: u64,
    watcher: Option<AbortHandle>,
}

struct PoolState<P: WorkerProcess> {
    phase: Phase,
    slots: Vec<Slot<P>>,
    waiters: VecDeque<oneshot::Sender<SlotLease<P>>>,
    next_generation: u64,
    crashes: u64,
}

impl<P: WorkerProcess> PoolState<P> {
    fn allocate_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Claim the first usable free slot in index order.
    fn claim_free(&mut self, shared: &Arc<Shared<P>>) -> Option<SlotLease<P>> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| !s.busy && s.process.is_some())?;
        let process = slot.process.clone()?;
        slot.busy = true;
        slot.last_used_at = Utc::now();
        Some(SlotLease {
            index: slot.index,
            generation: slot.generation,
            process,
            shared: Some(shared.clone()),
        })
    }

    /// Undo a claim that no waiter accepted.
    fn unclaim(&mut self, mut lease: SlotLease<P>) {
        lease.shared = None;
        if let Some(slot) = self.slots.get_mut(lease.index) {
            if slot.generation == lease.generation {
                slot.busy = false;
            }
        }
    }

    /// Hand free slots to waiters, oldest first.
    fn drain(&mut self, shared: &Arc<Shared<P>>) {
        while !self.waiters.is_empty() {
            let Some(mut lease) = self.claim_free(shared) else {
                return;
            };
            loop {
                let Some(waiter) = self.waiters.pop_front() else {
                    // Every remaining waiter had gone away.
                    self.unclaim(lease);
                    return;
                };
                match waiter.send(lease) {
                    Ok(()) => break,
                    Err(returned) => lease = returned,
                }
            }
            debug!(queued = self.waiters.len(), "Slot handed to queued waiter");
        }
    }

    fn queued(&self) -> usize {
        self.waiters.iter().filter(|w| !w.is_closed()).count()
    }

    fn stats(&self) -> PoolStats {
        let size = self.slots.len();
        let busy = self.slots.iter().filter(|s| s.busy).count();
        let unavailable = self
            .slots
            .iter()
            .filter(|s| !s.busy && s.process.is_none())
            .count();
        PoolStats {
            size,
            busy,
            free: size - busy,
            queued: self.queued(),
            unavailable,
            crashes: self.crashes,
        }
    }

    fn publish(&self) {
        let stats = self.stats();
        crate::metrics::record_occupancy(stats.busy, stats.queued);
    }
}

/// State shared between the pool, its leases, and the supervisor.
struct Shared<P: WorkerProcess> {
    state: Mutex<PoolState<P>>,
}

impl<P: WorkerProcess> Shared<P> {
    fn new() -> Self {
        Self {
            state: Mutex::new(PoolState {
                phase: Phase::Uninitialised,
                slots: Vec::new(),
                waiters: VecDeque::new(),
                next_generation: 0,
                crashes: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<P>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(self: &Arc<Self>, index: usize, generation: u64) {
        let mut state = self.lock();
        let Some(slot) = state.slots.get_mut(index) else {
            return;
        };
        if slot.generation != generation {
            debug!(slot = index, generation, "Ignoring release of a replaced handle");
            return;
        }
        slot.busy = false;
        slot.last_used_at = Utc::now();
        debug!(slot = index, "Slot released");
        state.drain(self);
        state.publish();
    }

    /// Free a crashed slot and reserve the generation for its replacement.
    fn mark_crashed(&self, event: ExitEvent) -> Option<u64> {
        let mut state = self.lock();
        if state.phase != Phase::Ready {
            return None;
        }
        let current = state
            .slots
            .get(event.index)
            .is_some_and(|s| s.generation == event.generation && s.process.is_some());
        if !current {
            return None;
        }

        let generation = state.allocate_generation();
        state.crashes += 1;
        let slot = &mut state.slots[event.index];
        let was_busy = slot.busy;
        slot.busy = false;
        slot.process = None;
        slot.watcher = None;
        slot.generation = generation;
        slot.last_used_at = Utc::now();
        warn!(
            slot = event.index,
            was_busy,
            "Worker process exited unexpectedly, replacing"
        );
        crate::metrics::record_crash();
        state.publish();
        Some(generation)
    }
}

/// Exclusive use of one slot. Dropping the lease releases the slot.
pub struct SlotLease<P: WorkerProcess> {
    index: usize,
    generation: u64,
    process: Arc<P>,
    shared: Option<Arc<Shared<P>>>,
}

impl<P: WorkerProcess> SlotLease<P> {
    /// Stable slot index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Generation of the process handle this lease was issued for.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn process(&self) -> &P {
        &self.process
    }

    /// Hand the slot back now.
    pub fn release(self) {
        drop(self);
    }
}

impl<P: WorkerProcess> Drop for SlotLease<P> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.release(self.index, self.generation);
        }
    }
}

impl<P: WorkerProcess> fmt::Debug for SlotLease<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotLease")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct ExitEvent {
    index: usize,
    generation: u64,
}

struct Supervisor {
    events: mpsc::UnboundedSender<ExitEvent>,
    cancel: CancellationToken,
    /// Finishes once every in-flight replacement has settled.
    task: JoinHandle<()>,
}

/// An open context together with the lease it was opened under.
///
/// Dropped without [`close`](Self::close) (caller cancelled, task panicked),
/// it closes the context on a background task and releases the slot after.
struct ContextGuard<P: WorkerProcess> {
    lease: Option<SlotLease<P>>,
    context: Option<P::Context>,
}

impl<P: WorkerProcess> ContextGuard<P> {
    fn new(lease: SlotLease<P>, context: P::Context) -> Self {
        Self {
            lease: Some(lease),
            context: Some(context),
        }
    }

    async fn close(mut self) {
        if let (Some(lease), Some(context)) = (self.lease.take(), self.context.take()) {
            close_and_release(lease, context).await;
        }
    }
}

impl<P: WorkerProcess> Drop for ContextGuard<P> {
    fn drop(&mut self) {
        let (Some(lease), Some(context)) = (self.lease.take(), self.context.take()) else {
            return;
        };
        debug!(slot = lease.index, "Task abandoned, closing its context in the background");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(close_and_release(lease, context));
            }
            Err(_) => warn!(slot = lease.index, "No runtime left to close an abandoned context"),
        }
    }
}

async fn close_and_release<P: WorkerProcess>(lease: SlotLease<P>, context: P::Context) {
    if let Err(e) = lease.process.close_context(context).await {
        warn!(slot = lease.index, error = %format!("{e:#}"), "Failed to close worker context");
    }
    lease.release();
}

enum Checkout<P: WorkerProcess> {
    Ready(SlotLease<P>),
    Queued(oneshot::Receiver<SlotLease<P>>),
}

/// A fixed-size pool of worker processes.
pub struct WorkerPool<L: WorkerLauncher> {
    launcher: Arc<L>,
    settings: PoolSettings,
    shared: Arc<Shared<L::Process>>,
    init_lock: tokio::sync::Mutex<()>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl<L: WorkerLauncher> WorkerPool<L> {
    /// Create a pool. No process is launched until [`initialise`](Self::initialise).
    pub fn new(launcher: L, settings: PoolSettings) -> Self {
        Self {
            launcher: Arc::new(launcher),
            settings: PoolSettings {
                size: settings.size.max(1),
                ..settings
            },
            shared: Arc::new(Shared::new()),
            init_lock: tokio::sync::Mutex::new(()),
            supervisor: Mutex::new(None),
        }
    }

    /// Launch every slot concurrently. Idempotent; concurrent callers share one launch.
    ///
    /// Fails if any slot fails to launch. Processes that did start are shut
    /// down again, so a failed initialisation leaves no slots behind.
    pub async fn initialise(&self) -> Result<(), PoolError> {
        let _init = self.init_lock.lock().await;
        if self.phase() == Phase::Ready {
            return Ok(());
        }

        let size = self.settings.size;
        info!(size, launcher = self.launcher.label(), "Launching worker pool");
        let started = Instant::now();

        let results = join_all((0..size).map(|_| self.launcher.launch())).await;

        let mut launched = Vec::with_capacity(size);
        let mut failure = None;
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(worker) => launched.push((index, worker)),
                Err(reason) => {
                    error!(slot = index, error = %format!("{reason:#}"), "Worker launch failed");
                    if failure.is_none() {
                        failure = Some(PoolError::Launch { index, reason });
                    }
                }
            }
        }

        if let Some(err) = failure {
            let survivors: Vec<_> = launched
                .into_iter()
                .map(|(index, worker)| (index, Arc::new(worker.process)))
                .collect();
            shutdown_all(survivors).await;
            return Err(err);
        }

        let events = self.ensure_supervisor();
        {
            let mut state = self.shared.lock();
            let now = Utc::now();
            let mut slots = Vec::with_capacity(size);
            for (index, LaunchedWorker { process, exit }) in launched {
                let generation = state.allocate_generation();
                slots.push(Slot {
                    index,
                    process: Some(Arc::new(process)),
                    busy: false,
                    last_used_at: now,
                    generation,
                    watcher: Some(spawn_watcher(index, generation, exit, events.clone())),
                });
            }
            state.slots = slots;
            state.phase = Phase::Ready;
            state.publish();
        }

        info!(
            size,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Worker pool ready"
        );
        Ok(())
    }

    /// Check out a slot, waiting in FIFO order while all slots are busy.
    ///
    /// There is no upper bound on the wait; see [`acquire_within`](Self::acquire_within).
    pub async fn acquire(&self) -> Result<SlotLease<L::Process>, PoolError> {
        match self.checkout()? {
            Checkout::Ready(lease) => Ok(lease),
            Checkout::Queued(rx) => rx.await.map_err(|_| PoolError::Destroyed),
        }
    }

    /// Like [`acquire`](Self::acquire), but gives up after `limit`.
    pub async fn acquire_within(
        &self,
        limit: Duration,
    ) -> Result<SlotLease<L::Process>, PoolError> {
        match self.checkout()? {
            Checkout::Ready(lease) => Ok(lease),
            Checkout::Queued(rx) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received.map_err(|_| PoolError::Destroyed),
                Err(_) => Err(PoolError::AcquireTimeout(limit)),
            },
        }
    }

    /// Claim a free slot without waiting.
    pub fn try_acquire(&self) -> Option<SlotLease<L::Process>> {
        let mut state = self.shared.lock();
        if state.phase != Phase::Ready {
            return None;
        }
        let lease = state.claim_free(&self.shared)?;
        state.publish();
        Some(lease)
    }

    fn checkout(&self) -> Result<Checkout<L::Process>, PoolError> {
        let mut state = self.shared.lock();
        match state.phase {
            Phase::Uninitialised => return Err(PoolError::NotInitialised),
            Phase::Destroyed => return Err(PoolError::Destroyed),
            Phase::Ready => {}
        }

        if let Some(lease) = state.claim_free(&self.shared) {
            debug!(slot = lease.index, "Slot acquired");
            state.publish();
            return Ok(Checkout::Ready(lease));
        }

        state.waiters.retain(|w| !w.is_closed());
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(tx);
        debug!(queued = state.waiters.len(), "All workers busy, queueing");
        state.publish();
        Ok(Checkout::Queued(rx))
    }

    /// Run `task` against a fresh context on a pooled worker.
    ///
    /// The context is closed and the slot released on every exit path. On
    /// success, failure, or timeout this happens before the result is
    /// returned; if the caller drops this future or the task panics, it
    /// happens on a background task. Initialises the pool on first use.
    pub async fn with_worker<T, F, Fut>(&self, task: F) -> Result<T, PoolError>
    where
        F: FnOnce(<L::Process as WorkerProcess>::Context) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if self.phase() == Phase::Uninitialised {
            self.initialise().await?;
        }

        let lease = self.acquire().await?;
        let slot = lease.index();
        let started = Instant::now();

        let context = match lease.process().open_context().await {
            Ok(context) => context,
            Err(e) => {
                crate::metrics::record_task("context_error", started.elapsed().as_secs_f64());
                return Err(PoolError::Context(e));
            }
        };

        let guard = ContextGuard::new(lease, context.clone());

        let timeout = self.settings.task_timeout;
        let outcome = tokio::time::timeout(timeout, task(context)).await;
        guard.close().await;

        let elapsed = started.elapsed().as_secs_f64();
        match outcome {
            Ok(Ok(value)) => {
                crate::metrics::record_task("ok", elapsed);
                Ok(value)
            }
            Ok(Err(e)) => {
                debug!(slot, error = %format!("{e:#}"), "Task failed");
                crate::metrics::record_task("error", elapsed);
                Err(PoolError::Task(e))
            }
            Err(_) => {
                warn!(slot, timeout_ms = timeout.as_millis() as u64, "Task timed out");
                crate::metrics::record_task("timeout", elapsed);
                Err(PoolError::TaskTimeout(timeout))
            }
        }
    }

    /// Close every process and clear all slots and waiters. Safe to call repeatedly.
    ///
    /// Individual close failures are logged and do not stop the others.
    /// Returns only after any replacement launch that was in flight has been
    /// shut down as well.
    pub async fn destroy(&self) {
        let _init = self.init_lock.lock().await;

        let supervisor = self.lock_supervisor().take();
        if let Some(supervisor) = &supervisor {
            supervisor.cancel.cancel();
        }

        let processes: Vec<_> = {
            let mut state = self.shared.lock();
            state.phase = Phase::Destroyed;
            state.waiters.clear();
            let slots = std::mem::take(&mut state.slots);
            state.publish();
            slots
                .into_iter()
                .filter_map(|mut slot| {
                    if let Some(watcher) = slot.watcher.take() {
                        watcher.abort();
                    }
                    let index = slot.index;
                    slot.process.map(|process| (index, process))
                })
                .collect()
        };

        let count = processes.len();
        if count == 0 {
            debug!("Worker pool already empty");
        } else {
            info!(count, "Shutting down worker pool");
            shutdown_all(processes).await;
        }

        if let Some(supervisor) = supervisor {
            if let Err(e) = supervisor.task.await {
                warn!(%e, "Pool supervisor ended abnormally");
            }
        }
        if count > 0 {
            info!("Worker pool destroyed");
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.lock().stats()
    }

    pub fn slots(&self) -> Vec<SlotInfo> {
        self.shared
            .lock()
            .slots
            .iter()
            .map(|s| SlotInfo {
                index: s.index,
                busy: s.busy,
                available: s.process.is_some(),
                generation: s.generation,
                last_used_at: s.last_used_at,
            })
            .collect()
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == Phase::Ready
    }

    fn phase(&self) -> Phase {
        self.shared.lock().phase
    }

    fn lock_supervisor(&self) -> MutexGuard<'_, Option<Supervisor>> {
        self.supervisor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_supervisor(&self) -> mpsc::UnboundedSender<ExitEvent> {
        let mut supervisor = self.lock_supervisor();
        if let Some(existing) = supervisor.as_ref() {
            return existing.events.clone();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervise(
            self.launcher.clone(),
            self.shared.clone(),
            tx.clone(),
            rx,
            cancel.clone(),
        ));
        *supervisor = Some(Supervisor {
            events: tx.clone(),
            cancel,
            task,
        });
        tx
    }
}

impl<L: WorkerLauncher> Drop for WorkerPool<L> {
    fn drop(&mut self) {
        let supervisor = self
            .supervisor
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(supervisor) = supervisor {
            supervisor.cancel.cancel();
        }
    }
}

fn spawn_watcher(
    index: usize,
    generation: u64,
    exit: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<ExitEvent>,
) -> AbortHandle {
    tokio::spawn(async move {
        // A dropped sender means the process is gone too.
        let _ = exit.await;
        debug!(slot = index, generation, "Worker process exit observed");
        let _ = events.send(ExitEvent { index, generation });
    })
    .abort_handle()
}

async fn supervise<L: WorkerLauncher>(
    launcher: Arc<L>,
    shared: Arc<Shared<L::Process>>,
    events_tx: mpsc::UnboundedSender<ExitEvent>,
    mut events: mpsc::UnboundedReceiver<ExitEvent>,
    cancel: CancellationToken,
) {
    debug!("Pool supervisor started");
    let mut replacements = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(joined) = replacements.join_next(), if !replacements.is_empty() => {
                if let Err(e) = joined {
                    warn!(%e, "Replacement task ended abnormally");
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                if let Some(generation) = shared.mark_crashed(event) {
                    replacements.spawn(replace_slot(
                        launcher.clone(),
                        shared.clone(),
                        events_tx.clone(),
                        event.index,
                        generation,
                    ));
                }
            }
        }
    }
    // Launches still running see the pool retired and shut their process down.
    while replacements.join_next().await.is_some() {}
    debug!("Pool supervisor stopped");
}

/// Launch a replacement for a crashed slot. A failed launch leaves the slot
/// unavailable; it is not retried.
async fn replace_slot<L: WorkerLauncher>(
    launcher: Arc<L>,
    shared: Arc<Shared<L::Process>>,
    events: mpsc::UnboundedSender<ExitEvent>,
    index: usize,
    generation: u64,
) {
    let outcome = launcher.launch().await;

    let orphan = {
        let mut state = shared.lock();
        let orphan = match outcome {
            Ok(LaunchedWorker { process, exit }) => {
                let still_pending = state.phase == Phase::Ready
                    && state
                        .slots
                        .get(index)
                        .is_some_and(|s| s.generation == generation && s.process.is_none());
                if still_pending {
                    let slot = &mut state.slots[index];
                    slot.process = Some(Arc::new(process));
                    slot.watcher = Some(spawn_watcher(index, generation, exit, events));
                    slot.last_used_at = Utc::now();
                    info!(slot = index, generation, "Replacement worker ready");
                    crate::metrics::record_replacement(true);
                    None
                } else {
                    Some(process)
                }
            }
            Err(e) => {
                error!(
                    slot = index,
                    error = %format!("{e:#}"),
                    "Replacement launch failed, slot stays unavailable"
                );
                crate::metrics::record_replacement(false);
                None
            }
        };
        state.drain(&shared);
        state.publish();
        orphan
    };

    // The pool was destroyed or re-initialised while this launch was running.
    if let Some(process) = orphan {
        debug!(slot = index, "Discarding replacement for a retired slot");
        if let Err(e) = process.shutdown().await {
            warn!(slot = index, error = %format!("{e:#}"), "Failed to shut down orphaned worker");
        }
    }
}

async fn shutdown_all<P: WorkerProcess>(processes: Vec<(usize, Arc<P>)>) {
    let closing = processes.into_iter().map(|(index, process)| async move {
        if let Err(e) = process.shutdown().await {
            warn!(slot = index, error = %format!("{e:#}"), "Worker failed to shut down");
        }
    });
    join_all(closing).await;
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;

    #[derive(Default)]
    struct FakeState {
        launches: usize,
        fail_ids: HashSet<usize>,
        kill_switches: Vec<Option<oneshot::Sender<()>>>,
        shutdowns: Vec<usize>,
        fail_shutdown_ids: HashSet<usize>,
        fail_open_ids: HashSet<usize>,
        fail_close_ids: HashSet<usize>,
    }

    /// In-memory launcher; process ids are assigned in launch order.
    #[derive(Clone, Default)]
    struct FakeLauncher {
        state: Arc<Mutex<FakeState>>,
        delay: Duration,
        closed_contexts: Arc<AtomicUsize>,
    }

    impl FakeLauncher {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }

        fn launches(&self) -> usize {
            self.state.lock().unwrap().launches
        }

        fn fail_launch(&self, id: usize) {
            self.state.lock().unwrap().fail_ids.insert(id);
        }

        fn fail_shutdown(&self, id: usize) {
            self.state.lock().unwrap().fail_shutdown_ids.insert(id);
        }

        fn fail_open(&self, id: usize) {
            self.state.lock().unwrap().fail_open_ids.insert(id);
        }

        fn fail_close(&self, id: usize) {
            self.state.lock().unwrap().fail_close_ids.insert(id);
        }

        fn closed_contexts(&self) -> usize {
            self.closed_contexts.load(Ordering::SeqCst)
        }

        fn shutdowns(&self) -> Vec<usize> {
            let mut ids = self.state.lock().unwrap().shutdowns.clone();
            ids.sort_unstable();
            ids
        }

        /// Simulate the process with this id dying.
        fn crash(&self, id: usize) {
            let switch = self.state.lock().unwrap().kill_switches[id].take();
            if let Some(tx) = switch {
                let _ = tx.send(());
            }
        }
    }

    struct FakeProcess {
        id: usize,
        state: Arc<Mutex<FakeState>>,
        closed_contexts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WorkerProcess for FakeProcess {
        type Context = usize;

        async fn open_context(&self) -> anyhow::Result<usize> {
            if self.state.lock().unwrap().fail_open_ids.contains(&self.id) {
                anyhow::bail!("process {} cannot open a context", self.id);
            }
            Ok(self.id)
        }

        async fn close_context(&self, _context: usize) -> anyhow::Result<()> {
            self.closed_contexts.fetch_add(1, Ordering::SeqCst);
            if self.state.lock().unwrap().fail_close_ids.contains(&self.id) {
                anyhow::bail!("process {} lost the context", self.id);
            }
            Ok(())
        }

        async fn shutdown(&self) -> anyhow::Result<()> {
            let mut state = self.state.lock().unwrap();
            state.shutdowns.push(self.id);
            if let Some(tx) = state.kill_switches[self.id].take() {
                let _ = tx.send(());
            }
            if state.fail_shutdown_ids.contains(&self.id) {
                anyhow::bail!("process {} refused to exit", self.id);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl WorkerLauncher for FakeLauncher {
        type Process = FakeProcess;

        fn label(&self) -> &str {
            "fake"
        }

        async fn launch(&self) -> anyhow::Result<LaunchedWorker<FakeProcess>> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let mut state = self.state.lock().unwrap();
            let id = state.launches;
            state.launches += 1;
            if state.fail_ids.contains(&id) {
                state.kill_switches.push(None);
                anyhow::bail!("launch {id} failed");
            }
            let (tx, rx) = oneshot::channel();
            state.kill_switches.push(Some(tx));
            Ok(LaunchedWorker::new(
                FakeProcess {
                    id,
                    state: self.state.clone(),
                    closed_contexts: self.closed_contexts.clone(),
                },
                rx,
            ))
        }
    }

    fn pool_of(size: usize, launcher: FakeLauncher) -> Arc<WorkerPool<FakeLauncher>> {
        Arc::new(WorkerPool::new(
            launcher,
            PoolSettings {
                size,
                ..PoolSettings::default()
            },
        ))
    }

    async fn wait_until(pool: &WorkerPool<FakeLauncher>, check: impl Fn(PoolStats) -> bool) {
        for _ in 0..200 {
            if check(pool.stats()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached, stats: {:?}", pool.stats());
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_initialise_launches_all_slots() {
        let launcher = FakeLauncher::default();
        let pool = pool_of(3, launcher.clone());
        pool.initialise().await.unwrap();

        assert!(pool.is_ready());
        assert_eq!(launcher.launches(), 3);
        let stats = pool.stats();
        assert_eq!(stats.size, 3);
        assert_eq!(stats.free, 3);
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.queued, 0);
    }

    #[tokio::test]
    async fn test_concurrent_initialise_launches_once() {
        let launcher = FakeLauncher::with_delay(Duration::from_millis(30));
        let pool = pool_of(3, launcher.clone());

        let (a, b) = tokio::join!(pool.initialise(), pool.initialise());
        a.unwrap();
        b.unwrap();
        pool.initialise().await.unwrap();

        assert_eq!(launcher.launches(), 3);
    }

    #[tokio::test]
    async fn test_initialise_failure_leaves_no_slots() {
        let launcher = FakeLauncher::default();
        launcher.fail_launch(1);
        let pool = pool_of(3, launcher.clone());

        let err = pool.initialise().await.unwrap_err();
        assert!(matches!(err, PoolError::Launch { index: 1, .. }), "got: {err}");
        assert_eq!(pool.stats().size, 0);
        assert_eq!(launcher.shutdowns(), vec![0, 2]);
        assert!(matches!(
            pool.acquire().await.unwrap_err(),
            PoolError::NotInitialised
        ));
    }

    #[tokio::test]
    async fn test_acquire_claims_first_free_slot() {
        let pool = pool_of(2, FakeLauncher::default());
        pool.initialise().await.unwrap();

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(pool.stats().busy, 2);
        assert!(pool.try_acquire().is_none());

        drop(a);
        let c = pool.try_acquire().expect("slot 0 should be free");
        assert_eq!(c.index(), 0);
    }

    #[tokio::test]
    async fn test_waiters_are_served_in_arrival_order() {
        let pool = pool_of(1, FakeLauncher::default());
        pool.initialise().await.unwrap();
        let held = pool.acquire().await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for n in 1..=3 {
            let task_pool = pool.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let lease = task_pool.acquire().await.unwrap();
                order.lock().unwrap().push(n);
                drop(lease);
            }));
            wait_until(&pool, |s| s.queued == n).await;
        }

        held.release();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(pool.stats().busy, 0);
    }

    #[tokio::test]
    async fn test_release_hands_slot_directly_to_waiter() {
        let pool = pool_of(1, FakeLauncher::default());
        pool.initialise().await.unwrap();
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.unwrap() })
        };
        wait_until(&pool, |s| s.queued == 1).await;

        held.release();
        // The slot never shows as free between release and hand-over.
        assert_eq!(pool.stats().busy, 1);
        assert!(pool.try_acquire().is_none());

        let lease = waiter.await.unwrap();
        assert_eq!(lease.index(), 0);
    }

    #[tokio::test]
    async fn test_acquire_within_times_out_and_abandons_wait() {
        let pool = pool_of(1, FakeLauncher::default());
        pool.initialise().await.unwrap();
        let held = pool.acquire().await.unwrap();

        let err = pool
            .acquire_within(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::AcquireTimeout(_)));
        assert_eq!(pool.stats().queued, 0);

        held.release();
        let stats = pool.stats();
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.free, 1);
    }

    #[tokio::test]
    async fn test_with_worker_returns_value_and_releases() {
        let launcher = FakeLauncher::default();
        let pool = pool_of(2, launcher.clone());

        let id = pool
            .with_worker(|ctx| async move { Ok(ctx * 10) })
            .await
            .unwrap();

        assert_eq!(id, 0);
        assert_eq!(launcher.launches(), 2, "with_worker initialises lazily");
        assert_eq!(pool.stats().busy, 0);
        assert_eq!(launcher.closed_contexts(), 1);
    }

    #[tokio::test]
    async fn test_with_worker_propagates_error_and_releases() {
        let launcher = FakeLauncher::default();
        let pool = pool_of(1, launcher.clone());

        let err = pool
            .with_worker(|_ctx| async move { Err::<(), _>(anyhow::anyhow!("extraction failed")) })
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "extraction failed");
        assert!(matches!(err, PoolError::Task(_)));
        assert_eq!(pool.stats().busy, 0);
        assert_eq!(launcher.closed_contexts(), 1);
    }

    #[tokio::test]
    async fn test_with_worker_timeout_releases_slot() {
        let launcher = FakeLauncher::default();
        let pool = Arc::new(WorkerPool::new(
            launcher.clone(),
            PoolSettings {
                size: 1,
                task_timeout: Duration::from_millis(30),
                idle_timeout: None,
            },
        ));

        let err = pool
            .with_worker(|_ctx| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, PoolError::TaskTimeout(_)));
        assert_eq!(pool.stats().busy, 0);
        assert_eq!(launcher.closed_contexts(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_task_still_closes_context() {
        let launcher = FakeLauncher::default();
        let pool = pool_of(1, launcher.clone());
        pool.initialise().await.unwrap();

        for _ in 0..5 {
            let abandoned = tokio::time::timeout(
                Duration::from_millis(10),
                pool.with_worker(|_ctx| async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                }),
            )
            .await;
            assert!(abandoned.is_err());
        }

        eventually(|| launcher.closed_contexts() == 5).await;
        wait_until(&pool, |s| s.busy == 0).await;
        assert!(pool.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_panicking_task_still_closes_context() {
        let launcher = FakeLauncher::default();
        let pool = pool_of(1, launcher.clone());
        pool.initialise().await.unwrap();

        let handle = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.with_worker(|ctx| async move {
                    assert_eq!(ctx, usize::MAX, "task blew up");
                    Ok(())
                })
                .await
            })
        };
        assert!(handle.await.unwrap_err().is_panic());

        eventually(|| launcher.closed_contexts() == 1).await;
        wait_until(&pool, |s| s.busy == 0).await;
    }

    #[tokio::test]
    async fn test_open_context_failure_releases_slot() {
        let launcher = FakeLauncher::default();
        launcher.fail_open(0);
        let pool = pool_of(1, launcher.clone());

        let err = pool
            .with_worker(|ctx| async move { Ok(ctx) })
            .await
            .unwrap_err();

        assert!(matches!(err, PoolError::Context(_)), "got: {err}");
        assert_eq!(pool.stats().busy, 0);
        assert_eq!(launcher.closed_contexts(), 0);
        assert!(pool.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_close_context_failure_keeps_task_result() {
        let launcher = FakeLauncher::default();
        launcher.fail_close(0);
        let pool = pool_of(1, launcher.clone());

        let value = pool
            .with_worker(|ctx| async move { Ok(ctx + 7) })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(launcher.closed_contexts(), 1);
        assert_eq!(pool.stats().busy, 0);
        assert!(pool.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_last_used_at_moves_on_acquire_and_release() {
        let pool = pool_of(1, FakeLauncher::default());
        pool.initialise().await.unwrap();
        let launched_at = pool.slots()[0].last_used_at;

        tokio::time::sleep(Duration::from_millis(5)).await;
        let lease = pool.acquire().await.unwrap();
        let acquired_at = pool.slots()[0].last_used_at;
        assert!(acquired_at > launched_at);

        tokio::time::sleep(Duration::from_millis(5)).await;
        drop(lease);
        let released_at = pool.slots()[0].last_used_at;
        assert!(released_at > acquired_at);
    }

    #[tokio::test]
    async fn test_idle_crash_is_replaced() {
        let launcher = FakeLauncher::default();
        let pool = pool_of(2, launcher.clone());
        pool.initialise().await.unwrap();
        let before = pool.slots()[0].generation;

        launcher.crash(0);
        wait_until(&pool, |s| s.crashes == 1 && s.unavailable == 0).await;

        assert_eq!(launcher.launches(), 3);
        let slots = pool.slots();
        assert_eq!(slots[0].index, 0);
        assert!(slots[0].available);
        assert_ne!(slots[0].generation, before);
        assert_eq!(pool.stats().free, 2);
    }

    #[tokio::test]
    async fn test_stale_release_after_crash_is_ignored() {
        let launcher = FakeLauncher::default();
        let pool = pool_of(1, launcher.clone());
        pool.initialise().await.unwrap();

        let stale = pool.acquire().await.unwrap();
        launcher.crash(0);
        wait_until(&pool, |s| s.crashes == 1 && s.unavailable == 0).await;
        assert_eq!(pool.stats().busy, 0);

        let fresh = pool.try_acquire().expect("replacement should be free");
        assert_eq!(fresh.process().id, 1);
        drop(stale);
        assert_eq!(pool.stats().busy, 1, "stale lease must not free the new holder");
        drop(fresh);
        assert_eq!(pool.stats().busy, 0);
    }

    #[tokio::test]
    async fn test_waiter_served_by_replacement() {
        let launcher = FakeLauncher::default();
        let pool = pool_of(1, launcher.clone());
        pool.initialise().await.unwrap();
        let _stuck = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.unwrap().process().id })
        };
        wait_until(&pool, |s| s.queued == 1).await;

        launcher.crash(0);
        let id = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter should be served")
            .unwrap();
        assert_eq!(id, 1);
    }

    #[tokio::test]
    async fn test_failed_replacement_leaves_slot_unavailable() {
        let launcher = FakeLauncher::default();
        launcher.fail_launch(2);
        let pool = pool_of(2, launcher.clone());
        pool.initialise().await.unwrap();

        launcher.crash(0);
        wait_until(&pool, |s| s.crashes == 1).await;
        // Give the replacement attempt time to finish.
        for _ in 0..50 {
            if launcher.launches() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(launcher.launches(), 3, "no retry after a failed replacement");
        let stats = pool.stats();
        assert_eq!(stats.unavailable, 1);
        assert_eq!(stats.free, 2);

        let only = pool.try_acquire().expect("slot 1 still usable");
        assert_eq!(only.index(), 1);
        assert!(pool.try_acquire().is_none());
    }

    #[tokio::test]
    async fn test_destroy_tolerates_shutdown_failure() {
        let launcher = FakeLauncher::default();
        launcher.fail_shutdown(1);
        let pool = pool_of(3, launcher.clone());
        pool.initialise().await.unwrap();

        pool.destroy().await;

        assert_eq!(launcher.shutdowns(), vec![0, 1, 2]);
        let stats = pool.stats();
        assert_eq!(stats.size, 0);
        assert_eq!(stats.queued, 0);
        // Exit notifications from the closed processes must not relaunch anything.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(launcher.launches(), 3);

        pool.destroy().await;
        assert!(matches!(
            pool.with_worker(|ctx| async move { Ok(ctx) }).await.unwrap_err(),
            PoolError::Destroyed
        ));
    }

    #[tokio::test]
    async fn test_destroy_waits_for_pending_replacement() {
        let launcher = FakeLauncher::with_delay(Duration::from_millis(50));
        let pool = pool_of(1, launcher.clone());
        pool.initialise().await.unwrap();

        launcher.crash(0);
        wait_until(&pool, |s| s.crashes == 1).await;
        pool.destroy().await;

        // The replacement (id 1) was launching when destroy started.
        assert_eq!(launcher.launches(), 2);
        assert_eq!(launcher.shutdowns(), vec![1]);
        assert_eq!(pool.stats().size, 0);
    }

    #[tokio::test]
    async fn test_destroy_fails_pending_waiters() {
        let pool = pool_of(1, FakeLauncher::default());
        pool.initialise().await.unwrap();
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|l| l.index()) })
        };
        wait_until(&pool, |s| s.queued == 1).await;

        pool.destroy().await;
        assert!(matches!(waiter.await.unwrap(), Err(PoolError::Destroyed)));
        // Releasing into a destroyed pool is a no-op.
        drop(held);
        assert_eq!(pool.stats().size, 0);
    }

    #[tokio::test]
    async fn test_reinitialise_after_destroy() {
        let launcher = FakeLauncher::default();
        let pool = pool_of(2, launcher.clone());
        pool.initialise().await.unwrap();
        pool.destroy().await;
        pool.initialise().await.unwrap();

        assert_eq!(launcher.launches(), 4);
        assert_eq!(pool.stats().size, 2);
        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.process().id, 2);
    }

    #[test]
    fn test_settings_from_config() {
        let config = Config::default();
        let settings = PoolSettings::from_config(&config);
        assert_eq!(settings.size, 3);
        assert_eq!(settings.task_timeout, Duration::from_secs(30));
        assert!(settings.idle_timeout.is_none());
    }
}
