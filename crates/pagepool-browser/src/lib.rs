//! Headless browser worker pool.
//!
//! A fixed number of long-lived browser processes shared by many short
//! tasks. Callers go through [`WorkerPool::with_worker`], which checks out a
//! slot, opens a page on it, runs the task, and always hands the slot back.
//! Crashed processes are replaced in place by a supervisor task.
//!
//! The Chrome launcher requires the `browser` feature flag and
//! Chrome/Chromium installed.

#[cfg(feature = "browser")]
pub mod chrome;
pub mod error;
pub mod launcher;
pub mod lifecycle;
mod metrics;
pub mod pool;

#[cfg(feature = "browser")]
pub use chrome::{ChromeLauncher, ChromeProcess};
pub use error::PoolError;
pub use launcher::{FallbackLauncher, LaunchedWorker, WorkerLauncher, WorkerProcess};
pub use pool::{PoolSettings, PoolStats, SlotInfo, SlotLease, WorkerPool};
