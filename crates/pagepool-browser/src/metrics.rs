//! Pool metrics. Compiled to no-ops without the `metrics` feature.

/// Publish the current occupancy gauges.
pub(crate) fn record_occupancy(busy: usize, queued: usize) {
    #[cfg(feature = "metrics")]
    {
        metrics::gauge!("pool_slots_busy").set(busy as f64);
        metrics::gauge!("pool_queue_depth").set(queued as f64);
    }
    #[cfg(not(feature = "metrics"))]
    let _ = (busy, queued);
}

/// Record a detected process crash.
pub(crate) fn record_crash() {
    #[cfg(feature = "metrics")]
    metrics::counter!("pool_crashes_total").increment(1);
}

/// Record the outcome of a replacement launch.
pub(crate) fn record_replacement(ok: bool) {
    #[cfg(feature = "metrics")]
    {
        let labels = [("outcome", if ok { "ok" } else { "failed" })];
        metrics::counter!("pool_replacements_total", &labels).increment(1);
    }
    #[cfg(not(feature = "metrics"))]
    let _ = ok;
}

/// Record a finished `with_worker` task.
pub(crate) fn record_task(outcome: &'static str, duration_secs: f64) {
    #[cfg(feature = "metrics")]
    {
        let labels = [("outcome", outcome)];
        metrics::counter!("pool_tasks_total", &labels).increment(1);
        metrics::histogram!("pool_task_duration_seconds").record(duration_secs);
    }
    #[cfg(not(feature = "metrics"))]
    let _ = (outcome, duration_secs);
}
