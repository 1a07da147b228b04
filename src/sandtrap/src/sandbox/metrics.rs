/*!
Metric definitions for the sandbox module.
*/

use tracing::{instrument, Level};

// Gauge, sandboxes currently alive
pub(crate) static METRIC_ACTIVE_SANDBOXES: &str = "active_sandtrap_sandboxes";

// Counters, totals over the lifetime of the process
pub(crate) static METRIC_TOTAL_SANDBOXES: &str = "sandtrap_sandboxes_total";
pub(crate) static METRIC_RUNS: &str = "sandtrap_runs_total";
pub(crate) static METRIC_EVENTS: &str = "sandtrap_events_total";
pub(crate) static METRIC_WATCHDOG_TERMINATIONS: &str = "sandtrap_watchdog_terminations_total";

/// Keeps the active-sandbox gauge honest: increments on construction,
/// decrements on drop.
pub(crate) struct SandboxMetricsGuard(());

impl SandboxMetricsGuard {
    #[instrument(skip_all, level = Level::DEBUG)]
    pub(crate) fn new() -> Self {
        metrics::gauge!(METRIC_ACTIVE_SANDBOXES).increment(1);
        metrics::counter!(METRIC_TOTAL_SANDBOXES).increment(1);
        Self(())
    }
}

impl Drop for SandboxMetricsGuard {
    #[instrument(skip_all, level = Level::DEBUG)]
    fn drop(&mut self) {
        metrics::gauge!(METRIC_ACTIVE_SANDBOXES).decrement(1);
    }
}

#[cfg(test)]
mod tests {
    use crate::SandboxBuilder;

    #[test]
    #[ignore = "Needs to run separately to not get influenced by other tests"]
    fn sandbox_metrics_are_recorded() {
        let recorder = metrics_util::debugging::DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        recorder.install().unwrap();

        let snapshot = {
            let _sandbox = SandboxBuilder::new().build().unwrap();
            snapshotter.snapshot()
        };
        let snapshot = snapshot.into_vec();
        assert!(
            snapshot.len() >= 2,
            "expected the gauge and the counter, got {snapshot:#?}"
        );
    }
}
