//! Hard-termination watchdog.
//!
//! The engine's interrupt handler enforces the soft timeout, but a guest
//! stuck inside a host call (or an engine bug) can sail past it. Each run
//! therefore arms a watchdog on a shared, dedicated Tokio runtime; if the
//! grace deadline passes, the watchdog trips the isolate's kill flag and
//! the orchestrator disposes the isolate, keeping the report.
//!
//! The runtime is lazily initialized and shared by every sandbox in the
//! process. Worker count comes from `SANDTRAP_WATCHDOG_THREADS` (default
//! 2); if the runtime cannot be built the failure is cached permanently so
//! there are no retry storms; runs then fail closed.

use std::sync::LazyLock;
use std::time::Duration;

use sandtrap_runtime::KillHandle;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;

use super::metrics::METRIC_WATCHDOG_TERMINATIONS;
use crate::error::{Error, Result};

/// Environment variable configuring the watchdog runtime's worker count.
pub(crate) const ENV_WATCHDOG_THREADS: &str = "SANDTRAP_WATCHDOG_THREADS";

const DEFAULT_WATCHDOG_WORKERS: usize = 2;

static WATCHDOG_RUNTIME: LazyLock<Option<Runtime>> = LazyLock::new(|| {
    let workers = std::env::var(ENV_WATCHDOG_THREADS)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or(DEFAULT_WATCHDOG_WORKERS);

    match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .thread_name("sandtrap-watchdog")
        .enable_time()
        .build()
    {
        Ok(rt) => {
            tracing::debug!(workers, "initialized watchdog runtime");
            Some(rt)
        }
        Err(e) => {
            tracing::error!("failed to create watchdog runtime: {e}; runs will fail closed");
            None
        }
    }
});

fn get_watchdog_runtime() -> Option<&'static Runtime> {
    WATCHDOG_RUNTIME.as_ref()
}

/// RAII guard for one armed watchdog; aborts the timer task on drop so
/// every exit path of a run cancels its registration.
pub(crate) struct WatchdogTask(JoinHandle<()>);

impl Drop for WatchdogTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Arm a watchdog that trips `kill` after `grace`.
///
/// Fails closed: if the shared runtime is unavailable the run is refused
/// rather than executed without a hard stop.
pub(crate) fn arm(grace: Duration, kill: KillHandle) -> Result<WatchdogTask> {
    let runtime = get_watchdog_runtime()
        .ok_or_else(|| Error::Engine("watchdog runtime is unavailable".to_string()))?;

    Ok(WatchdogTask(runtime.spawn(async move {
        tokio::time::sleep(grace).await;
        tracing::warn!(
            grace_ms = grace.as_millis() as u64,
            "watchdog fired; requesting isolate disposal"
        );
        metrics::counter!(METRIC_WATCHDOG_TERMINATIONS).increment(1);
        kill.kill();
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandtrap_runtime::{Isolate, IsolateOptions};

    fn test_isolate() -> Isolate {
        Isolate::new(IsolateOptions {
            max_memory: 16 * 1024 * 1024,
            max_stack: 256 * 1024,
        })
        .unwrap()
    }

    #[test]
    fn watchdog_trips_kill_flag_after_grace() {
        let isolate = test_isolate();
        let task = arm(Duration::from_millis(20), isolate.kill_handle()).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        assert!(isolate.was_killed());
        drop(task);
    }

    #[test]
    fn dropped_watchdog_never_fires() {
        let isolate = test_isolate();
        let task = arm(Duration::from_millis(50), isolate.kill_handle()).unwrap();
        drop(task);
        std::thread::sleep(Duration::from_millis(200));
        assert!(!isolate.was_killed());
    }
}
