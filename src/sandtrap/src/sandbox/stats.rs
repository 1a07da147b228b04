//! Cumulative execution statistics.

use std::time::Duration;

/// Counters accumulated across a sandbox's runs.
///
/// Wall and CPU time are merged after every run that leaves the isolate
/// alive; a run aborted by forced disposal (watchdog or memory limit)
/// contributes nothing, so callers observing stats around such a run see
/// identical values. Heap gauges are read live from the engine and drop to
/// zero whenever the isolate is gone. Everything resets on full dispose.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Completed (non-aborted) runs.
    pub runs: u64,
    /// Events recorded by completed runs. Events from an aborted run stay
    /// in the report but are not counted here.
    pub events: u64,
    /// CPU time spent evaluating, summed over merged runs.
    pub cpu_time: Duration,
    /// Wall-clock time spent evaluating, summed over merged runs.
    pub wall_time: Duration,
    /// Engine heap bytes currently in live use.
    pub heap_used: u64,
    /// Engine heap bytes currently allocated from the system.
    pub heap_allocated: u64,
}

/// Measures the calling thread's CPU time across one evaluation.
///
/// On Linux this reads the thread CPU clock (`pthread_getcpuclockid` +
/// `clock_gettime`, nanosecond precision). Elsewhere it reports zero and
/// only wall time is meaningful.
pub(crate) struct ThreadCpuTimer {
    #[cfg(target_os = "linux")]
    clock_id: Option<libc::clockid_t>,
    #[cfg(target_os = "linux")]
    start_ns: u64,
}

#[cfg(target_os = "linux")]
impl ThreadCpuTimer {
    pub(crate) fn start() -> Self {
        let clock_id = Self::current_thread_clock();
        let start_ns = clock_id.and_then(Self::read_ns).unwrap_or(0);
        Self {
            clock_id,
            start_ns,
        }
    }

    pub(crate) fn elapsed(&self) -> Duration {
        let Some(clock_id) = self.clock_id else {
            return Duration::ZERO;
        };
        let Some(now_ns) = Self::read_ns(clock_id) else {
            return Duration::ZERO;
        };
        Duration::from_nanos(now_ns.saturating_sub(self.start_ns))
    }

    fn current_thread_clock() -> Option<libc::clockid_t> {
        let mut clock_id: libc::clockid_t = 0;
        let result = unsafe { libc::pthread_getcpuclockid(libc::pthread_self(), &mut clock_id) };
        (result == 0).then_some(clock_id)
    }

    fn read_ns(clock_id: libc::clockid_t) -> Option<u64> {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let result = unsafe { libc::clock_gettime(clock_id, &mut ts) };
        (result == 0).then(|| (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64))
    }
}

#[cfg(not(target_os = "linux"))]
impl ThreadCpuTimer {
    pub(crate) fn start() -> Self {
        Self {}
    }

    pub(crate) fn elapsed(&self) -> Duration {
        Duration::ZERO
    }
}
