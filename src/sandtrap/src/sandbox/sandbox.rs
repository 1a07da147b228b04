//! The sandbox orchestrator.

use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sandtrap_runtime::{
    DebugSink, EvalError, EvalJob, EventSink, HookInvoker, Isolate, IsolateOptions, ProviderError,
    SourceType,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{instrument, Level};
use url::Url;

use super::metrics::{SandboxMetricsGuard, METRIC_EVENTS, METRIC_RUNS};
use super::stats::{Stats, ThreadCpuTimer};
use super::watchdog;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::hook::{HookFunction, HookKind, HookRegistry, HookValue};
use crate::path;
use crate::report::Report;
use crate::resolver::{CacheProvider, SourceCache, SourceResolver};

/// Extra host time granted past the soft timeout before the watchdog
/// forcibly disposes the isolate.
const WATCHDOG_GRACE: Duration = Duration::from_millis(150);

/// Per-call overrides for one `run`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Override the sandbox's soft timeout for this call.
    pub timeout: Option<Duration>,
    /// Override the sandbox's source type for this call.
    pub source_type: Option<SourceType>,
}

/// An instrumented JavaScript sandbox.
///
/// Each sandbox owns one (lazily created) engine isolate, a hook table, a
/// module source cache, and the report its runs append to. Evaluations are
/// single-shot: `run` takes `&mut self`, so concurrent runs on one
/// instance are serialised by construction; separate instances are fully
/// independent.
///
/// ```no_run
/// # async fn demo() -> sandtrap::Result<()> {
/// use sandtrap::{Query, SandboxBuilder};
///
/// let mut sandbox = SandboxBuilder::new().build()?;
/// sandbox.run_source("index.js", "alert('hello')").await?;
/// assert!(sandbox.report().has(&Query::new().path("alert")));
/// # Ok(())
/// # }
/// ```
pub struct Sandbox {
    source_type: SourceType,
    origin: Url,
    max_memory_mib: usize,
    max_stack: usize,
    timeout: Duration,
    isolate: Option<Isolate>,
    hooks: HookRegistry,
    resolver: Option<Arc<dyn SourceResolver>>,
    cache: Arc<Mutex<SourceCache>>,
    report: Arc<Report>,
    next_value_id: Arc<AtomicU64>,
    run_count: u64,
    event_count: u64,
    wall_total: Duration,
    cpu_total: Duration,
    _metric_guard: SandboxMetricsGuard,
}

impl Sandbox {
    pub(super) fn new(
        source_type: SourceType,
        origin: Url,
        max_memory_mib: usize,
        max_stack: usize,
        timeout: Duration,
    ) -> Self {
        let mut sandbox = Self {
            source_type,
            origin,
            max_memory_mib,
            max_stack,
            timeout,
            isolate: None,
            hooks: HookRegistry::default(),
            resolver: None,
            cache: Arc::new(Mutex::new(SourceCache::default())),
            report: Arc::new(Report::new()),
            next_value_id: Arc::new(AtomicU64::new(1)),
            run_count: 0,
            event_count: 0,
            wall_total: Duration::ZERO,
            cpu_total: Duration::ZERO,
            _metric_guard: SandboxMetricsGuard::new(),
        };
        sandbox.install_default_hooks();
        sandbox
    }

    /// Browser-shaped defaults every fresh sandbox carries. Installed
    /// first, so user hooks at the same paths replace them.
    fn install_default_hooks(&mut self) {
        for name in ["frames", "global", "parent", "self", "window"] {
            self.hooks
                .insert(name, true, HookKind::Alias("globalThis".to_string()));
        }
        self.hooks.insert(
            "document",
            true,
            HookKind::Copy(Some(
                serde_json::json!({"nodeType": 9, "readyState": "complete"}),
            )),
        );
        self.hooks
            .insert("browser", true, HookKind::Copy(Some(serde_json::json!({}))));
        self.hooks
            .insert("chrome", true, HookKind::Alias("browser".to_string()));
        // An undefined `define`/`exports`/`module`/`require` short-circuits
        // AMD and CommonJS environment sniffing in packed payloads.
        for name in ["define", "exports", "module", "require"] {
            self.hooks.insert(name, true, HookKind::Copy(None));
        }
    }

    /// Register the source lookup used for entry specifiers and nested
    /// imports. Replaces any previously registered resolver.
    pub fn set_resolver(&mut self, resolver: impl SourceResolver + 'static) {
        self.resolver = Some(Arc::new(resolver));
    }

    /// Declare a writable hook at `path`. The value classifies into a
    /// copy, a host callable, or an alias; re-hooking a path replaces the
    /// previous declaration.
    #[instrument(err(Debug), skip(self, value), level = Level::DEBUG)]
    pub fn hook(&mut self, path: &str, value: impl Into<HookValue>) -> Result<()> {
        self.hook_with(path, value, true)
    }

    /// Declare a hook with explicit writability. Non-writable hooks are
    /// defined non-writable and non-configurable inside the guest.
    pub fn hook_with(
        &mut self,
        path: &str,
        value: impl Into<HookValue>,
        writable: bool,
    ) -> Result<()> {
        path::validate(path)?;
        let kind = match value.into().0 {
            HookKind::Alias(target) => {
                path::validate(&target)?;
                if target == path {
                    return Err(Error::InvalidValue(format!(
                        "alias '{path}' cannot target itself"
                    )));
                }
                HookKind::Alias(target)
            }
            other => other,
        };
        self.hooks.insert(path, writable, kind);
        Ok(())
    }

    /// Declare a host-callable hook from a serde-typed function.
    ///
    /// ```
    /// # let mut sandbox = sandtrap::SandboxBuilder::new().build().unwrap();
    /// sandbox.hook_fn("atob", |data: String| data.to_uppercase()).unwrap();
    /// ```
    pub fn hook_fn<Output, Args>(
        &mut self,
        path: &str,
        func: impl HookFunction<Output, Args> + Send + Sync + 'static,
    ) -> Result<()>
    where
        Output: Serialize,
        Args: DeserializeOwned,
    {
        self.hook(path, HookValue::callable(func))
    }

    /// Remove the hook at `path`. Returns whether one existed.
    pub fn unhook(&mut self, path: &str) -> bool {
        self.hooks.remove(path)
    }

    /// Evaluate the source behind `specifier` with the sandbox defaults.
    pub async fn run(&mut self, specifier: &str) -> Result<()> {
        self.run_with_options(specifier, None, RunOptions::default())
            .await
    }

    /// Evaluate `source` as if it lived at `specifier`. For modules the
    /// explicit text overrides any cached entry at the same URL.
    pub async fn run_source(&mut self, specifier: &str, source: impl Into<String>) -> Result<()> {
        self.run_with_options(specifier, Some(source.into()), RunOptions::default())
            .await
    }

    /// Single-shot evaluation with per-call overrides.
    ///
    /// The isolate is created on first use and reused afterwards; every
    /// call gets a fresh context, so guest state never leaks between runs
    /// while value identity and the module cache persist.
    #[instrument(err(Debug), skip(self, source, options), level = Level::INFO)]
    pub async fn run_with_options(
        &mut self,
        specifier: &str,
        source: Option<String>,
        options: RunOptions,
    ) -> Result<()> {
        let timeout = options.timeout.unwrap_or(self.timeout);
        let source_type = options.source_type.unwrap_or(self.source_type);

        let entry_url = self
            .origin
            .join(specifier)
            .map_err(|_| Error::SourceNotFound(specifier.to_string()))?;
        let href = entry_url.as_str().to_string();

        let entry_source = match source {
            Some(text) => {
                if source_type == SourceType::Module {
                    self.cache
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert_override(&href, &text);
                }
                text
            }
            None => self.fetch_entry(&entry_url, source_type).await?,
        };

        self.ensure_isolate()?;

        let (hook_table, callables) = self.hooks.for_guest()?;

        let report = self.report.clone();
        let next_id = self.next_value_id.clone();
        let run_events = Arc::new(AtomicU64::new(0));
        let sink_events = run_events.clone();
        let event_sink: EventSink = Rc::new(move |json: String, id: u64| {
            match serde_json::from_str::<Event>(&json) {
                Ok(event) => {
                    metrics::counter!(METRIC_EVENTS).increment(1);
                    sink_events.fetch_add(1, Ordering::SeqCst);
                    report.push(event);
                }
                Err(e) => tracing::debug!(error = %e, "dropped malformed guest event"),
            }
            // The guest hands its counter back after every emission; the
            // host copy is the single source of truth across resets.
            if id > 0 {
                next_id.fetch_max(id, Ordering::SeqCst);
            }
        });

        let debug_sink: DebugSink = Rc::new(|message: String| {
            tracing::debug!(target: "sandtrap::guest", "{message}");
        });

        let invoke_hook: HookInvoker = Rc::new(move |index: u32, payload: String| {
            let callable = callables
                .get(index as usize)
                .ok_or_else(|| format!("no hook callable at index {index}"))?;
            (**callable)(payload)
        });

        let provider = Rc::new(CacheProvider::new(
            self.cache.clone(),
            self.resolver.clone(),
            self.origin.clone(),
        ));

        let job = EvalJob {
            entry_url: href.clone(),
            entry_source,
            source_type,
            timeout,
            next_value_id: self.next_value_id.load(Ordering::SeqCst),
            hook_table,
            provider,
            invoke_hook,
            event_sink,
            debug_sink,
        };

        let isolate = self
            .isolate
            .as_mut()
            .ok_or_else(|| Error::Engine("isolate unavailable".to_string()))?;
        let watchdog = watchdog::arm(timeout + WATCHDOG_GRACE, isolate.kill_handle())?;

        let wall = Instant::now();
        let cpu = ThreadCpuTimer::start();
        let outcome = isolate.evaluate(job);
        let wall_elapsed = wall.elapsed();
        let cpu_elapsed = cpu.elapsed();
        let killed = isolate.was_killed();
        drop(watchdog);
        let events_this_run = run_events.load(Ordering::SeqCst);

        metrics::counter!(METRIC_RUNS).increment(1);

        match outcome {
            Ok(()) => {
                self.merge_run(wall_elapsed, cpu_elapsed, events_this_run);
                Ok(())
            }
            Err(EvalError::Interrupted) => {
                if killed {
                    // The engine's own timeout failed to stop the guest and
                    // the watchdog disposed the isolate. The report is kept;
                    // the aborted run's stats are not merged.
                    tracing::debug!("isolate was disposed during execution; watchdog already acted");
                    self.isolate = None;
                } else {
                    self.merge_run(wall_elapsed, cpu_elapsed, events_this_run);
                }
                Err(Error::Timeout(timeout))
            }
            Err(EvalError::OutOfMemory) => {
                // Memory enforcement is engine-driven and fatal for the
                // isolate; stats of the aborted run are not merged.
                self.isolate = None;
                Err(Error::MemoryLimit {
                    limit_mib: self.max_memory_mib,
                })
            }
            Err(EvalError::Syntax { message }) => {
                self.merge_run(wall_elapsed, cpu_elapsed, events_this_run);
                Err(Error::Parsing { url: href, message })
            }
            Err(EvalError::Thrown { message }) => {
                self.merge_run(wall_elapsed, cpu_elapsed, events_this_run);
                Err(Error::Execution { message })
            }
            Err(EvalError::Load(provider_error)) => {
                self.merge_run(wall_elapsed, cpu_elapsed, events_this_run);
                Err(match provider_error {
                    ProviderError::NotFound(url) => Error::SourceNotFound(url),
                    ProviderError::InvalidSpecifier { specifier, .. } => {
                        Error::SourceNotFound(specifier)
                    }
                    ProviderError::Syntax { url, message } => Error::Parsing { url, message },
                    ProviderError::Failed(message) => Error::Execution { message },
                })
            }
            Err(EvalError::Engine(message)) => Err(Error::Engine(message)),
        }
    }

    /// The report this sandbox appends to. Shared: reading (and clearing)
    /// is allowed at any time, individual events are immutable.
    pub fn report(&self) -> Arc<Report> {
        self.report.clone()
    }

    /// Cumulative statistics. See [`Stats`] for the merge rules.
    pub fn stats(&self) -> Stats {
        let heap = self
            .isolate
            .as_ref()
            .map(|i| i.heap_stats())
            .unwrap_or_default();
        Stats {
            runs: self.run_count,
            events: self.event_count,
            cpu_time: self.cpu_total,
            wall_time: self.wall_total,
            heap_used: heap.used.max(0) as u64,
            heap_allocated: heap.allocated.max(0) as u64,
        }
    }

    /// Tear down the isolate and module cache and reset value identity to
    /// 1. The hook table and resolver survive; the report is cleared only
    /// when `clear_report` is set. The next `run` starts from a fresh
    /// isolate.
    #[instrument(skip(self), level = Level::INFO)]
    pub fn dispose(&mut self, clear_report: bool) {
        self.isolate = None;
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.next_value_id.store(1, Ordering::SeqCst);
        self.run_count = 0;
        self.event_count = 0;
        self.wall_total = Duration::ZERO;
        self.cpu_total = Duration::ZERO;
        if clear_report {
            self.report.clear();
        }
    }

    fn ensure_isolate(&mut self) -> Result<()> {
        if self.isolate.is_none() {
            let isolate = Isolate::new(IsolateOptions {
                max_memory: self.max_memory_mib * 1024 * 1024,
                max_stack: self.max_stack,
            })
            .map_err(|e| Error::Engine(format!("{e:#}")))?;
            self.isolate = Some(isolate);
        }
        Ok(())
    }

    /// Resolve the entry source. Module entries go through the cache;
    /// script entries consult the resolver every time.
    async fn fetch_entry(&self, url: &Url, source_type: SourceType) -> Result<String> {
        if source_type == SourceType::Module {
            let cached = self
                .cache
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(url.as_str());
            if let Some(source) = cached {
                return Ok(source.to_string());
            }
        }

        let resolver = self
            .resolver
            .as_ref()
            .ok_or_else(|| Error::SourceNotFound(url.as_str().to_string()))?;

        match resolver.resolve(url).await {
            Ok(Some(resolved)) => {
                let text = resolved.into_text();
                if source_type == SourceType::Module {
                    self.cache
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(url.as_str(), &text);
                }
                Ok(text)
            }
            Ok(None) => Err(Error::SourceNotFound(url.as_str().to_string())),
            Err(e) => Err(Error::Execution {
                message: format!("resolver failed for {url}: {e:#}"),
            }),
        }
    }

    fn merge_run(&mut self, wall: Duration, cpu: Duration, events: u64) {
        self.run_count += 1;
        self.event_count += events;
        self.wall_total += wall;
        self.cpu_total += cpu;
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("origin", &self.origin.as_str())
            .field("source_type", &self.source_type)
            .field("max_memory_mib", &self.max_memory_mib)
            .field("timeout", &self.timeout)
            .field("isolate_alive", &self.isolate.is_some())
            .finish()
    }
}
