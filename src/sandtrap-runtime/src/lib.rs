//! QuickJS embedding layer for the sandtrap sandbox.
//!
//! This crate owns everything that talks to the engine directly: the
//! [`Isolate`] wrapper around an `rquickjs::Runtime`, the per-evaluation
//! context lifecycle, the in-guest instrumentation bootstrap and the host
//! reference bindings it reports through, and the bridge that routes the
//! engine's module loader callbacks to a host-supplied [`ModuleProvider`].
//!
//! The crate deliberately knows nothing about reports, hooks semantics, or
//! resolution policy; it moves strings across the boundary and classifies
//! engine failures into [`EvalError`], leaving policy to the `sandtrap`
//! crate.

mod bindings;
mod loader;

use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use rquickjs::context::EvalOptions;
use rquickjs::promise::MaybePromise;
use rquickjs::{Context, Ctx, Module, Runtime, Value};

pub use loader::{ModuleProvider, ProviderError};

/// Name the bootstrap module is declared under inside each context. Stack
/// frames carrying this filename belong to the instrumentation layer and
/// are skipped during location extraction.
pub const BOOTSTRAP_MODULE_NAME: &str = "sandtrap:bootstrap";

/// The in-guest instrumentation program, declared as a module in every
/// fresh context before user code runs.
const BOOTSTRAP_SOURCE: &str = include_str!("bootstrap.js");

/// How an entry source is compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceType {
    /// Classic script semantics. Never cached; top-level `await` is
    /// supported through async evaluation.
    #[default]
    Script,
    /// ES module semantics with recursive import resolution.
    Module,
}

/// Receives each emitted event as a JSON string together with the guest's
/// current next-value-id counter.
pub type EventSink = Rc<dyn Fn(String, u64)>;

/// Receives debug messages from the guest instrumentation layer.
pub type DebugSink = Rc<dyn Fn(String)>;

/// Invoked when guest code calls a host-callable hook: `(index, args)` as
/// a JSON array string, returning the result as a JSON string or an error
/// message that is re-thrown inside the guest.
pub type HookInvoker = Rc<dyn Fn(u32, String) -> Result<String, String>>;

/// One evaluation request: entry source plus the host references the
/// bootstrap is bound to.
pub struct EvalJob {
    /// Absolute URL the entry source is compiled under.
    pub entry_url: String,
    /// Entry source text, already resolved by the host.
    pub entry_source: String,
    /// Script or module compilation.
    pub source_type: SourceType,
    /// Soft deadline enforced through the engine interrupt handler.
    pub timeout: Duration,
    /// Seed for the guest's value-id counter.
    pub next_value_id: u64,
    /// Serialised hook table (JSON array), installed by the bootstrap.
    pub hook_table: String,
    /// Source lookup for nested module imports.
    pub provider: Rc<dyn ModuleProvider>,
    /// Host-callable hook dispatch.
    pub invoke_hook: HookInvoker,
    /// Event delivery.
    pub event_sink: EventSink,
    /// Guest debug channel.
    pub debug_sink: DebugSink,
}

/// Engine-level failure classification for one evaluation.
///
/// The host maps these onto its public error kinds; in particular it
/// distinguishes a soft-deadline interrupt from a watchdog kill by asking
/// [`Isolate::was_killed`].
#[derive(Debug)]
pub enum EvalError {
    /// The interrupt handler stopped execution (deadline or kill flag).
    Interrupted,
    /// The engine ran out of its configured memory budget.
    OutOfMemory,
    /// The entry source failed to compile.
    Syntax {
        /// Parser diagnostic.
        message: String,
    },
    /// Guest code threw and nothing caught it.
    Thrown {
        /// Rendered exception (name and message).
        message: String,
    },
    /// A nested module load failed; carries the provider's typed error.
    Load(ProviderError),
    /// Engine infrastructure failure (context creation and the like).
    Engine(String),
}

/// Shared flags consulted by the engine's interrupt callback.
///
/// The soft deadline is armed per evaluation; the kill flag is tripped by
/// the host watchdog from another thread when the soft timeout failed to
/// stop the guest.
#[derive(Default)]
struct InterruptState {
    deadline: Mutex<Option<Instant>>,
    deadline_hit: AtomicBool,
    killed: AtomicBool,
}

impl InterruptState {
    fn begin(&self, timeout: Duration) {
        self.deadline_hit.store(false, Ordering::SeqCst);
        self.killed.store(false, Ordering::SeqCst);
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now() + timeout);
    }

    fn end(&self) {
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn should_interrupt(&self) -> bool {
        if self.killed.load(Ordering::SeqCst) {
            return true;
        }
        let expired = self
            .deadline
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some_and(|d| Instant::now() >= d);
        if expired {
            self.deadline_hit.store(true, Ordering::SeqCst);
        }
        expired
    }

    fn tripped(&self) -> bool {
        self.killed.load(Ordering::SeqCst) || self.deadline_hit.load(Ordering::SeqCst)
    }
}

/// Handle that lets the host watchdog terminate a running evaluation from
/// another thread. Safe to trip after the evaluation already finished; the
/// flag is cleared when the next evaluation begins.
#[derive(Clone)]
pub struct KillHandle(Arc<InterruptState>);

impl KillHandle {
    /// Request termination of the current evaluation.
    pub fn kill(&self) {
        self.0.killed.store(true, Ordering::SeqCst);
    }
}

/// Heap counters reported by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes in live use.
    pub used: i64,
    /// Bytes currently allocated from the system.
    pub allocated: i64,
}

/// Construction limits for an [`Isolate`].
#[derive(Debug, Clone, Copy)]
pub struct IsolateOptions {
    /// Engine memory cap in bytes.
    pub max_memory: usize,
    /// Engine stack cap in bytes.
    pub max_stack: usize,
}

/// An isolated engine instance: one `rquickjs::Runtime` plus the interrupt
/// state and the swappable module-provider slot its loader delegates to.
///
/// One isolate serves many evaluations; each [`evaluate`](Self::evaluate)
/// opens a fresh context so no guest state leaks between runs.
pub struct Isolate {
    runtime: Runtime,
    interrupt: Arc<InterruptState>,
    slot: loader::ProviderSlot,
    max_memory: usize,
}

// SAFETY:
// `rquickjs::Runtime` is not `Send` because it holds raw pointers, which
// are non-Send as a lint rather than a soundness statement (rquickjs itself
// implements Send for these types when its "parallel" feature is enabled).
// Every method that touches the engine takes `&mut self`, so an `Isolate`
// moved across threads is never accessed concurrently.
unsafe impl Send for Isolate {}

impl Isolate {
    /// Create an isolate with the given limits and install the interrupt
    /// handler and loader bridge.
    pub fn new(options: IsolateOptions) -> anyhow::Result<Self> {
        let runtime = Runtime::new().context("unable to initialize the engine runtime")?;
        runtime.set_memory_limit(options.max_memory);
        runtime.set_max_stack_size(options.max_stack);

        let interrupt = Arc::new(InterruptState::default());
        let handler_state = interrupt.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || handler_state.should_interrupt())));

        let slot = loader::ProviderSlot::default();
        runtime.set_loader(slot.clone(), slot.clone());

        Ok(Self {
            runtime,
            interrupt,
            slot,
            max_memory: options.max_memory,
        })
    }

    /// Handle for the host watchdog.
    pub fn kill_handle(&self) -> KillHandle {
        KillHandle(self.interrupt.clone())
    }

    /// Whether the last evaluation was stopped by [`KillHandle::kill`].
    pub fn was_killed(&self) -> bool {
        self.interrupt.killed.load(Ordering::SeqCst)
    }

    /// Whether the last evaluation tripped the soft deadline.
    pub fn deadline_hit(&self) -> bool {
        self.interrupt.deadline_hit.load(Ordering::SeqCst)
    }

    /// Live heap counters for this isolate.
    pub fn heap_stats(&self) -> HeapStats {
        let usage = self.runtime.memory_usage();
        HeapStats {
            used: usage.memory_used_size,
            allocated: usage.malloc_size,
        }
    }

    /// Run one evaluation in a fresh context.
    ///
    /// Events stream through the job's sinks while the guest runs; the
    /// return value only classifies how the evaluation ended. The context
    /// is released on every exit path.
    pub fn evaluate(&mut self, job: EvalJob) -> Result<(), EvalError> {
        self.interrupt.begin(job.timeout);
        self.slot.install(job.provider.clone());
        let outcome = self.eval_inner(&job);
        self.slot.clear();
        self.interrupt.end();
        outcome
    }

    fn eval_inner(&self, job: &EvalJob) -> Result<(), EvalError> {
        let context =
            Context::full(&self.runtime).map_err(|e| EvalError::Engine(e.to_string()))?;

        let outcome = context.with(|ctx| -> Result<(), EvalError> {
            bindings::install_bootstrap(&ctx, job)?;
            match job.source_type {
                SourceType::Script => self.eval_script(&ctx, job),
                SourceType::Module => self.eval_module(&ctx, job),
            }
        });

        // Detached promise chains may still have queued jobs; give them a
        // chance to run so their events land in the report. Rejections in
        // detached chains are dropped, browser-style.
        self.drain_pending_jobs();

        drop(context);
        outcome
    }

    fn eval_script<'js>(&self, ctx: &Ctx<'js>, job: &EvalJob) -> Result<(), EvalError> {
        let mut options = EvalOptions::default();
        options.global = true;
        options.strict = false;
        // Evaluate async so top-level await works and runtime throws are
        // classified at promise settlement, separately from parse errors.
        options.promise = true;

        let evaled: MaybePromise = ctx
            .eval_with_options(job.entry_source.as_bytes(), options)
            .map_err(|e| self.classify(ctx, e, true))?;

        match evaled.finish::<Value>() {
            Ok(_) => Ok(()),
            Err(rquickjs::Error::WouldBlock) => Ok(()),
            Err(e) => Err(self.classify(ctx, e, false)),
        }
    }

    fn eval_module<'js>(&self, ctx: &Ctx<'js>, job: &EvalJob) -> Result<(), EvalError> {
        let declared =
            Module::declare(ctx.clone(), job.entry_url.as_str(), job.entry_source.as_bytes())
                .map_err(|e| self.classify(ctx, e, true))?;

        let (_module, promise) = declared
            .eval()
            .map_err(|e| self.classify(ctx, e, false))?;

        match promise.finish::<()>() {
            Ok(()) => Ok(()),
            Err(rquickjs::Error::WouldBlock) => Ok(()),
            Err(e) => Err(self.classify(ctx, e, false)),
        }
    }

    fn heap_near_limit(&self) -> bool {
        let allocated = self.runtime.memory_usage().malloc_size.max(0) as usize;
        allocated.saturating_mul(10) >= self.max_memory.saturating_mul(9)
    }

    fn drain_pending_jobs(&self) {
        while !self.interrupt.tripped() {
            match self.runtime.execute_pending_job() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(_) => continue,
            }
        }
    }

    /// Turn an engine error into an [`EvalError`].
    ///
    /// Precedence: a typed loader failure stashed by the provider slot wins
    /// (the engine flattens it to a generic import exception), then memory
    /// exhaustion, then the interrupt flags, then syntax at compile stage,
    /// then a plain guest throw.
    fn classify(&self, ctx: &Ctx<'_>, err: rquickjs::Error, compiling: bool) -> EvalError {
        if let Some(load) = self.slot.take_error() {
            return EvalError::Load(load);
        }

        match err {
            rquickjs::Error::Exception => {
                let thrown = ctx.catch();
                let (name, message) = describe_thrown(&thrown);
                // An exhausted heap sometimes cannot even materialise the
                // "out of memory" error object; a bare exception with the
                // heap at the cap means the same thing.
                if is_out_of_memory(&message)
                    || (name.is_none() && message.is_empty() && self.heap_near_limit())
                {
                    return EvalError::OutOfMemory;
                }
                if self.interrupt.tripped() || is_interrupt(&message) {
                    return EvalError::Interrupted;
                }
                if compiling && name.as_deref() == Some("SyntaxError") {
                    return EvalError::Syntax { message };
                }
                EvalError::Thrown {
                    message: match name {
                        Some(name) => format!("{name}: {message}"),
                        None => message,
                    },
                }
            }
            rquickjs::Error::Allocation => EvalError::OutOfMemory,
            other => {
                if self.interrupt.tripped() {
                    EvalError::Interrupted
                } else {
                    EvalError::Engine(other.to_string())
                }
            }
        }
    }
}

impl Drop for Isolate {
    fn drop(&mut self) {
        // The handler captures an Arc of our interrupt state; detach it so
        // the engine teardown does not call back into a half-dropped self.
        self.runtime.set_interrupt_handler(None);
    }
}

fn describe_thrown(thrown: &Value<'_>) -> (Option<String>, String) {
    if thrown.is_undefined() || thrown.is_null() {
        return (None, String::new());
    }
    if let Some(obj) = thrown.as_object() {
        let name = obj.get::<_, Option<String>>("name").ok().flatten();
        let message = obj
            .get::<_, Option<String>>("message")
            .ok()
            .flatten()
            .unwrap_or_default();
        return (name, message);
    }
    if let Some(s) = thrown.as_string() {
        return (None, s.to_string().unwrap_or_default());
    }
    (None, format!("{thrown:?}"))
}

fn is_out_of_memory(message: &str) -> bool {
    message.contains("out of memory")
}

fn is_interrupt(message: &str) -> bool {
    message.contains("interrupted")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_state_deadline() {
        let state = InterruptState::default();
        state.begin(Duration::from_secs(60));
        assert!(!state.should_interrupt());
        assert!(!state.tripped());

        state.begin(Duration::ZERO);
        assert!(state.should_interrupt());
        assert!(state.tripped());
    }

    #[test]
    fn interrupt_state_kill_wins_without_deadline() {
        let state = Arc::new(InterruptState::default());
        state.begin(Duration::from_secs(60));
        KillHandle(state.clone()).kill();
        assert!(state.should_interrupt());
        assert!(state.tripped());
        // A new evaluation clears the stale kill flag.
        state.begin(Duration::from_secs(60));
        assert!(!state.should_interrupt());
    }

    #[test]
    fn oom_and_interrupt_sentinels() {
        assert!(is_out_of_memory("InternalError: out of memory"));
        assert!(!is_out_of_memory("ReferenceError: x is not defined"));
        assert!(is_interrupt("interrupted"));
    }
}
