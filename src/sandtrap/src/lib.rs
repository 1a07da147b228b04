//! An instrumented JavaScript sandbox for security research.
//!
//! sandtrap runs untrusted browser-oriented code inside an isolated
//! QuickJS engine whose global object has been replaced by recursively
//! self-generating proxy mocks. Every property get, property set, and
//! function or constructor call, including those reached through `eval`
//! and dynamically generated code, is recorded as a structured event in a
//! queryable [`Report`], so the program's runtime API surface can be
//! inspected without an instrumented browser.
//!
//! ```no_run
//! # async fn demo() -> sandtrap::Result<()> {
//! use sandtrap::{Query, SandboxBuilder, Value};
//!
//! let mut sandbox = SandboxBuilder::new().build()?;
//! sandbox
//!     .run_source("index.js", "navigator.sendBeacon('/t', secret)")
//!     .await?;
//!
//! let report = sandbox.report();
//! assert!(report.has(&Query::new().path("navigator.sendBeacon")));
//! # Ok(())
//! # }
//! ```
//!
//! Every accessed global is a mock that records interaction, not an
//! implementation: there is no real DOM and no network. Hooks let the host
//! shape what the guest observes (copied values, host callables, and
//! aliases), and a resolver callback supplies module sources on demand.
#![deny(dead_code, missing_docs, unused_mut)]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]

mod error;
mod event;
mod hook;
mod path;
mod report;
mod resolver;

/// Sandbox module containing the orchestrator and its collaborators.
pub mod sandbox;

/// Everything `hook` and `run` can fail with.
pub use error::{Error, Result};
/// One recorded guest interaction.
pub use event::{Event, EventKind, Literal, Location, Value};
/// Host function trait for callable hooks.
pub use hook::HookFunction;
/// The value side of a hook declaration.
pub use hook::HookValue;
/// Alias target for alias hooks.
pub use hook::Reference;
/// The append-only event log.
pub use report::{Query, Report};
/// Compile-time embedded source set for tests and embedders.
pub use resolver::EmbeddedSources;
/// Source text returned by a resolver.
pub use resolver::ResolvedSource;
/// User-provided source lookup.
pub use resolver::SourceResolver;
/// Per-call run overrides.
pub use sandbox::RunOptions;
/// The sandbox orchestrator.
pub use sandbox::Sandbox;
/// Builder for configuring a sandbox.
pub use sandbox::SandboxBuilder;
/// Cumulative execution statistics.
pub use sandbox::Stats;
/// Script or module compilation, re-exported from the engine layer.
pub use sandtrap_runtime::SourceType;
