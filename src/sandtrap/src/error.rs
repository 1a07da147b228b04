//! Error model for sandbox operations.

use std::time::Duration;

/// Everything `hook` and `run` can fail with.
///
/// Nothing is recovered internally: the first classified failure of a run
/// is surfaced as-is. A watchdog-forced disposal is reported as
/// [`Error::Timeout`]; the underlying engine interrupt is only logged at
/// debug level.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A hook path (or alias target) violated the accessor grammar.
    #[error("invalid accessor path '{0}'")]
    InvalidPath(String),

    /// A hook value could not be classified.
    #[error("invalid hook value: {0}")]
    InvalidValue(String),

    /// The resolver had no source for a URL, or a specifier produced no
    /// usable URL at all.
    #[error("no source found for '{0}'")]
    SourceNotFound(String),

    /// A source failed to compile.
    #[error("failed to parse {url}: {message}")]
    Parsing {
        /// URL of the source that failed to compile.
        url: String,
        /// Parser diagnostic.
        message: String,
    },

    /// Guest code threw and nothing caught it, or a resolver failed.
    #[error("execution failed: {message}")]
    Execution {
        /// Rendered guest exception.
        message: String,
    },

    /// The evaluation exceeded its time budget.
    #[error("script execution timed out after {0:?}")]
    Timeout(Duration),

    /// The isolate exceeded its memory budget and was disposed.
    #[error("isolate exceeded its {limit_mib} MiB memory limit")]
    MemoryLimit {
        /// The configured cap, in MiB.
        limit_mib: usize,
    },

    /// Embedding-infrastructure failure (isolate or context creation, the
    /// watchdog runtime being unavailable). Not a guest-visible condition.
    #[error("engine failure: {0}")]
    Engine(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
