//! Builder for [`Sandbox`].

use std::time::Duration;

use sandtrap_runtime::SourceType;
use url::Url;

use super::sandbox::Sandbox;
use crate::error::{Error, Result};

const MIN_MEMORY_MIB: usize = 8;
const DEFAULT_MEMORY_MIB: usize = 64;
const MIN_STACK_SIZE: usize = 256 * 1024;
const DEFAULT_STACK_SIZE: usize = 1024 * 1024;
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);
const DEFAULT_ORIGIN: &str = "file:///";

/// Configures and creates a [`Sandbox`].
///
/// ```
/// use sandtrap::{SandboxBuilder, SourceType};
/// use std::time::Duration;
///
/// let sandbox = SandboxBuilder::new()
///     .with_source_type(SourceType::Module)
///     .with_max_memory(128)
///     .with_timeout(Duration::from_secs(5))
///     .build()
///     .unwrap();
/// # drop(sandbox);
/// ```
pub struct SandboxBuilder {
    source_type: SourceType,
    origin: String,
    max_memory_mib: usize,
    max_stack: usize,
    timeout: Duration,
}

impl SandboxBuilder {
    /// Builder with the defaults: script sources, `file:///` origin,
    /// 64 MiB memory, 10 s timeout.
    pub fn new() -> Self {
        Self {
            source_type: SourceType::Script,
            origin: DEFAULT_ORIGIN.to_string(),
            max_memory_mib: DEFAULT_MEMORY_MIB,
            max_stack: DEFAULT_STACK_SIZE,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Default compilation mode for `run` calls.
    pub fn with_source_type(mut self, source_type: SourceType) -> Self {
        self.source_type = source_type;
        self
    }

    /// Base URL that relative specifiers resolve against. Must parse as an
    /// absolute URL at [`build`](Self::build) time.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// Engine memory cap in MiB. Values below the 8 MiB minimum are
    /// ignored; QuickJS cannot bring a context up with less.
    pub fn with_max_memory(mut self, max_memory_mib: usize) -> Self {
        if max_memory_mib >= MIN_MEMORY_MIB {
            self.max_memory_mib = max_memory_mib;
        }
        self
    }

    /// Engine stack cap in bytes. Values below the 256 KiB minimum are
    /// ignored.
    pub fn with_max_stack_size(mut self, max_stack: usize) -> Self {
        if max_stack >= MIN_STACK_SIZE {
            self.max_stack = max_stack;
        }
        self
    }

    /// Soft evaluation timeout; the hard watchdog fires 150 ms later.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Create the sandbox and install the default hook set.
    pub fn build(self) -> Result<Sandbox> {
        let origin = Url::parse(&self.origin)
            .map_err(|e| Error::InvalidValue(format!("origin '{}': {e}", self.origin)))?;
        Ok(Sandbox::new(
            self.source_type,
            origin,
            self.max_memory_mib,
            self.max_stack,
            self.timeout,
        ))
    }
}

impl Default for SandboxBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_minimum_limits_are_ignored() {
        let builder = SandboxBuilder::new()
            .with_max_memory(1)
            .with_max_stack_size(1);
        assert_eq!(builder.max_memory_mib, DEFAULT_MEMORY_MIB);
        assert_eq!(builder.max_stack, DEFAULT_STACK_SIZE);
    }

    #[test]
    fn minimum_memory_is_accepted() {
        let builder = SandboxBuilder::new().with_max_memory(8);
        assert_eq!(builder.max_memory_mib, 8);
    }

    #[test]
    fn invalid_origin_is_rejected_at_build() {
        let result = SandboxBuilder::new().with_origin("not a url").build();
        assert!(matches!(result, Err(Error::InvalidValue(_))));
    }

    #[test]
    fn relative_origin_is_rejected_at_build() {
        let result = SandboxBuilder::new().with_origin("some/dir/").build();
        assert!(matches!(result, Err(Error::InvalidValue(_))));
    }
}
