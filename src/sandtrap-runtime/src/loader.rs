//! Bridge between the engine's module loader callbacks and the host.
//!
//! The engine resolves nested `import` specifiers through a
//! [`Resolver`]/[`Loader`] pair registered once per runtime. Both sides
//! delegate to whatever [`ModuleProvider`] the current evaluation installed
//! in the shared [`ProviderSlot`]; outside an evaluation the slot is empty
//! and every import fails.
//!
//! The engine flattens loader failures into untyped import exceptions, so
//! the slot also carries a side channel: the first typed [`ProviderError`]
//! of an evaluation is stashed here and consulted during error
//! classification.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use rquickjs::loader::{Loader, Resolver};
use rquickjs::{Ctx, Module};

/// Source lookup used for nested module imports during one evaluation.
///
/// Implementations are host-side: they own the resolution policy (URL
/// joining, caching, consulting the user resolver) and must be synchronous
/// because the engine calls them from inside a blocking evaluation.
pub trait ModuleProvider {
    /// Turn `specifier`, imported from the module compiled under `base`,
    /// into the absolute URL the module will be keyed and compiled under.
    fn resolve(&self, base: &str, specifier: &str) -> Result<String, ProviderError>;

    /// Fetch the source text for a previously resolved URL.
    fn load(&self, url: &str) -> Result<String, ProviderError>;
}

/// Typed failure from a [`ModuleProvider`].
#[derive(Debug, Clone)]
pub enum ProviderError {
    /// The resolver had no source for this URL.
    NotFound(String),
    /// The specifier could not be turned into an absolute URL.
    InvalidSpecifier {
        /// The offending specifier.
        specifier: String,
        /// Why it was rejected.
        message: String,
    },
    /// A nested module failed to parse.
    Syntax {
        /// URL of the module that failed to compile.
        url: String,
        /// Parser diagnostic.
        message: String,
    },
    /// The resolver itself failed.
    Failed(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::NotFound(url) => write!(f, "no source found for {url}"),
            ProviderError::InvalidSpecifier { specifier, message } => {
                write!(f, "cannot resolve specifier '{specifier}': {message}")
            }
            ProviderError::Syntax { url, message } => {
                write!(f, "failed to parse {url}: {message}")
            }
            ProviderError::Failed(message) => write!(f, "module load failed: {message}"),
        }
    }
}

#[derive(Default)]
struct SlotInner {
    provider: Option<Rc<dyn ModuleProvider>>,
    error: Option<ProviderError>,
}

/// Per-runtime slot holding the active evaluation's provider.
///
/// Registered with the engine once at isolate creation; evaluations swap
/// their provider in and out around each run.
#[derive(Clone, Default)]
pub(crate) struct ProviderSlot(Rc<RefCell<SlotInner>>);

impl ProviderSlot {
    pub(crate) fn install(&self, provider: Rc<dyn ModuleProvider>) {
        let mut inner = self.0.borrow_mut();
        inner.provider = Some(provider);
        inner.error = None;
    }

    pub(crate) fn clear(&self) {
        self.0.borrow_mut().provider = None;
    }

    /// Take the first stashed load error of the current evaluation.
    pub(crate) fn take_error(&self) -> Option<ProviderError> {
        self.0.borrow_mut().error.take()
    }

    fn stash(&self, error: ProviderError) {
        let mut inner = self.0.borrow_mut();
        // Keep the first failure; follow-up errors are usually fallout.
        if inner.error.is_none() {
            inner.error = Some(error);
        }
    }

    fn provider(&self) -> Option<Rc<dyn ModuleProvider>> {
        self.0.borrow().provider.clone()
    }
}

impl Resolver for ProviderSlot {
    fn resolve(&mut self, _ctx: &Ctx<'_>, base: &str, name: &str) -> rquickjs::Result<String> {
        let Some(provider) = self.provider() else {
            return Err(rquickjs::Error::new_resolving(base, name));
        };
        match provider.resolve(base, name) {
            Ok(url) => Ok(url),
            Err(e) => {
                tracing::debug!(base, specifier = name, error = %e, "module resolution failed");
                self.stash(e);
                Err(rquickjs::Error::new_resolving(base, name))
            }
        }
    }
}

impl Loader for ProviderSlot {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Module<'js>> {
        let Some(provider) = self.provider() else {
            return Err(rquickjs::Error::new_loading(name));
        };
        let source = match provider.load(name) {
            Ok(source) => source,
            Err(e) => {
                tracing::debug!(url = name, error = %e, "module load failed");
                self.stash(e);
                return Err(rquickjs::Error::new_loading(name));
            }
        };
        match Module::declare(ctx.clone(), name, source) {
            Ok(module) => Ok(module),
            Err(e) => {
                // Compile failures of nested modules surface to the guest
                // as plain import errors; keep the parser diagnostic here
                // so classification can report Parsing instead.
                let message = match &e {
                    rquickjs::Error::Exception => ctx
                        .catch()
                        .as_object()
                        .and_then(|o| o.get::<_, Option<String>>("message").ok().flatten())
                        .unwrap_or_else(|| e.to_string()),
                    other => other.to_string(),
                };
                self.stash(ProviderError::Syntax {
                    url: name.to_string(),
                    message,
                });
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProvider;

    impl ModuleProvider for FixedProvider {
        fn resolve(&self, _base: &str, specifier: &str) -> Result<String, ProviderError> {
            Ok(format!("file:///{specifier}"))
        }

        fn load(&self, url: &str) -> Result<String, ProviderError> {
            Err(ProviderError::NotFound(url.to_string()))
        }
    }

    #[test]
    fn slot_keeps_first_error() {
        let slot = ProviderSlot::default();
        slot.install(Rc::new(FixedProvider));
        slot.stash(ProviderError::NotFound("file:///a.js".into()));
        slot.stash(ProviderError::Failed("later".into()));
        match slot.take_error() {
            Some(ProviderError::NotFound(url)) => assert_eq!(url, "file:///a.js"),
            other => panic!("expected the first stashed error, got {other:?}"),
        }
        assert!(slot.take_error().is_none());
    }

    #[test]
    fn empty_slot_has_no_provider() {
        let slot = ProviderSlot::default();
        assert!(slot.provider().is_none());
        slot.install(Rc::new(FixedProvider));
        assert!(slot.provider().is_some());
        slot.clear();
        assert!(slot.provider().is_none());
    }
}
