//! Module resolution and source loading.
//!
//! Specifiers become absolute URLs (WHATWG join semantics, fragments and
//! percent-encoding preserved), the full href is the cache key, and cache
//! misses are routed to the user's [`SourceResolver`]. Module sources are
//! cached for the lifetime of the isolate; script sources never are.

use std::borrow::Cow;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::runtime::{Handle, RuntimeFlavor};
use url::Url;

use sandtrap_runtime::{ModuleProvider, ProviderError};

/// Source text returned by a resolver; byte responses are decoded as
/// UTF-8.
#[derive(Debug, Clone)]
pub enum ResolvedSource {
    /// Already-decoded source text.
    Text(String),
    /// Raw bytes, interpreted as UTF-8 (lossily) when compiled.
    Bytes(Vec<u8>),
}

impl ResolvedSource {
    pub(crate) fn into_text(self) -> String {
        match self {
            ResolvedSource::Text(text) => text,
            ResolvedSource::Bytes(bytes) => match String::from_utf8_lossy(&bytes) {
                Cow::Borrowed(_) => String::from_utf8(bytes).unwrap_or_default(),
                Cow::Owned(text) => text,
            },
        }
    }
}

impl From<String> for ResolvedSource {
    fn from(text: String) -> Self {
        ResolvedSource::Text(text)
    }
}

impl From<&str> for ResolvedSource {
    fn from(text: &str) -> Self {
        ResolvedSource::Text(text.to_string())
    }
}

impl From<Vec<u8>> for ResolvedSource {
    fn from(bytes: Vec<u8>) -> Self {
        ResolvedSource::Bytes(bytes)
    }
}

/// User-provided source lookup: absolute URL in, source (or nothing) out.
///
/// `Ok(None)` means "no such source" and surfaces as
/// [`Error::SourceNotFound`](crate::Error::SourceNotFound); an `Err` fails
/// the run. Nested module imports invoke the resolver from the evaluating
/// thread, so implementations should not depend on a live Tokio reactor.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    /// Fetch the source behind `url`.
    async fn resolve(&self, url: &Url) -> anyhow::Result<Option<ResolvedSource>>;
}

/// Closed-set resolver over sources embedded at compile time.
///
/// Keys are matched against the full href first and then against the
/// URL's path with the leading slash stripped, so fixtures can be keyed
/// with short relative names:
///
/// ```no_run
/// use sandtrap::embed_sources;
///
/// let sources = embed_sources! {
///     "index.js" => @inline "import './lib.js';",
///     "lib.js" => @inline "answer(42);",
/// };
/// ```
#[derive(Clone, Copy)]
pub struct EmbeddedSources {
    sources: &'static phf::Map<&'static str, &'static str>,
}

impl EmbeddedSources {
    /// Wrap a phf map of `key => source`. See the `embed_sources!` macro
    /// for the usual way to build one.
    pub const fn new(sources: &'static phf::Map<&'static str, &'static str>) -> Self {
        Self { sources }
    }

    fn lookup(&self, url: &Url) -> Option<&'static str> {
        if let Some(source) = self.sources.get(url.as_str()).copied() {
            return Some(source);
        }
        let path = url.path().trim_start_matches('/');
        self.sources.get(path).copied()
    }
}

#[async_trait]
impl SourceResolver for EmbeddedSources {
    async fn resolve(&self, url: &Url) -> anyhow::Result<Option<ResolvedSource>> {
        Ok(self.lookup(url).map(ResolvedSource::from))
    }
}

/// Build an [`EmbeddedSources`] resolver from compile-time included files
/// (`"key" => "relative/path.js"`) or inline text
/// (`"key" => @inline "source"`).
#[macro_export]
macro_rules! embed_sources {
    ($($key:expr => $file:expr),* $(,)?) => {{
        use ::phf::{phf_map, Map};
        use $crate::EmbeddedSources;

        static EMBEDDED_SOURCES: Map<&'static str, &'static str> = phf_map! {
            $(
                $key => include_str!($file),
            )*
        };

        EmbeddedSources::new(&EMBEDDED_SOURCES)
    }};

    ($($key:expr => @inline $content:expr),* $(,)?) => {{
        use ::phf::{phf_map, Map};
        use $crate::EmbeddedSources;

        static EMBEDDED_SOURCES: Map<&'static str, &'static str> = phf_map! {
            $(
                $key => $content,
            )*
        };

        EmbeddedSources::new(&EMBEDDED_SOURCES)
    }};
}

/// Cached module sources, keyed by full href.
#[derive(Debug, Default)]
pub(crate) struct SourceCache {
    entries: HashMap<String, Arc<str>>,
}

impl SourceCache {
    pub(crate) fn get(&self, href: &str) -> Option<Arc<str>> {
        self.entries.get(href).cloned()
    }

    pub(crate) fn insert(&mut self, href: &str, source: &str) {
        self.entries.insert(href.to_string(), Arc::from(source));
    }

    /// Explicit source text for an already-known URL replaces the old
    /// entry outright.
    pub(crate) fn insert_override(&mut self, href: &str, source: &str) {
        self.entries.remove(href);
        self.insert(href, source);
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Run a resolver future to completion from a synchronous engine
/// callback. On a multi-thread Tokio runtime the worker is parked via
/// `block_in_place`; anywhere else a local executor drives the future,
/// which is why resolvers must not depend on a live reactor here.
pub(crate) fn sync_await<F: Future>(future: F) -> F::Output {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| handle.block_on(future))
        }
        _ => futures::executor::block_on(future),
    }
}

/// The per-run [`ModuleProvider`] handed to the engine: URL join for
/// resolution, cache-then-resolver for loading.
pub(crate) struct CacheProvider {
    cache: Arc<Mutex<SourceCache>>,
    resolver: Option<Arc<dyn SourceResolver>>,
    origin: Url,
}

impl CacheProvider {
    pub(crate) fn new(
        cache: Arc<Mutex<SourceCache>>,
        resolver: Option<Arc<dyn SourceResolver>>,
        origin: Url,
    ) -> Self {
        Self {
            cache,
            resolver,
            origin,
        }
    }
}

impl ModuleProvider for CacheProvider {
    fn resolve(&self, base: &str, specifier: &str) -> Result<String, ProviderError> {
        let base_url = Url::parse(base).unwrap_or_else(|_| self.origin.clone());
        let url = base_url
            .join(specifier)
            .map_err(|e| ProviderError::InvalidSpecifier {
                specifier: specifier.to_string(),
                message: e.to_string(),
            })?;
        Ok(url.into())
    }

    fn load(&self, href: &str) -> Result<String, ProviderError> {
        if let Some(source) = self
            .cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(href)
        {
            return Ok(source.to_string());
        }

        let resolver = self
            .resolver
            .as_ref()
            .ok_or_else(|| ProviderError::NotFound(href.to_string()))?;
        let url = Url::parse(href).map_err(|e| ProviderError::InvalidSpecifier {
            specifier: href.to_string(),
            message: e.to_string(),
        })?;

        match sync_await(resolver.resolve(&url)) {
            Ok(Some(resolved)) => {
                let text = resolved.into_text();
                self.cache
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(href, &text);
                Ok(text)
            }
            Ok(None) => Err(ProviderError::NotFound(href.to_string())),
            Err(e) => Err(ProviderError::Failed(format!(
                "resolver failed for {href}: {e:#}"
            ))),
        }
    }
}
