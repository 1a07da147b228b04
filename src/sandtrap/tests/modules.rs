//! Module resolution: nested imports, URL normalisation, caching, and
//! load-failure classification.

#![allow(clippy::disallowed_macros)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use sandtrap::{
    embed_sources, Error, EventKind, Query, ResolvedSource, SandboxBuilder, SourceResolver,
    SourceType,
};
use url::Url;

fn module_sandbox() -> sandtrap::Sandbox {
    SandboxBuilder::new()
        .with_source_type(SourceType::Module)
        .build()
        .unwrap()
}

/// In-memory resolver that counts how often each URL is fetched.
struct CountingResolver {
    sources: HashMap<String, String>,
    fetches: Arc<AtomicUsize>,
}

impl CountingResolver {
    fn new(entries: &[(&str, &str)]) -> (Self, Arc<AtomicUsize>) {
        let fetches = Arc::new(AtomicUsize::new(0));
        let resolver = Self {
            sources: entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            fetches: fetches.clone(),
        };
        (resolver, fetches)
    }
}

#[async_trait]
impl SourceResolver for CountingResolver {
    async fn resolve(&self, url: &Url) -> anyhow::Result<Option<ResolvedSource>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .sources
            .get(url.as_str())
            .map(|s| ResolvedSource::from(s.clone())))
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn nested_imports_resolve_and_run_in_graph_order() {
    let sources = embed_sources! {
        "index.js" => "fixtures/index.js",
        "test.js" => "fixtures/test.js",
        "subdir/hey.js" => "fixtures/subdir/hey.js",
        "a%20[weird]%20(name).js" => "fixtures/a [weird] (name).js",
    };

    let mut sandbox = module_sandbox();
    sandbox.set_resolver(sources);
    sandbox.run("./index.js").await.unwrap();

    let report = sandbox.report();
    let calls = report.find_all(&Query::new().kind(EventKind::Call));
    let paths: Vec<&str> = calls.iter().map(|e| e.path()).collect();
    assert_eq!(paths, ["weirdName", "iGotCalled", "index"]);

    // Each call is located in the module that made it, under its
    // normalised URL.
    assert_eq!(
        calls[0].location().filename,
        "file:///a%20[weird]%20(name).js"
    );
    assert_eq!(calls[1].location().filename, "file:///test.js");
    assert_eq!(calls[2].location().filename, "file:///index.js");
}

#[tokio::test(flavor = "multi_thread")]
async fn module_sources_are_cached_across_runs() {
    let (resolver, fetches) = CountingResolver::new(&[
        ("file:///index.js", "import './lib.js'; entry();"),
        ("file:///lib.js", "libLoaded();"),
    ]);

    let mut sandbox = module_sandbox();
    sandbox.set_resolver(resolver);

    sandbox.run("index.js").await.unwrap();
    let after_first = fetches.load(Ordering::SeqCst);
    assert_eq!(after_first, 2);

    sandbox.run("index.js").await.unwrap();
    assert_eq!(
        fetches.load(Ordering::SeqCst),
        after_first,
        "second run should be served from the cache"
    );

    // Both runs recorded their calls.
    let report = sandbox.report();
    assert_eq!(report.find_all(&Query::new().path("entry")).len(), 2 * 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn dispose_invalidates_the_module_cache() {
    let (resolver, fetches) =
        CountingResolver::new(&[("file:///index.js", "entry();")]);

    let mut sandbox = module_sandbox();
    sandbox.set_resolver(resolver);

    sandbox.run("index.js").await.unwrap();
    assert_eq!(fetches.load(Ordering::SeqCst), 1);

    sandbox.dispose(true);
    sandbox.run("index.js").await.unwrap();
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn explicit_source_overrides_a_cached_module() {
    let (resolver, _fetches) =
        CountingResolver::new(&[("file:///index.js", "original();")]);

    let mut sandbox = module_sandbox();
    sandbox.set_resolver(resolver);

    sandbox.run("index.js").await.unwrap();
    assert!(sandbox.report().has(&Query::new().path("original")));

    sandbox
        .run_source("index.js", "replaced();")
        .await
        .unwrap();
    assert!(sandbox.report().has(&Query::new().path("replaced")));

    // The override stays cached for later runs.
    sandbox.run("index.js").await.unwrap();
    assert_eq!(
        sandbox.report().find_all(&Query::new().path("replaced")).len(),
        2 * 2
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_nested_import_reports_source_not_found() {
    let (resolver, _fetches) =
        CountingResolver::new(&[("file:///index.js", "import './gone.js';")]);

    let mut sandbox = module_sandbox();
    sandbox.set_resolver(resolver);

    let err = sandbox.run("index.js").await.unwrap_err();
    match err {
        Error::SourceNotFound(url) => assert_eq!(url, "file:///gone.js"),
        other => panic!("expected SourceNotFound, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_entry_reports_source_not_found() {
    let mut sandbox = module_sandbox();
    let err = sandbox.run("nothing-here.js").await.unwrap_err();
    assert!(matches!(err, Error::SourceNotFound(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn syntactically_invalid_entry_reports_parsing() {
    let mut sandbox = SandboxBuilder::new().build().unwrap();
    let err = sandbox
        .run_source("bad.js", "function ( {")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Parsing { .. }), "got {err:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn syntactically_invalid_module_reports_parsing() {
    let mut sandbox = module_sandbox();
    let err = sandbox
        .run_source("bad.js", "import { from 'nowhere';")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Parsing { .. }), "got {err:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn syntactically_invalid_nested_module_reports_parsing() {
    let (resolver, _fetches) = CountingResolver::new(&[
        ("file:///index.js", "import './broken.js';"),
        ("file:///broken.js", "let let = 1;"),
    ]);

    let mut sandbox = module_sandbox();
    sandbox.set_resolver(resolver);

    let err = sandbox.run("index.js").await.unwrap_err();
    match err {
        Error::Parsing { url, .. } => assert_eq!(url, "file:///broken.js"),
        other => panic!("expected Parsing, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn guest_exceptions_surface_as_execution_errors() {
    let mut sandbox = SandboxBuilder::new().build().unwrap();
    let err = sandbox
        .run_source("index.js", "throw new TypeError('boom')")
        .await
        .unwrap_err();
    match err {
        Error::Execution { message } => assert!(message.contains("boom"), "message: {message}"),
        other => panic!("expected Execution, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_resolver_surfaces_as_execution_error() {
    struct FailingResolver;

    #[async_trait]
    impl SourceResolver for FailingResolver {
        async fn resolve(&self, _url: &Url) -> anyhow::Result<Option<ResolvedSource>> {
            anyhow::bail!("backend offline")
        }
    }

    let mut sandbox = module_sandbox();
    sandbox.set_resolver(FailingResolver);
    let err = sandbox.run("index.js").await.unwrap_err();
    match err {
        Error::Execution { message } => assert!(message.contains("backend offline")),
        other => panic!("expected Execution, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn byte_sources_are_decoded_as_utf8() {
    struct ByteResolver;

    #[async_trait]
    impl SourceResolver for ByteResolver {
        async fn resolve(&self, _url: &Url) -> anyhow::Result<Option<ResolvedSource>> {
            Ok(Some(ResolvedSource::from(
                "tag('caf\u{e9}');".as_bytes().to_vec(),
            )))
        }
    }

    let mut sandbox = module_sandbox();
    sandbox.set_resolver(ByteResolver);
    sandbox.run("index.js").await.unwrap();

    let call = sandbox
        .report()
        .find(&Query::new().kind(EventKind::Call).path("tag"))
        .unwrap();
    assert_eq!(
        call.arguments().unwrap(),
        &[sandtrap::Value::literal("caf\u{e9}")]
    );
}
