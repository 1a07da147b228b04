//! The query matcher against a real report, exercising the documented
//! matching rules end to end.

#![allow(clippy::disallowed_macros)]

use sandtrap::{EventKind, Query, SandboxBuilder, Value};

async fn alert_sandbox() -> sandtrap::Sandbox {
    let mut sandbox = SandboxBuilder::new().build().unwrap();
    sandbox
        .run_source("index.js", r#"alert("hello")"#)
        .await
        .unwrap();
    sandbox
}

#[tokio::test(flavor = "multi_thread")]
async fn path_queries_match_recorded_events() {
    let sandbox = alert_sandbox().await;
    let report = sandbox.report();

    assert!(report.has(&Query::new().path("alert")));
    assert!(!report.has(&Query::new().path("prompt")));
}

#[tokio::test(flavor = "multi_thread")]
async fn kind_queries_distinguish_event_types() {
    let sandbox = alert_sandbox().await;
    let report = sandbox.report();

    assert!(report.has(&Query::new().kind(EventKind::Get)));
    assert!(report.has(&Query::new().kind(EventKind::Call)));
    assert!(!report.has(&Query::new().kind(EventKind::Set)));
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_argument_query_excludes_unary_calls() {
    let sandbox = alert_sandbox().await;
    let report = sandbox.report();

    // The alert call has one argument, so the empty list matches nothing.
    assert!(report.find(&Query::new().arguments(vec![])).is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn argument_query_finds_the_call() {
    let sandbox = alert_sandbox().await;
    let report = sandbox.report();

    let found = report
        .find(&Query::new().argument(Value::literal("hello")))
        .unwrap();
    assert_eq!(found.kind(), EventKind::Call);
    assert_eq!(found.path(), "alert");

    assert!(report
        .find(&Query::new().argument(Value::literal("goodbye")))
        .is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn find_and_has_agree_and_find_is_first() {
    let sandbox = alert_sandbox().await;
    let report = sandbox.report();

    for query in [
        Query::new(),
        Query::new().path("alert"),
        Query::new().kind(EventKind::Set),
        Query::new().argument(Value::literal("hello")),
        Query::new().returns(Value::Ref(2)),
    ] {
        assert_eq!(report.has(&query), report.find(&query).is_some());
        if let Some(first) = report.find(&query) {
            let all = report.find_all(&query);
            assert_eq!(all.first(), Some(&first));
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn location_queries_match_subfields_independently() {
    let sandbox = alert_sandbox().await;
    let report = sandbox.report();

    assert!(report.has(&Query::new().filename("file:///index.js")));
    assert!(report.has(&Query::new().filename("file:///index.js").line(1)));
    assert!(!report.has(&Query::new().filename("file:///elsewhere.js")));
    assert!(!report.has(&Query::new().line(9999)));
}

#[tokio::test(flavor = "multi_thread")]
async fn returns_queries_only_match_calls() {
    let sandbox = alert_sandbox().await;
    let report = sandbox.report();

    let found = report.find(&Query::new().returns(Value::Ref(2))).unwrap();
    assert_eq!(found.kind(), EventKind::Call);
    // The GetEvent's value is ref 1, but `returns` must not match it.
    assert!(report.find(&Query::new().returns(Value::Ref(1))).is_none());
}
