//! Stage 1/2 behavior: connection handling, timeout classification, and the
//! per-address name cache.

use super::fixtures::*;
use crate::CrawlError;
use maplit::btreemap;
use meshmap_core::{NodeTransport, ERROR_NAME_LOOKUP_FAILED, ERROR_TIMEOUT};
use std::sync::Arc;

#[tokio::test]
async fn connection_is_opened_and_passed_through() {
    let provider = Arc::new(
        StubProvider::new()
            .name("1.2.3.4", "bar_name")
            .downstream("1.2.3.4", vec![]),
    );
    let mut strategy = dummy_strategy();
    strategy
        .provider_args
        .insert("baz".to_string(), serde_json::json!("buz"));
    let session = session(vec![strategy], vec![provider.clone()]);
    let tree = tree_of(vec![("dummy", seed_node("1.2.3.4"))]);

    spider(&session, &tree).await.unwrap();

    let calls = provider.calls.lock();
    assert_eq!(calls.open, vec!["1.2.3.4".to_string()]);
    assert_eq!(
        calls.lookup,
        vec![("1.2.3.4".to_string(), Some("conn:1.2.3.4".to_string()))]
    );
    assert_eq!(
        calls.downstream,
        vec![(
            "1.2.3.4".to_string(),
            Some("conn:1.2.3.4".to_string()),
            btreemap! {"baz".to_string() => serde_json::json!("buz")},
        )]
    );
}

#[tokio::test]
async fn provider_signalled_open_timeout_marks_the_node() {
    let provider = Arc::new(StubProvider::new().on_open(Behavior::Timeout));
    let session = session(vec![dummy_strategy()], vec![provider.clone()]);
    let tree = tree_of(vec![("dummy", seed_node("1.2.3.4"))]);

    spider(&session, &tree).await.unwrap();

    let node = snapshot(&tree, "dummy");
    assert!(node.errors.contains(ERROR_TIMEOUT));
    assert!(node.children.is_none());
    assert_eq!(provider.lookup_count(), 0);
    assert_eq!(provider.downstream_count(), 0);
}

#[tokio::test]
async fn slow_open_trips_the_deadline_and_marks_the_node() {
    let provider = Arc::new(StubProvider::new().on_open(Behavior::Slow));
    let session = session(vec![dummy_strategy()], vec![provider.clone()]);
    let tree = tree_of(vec![("dummy", seed_node("1.2.3.4"))]);

    spider(&session, &tree).await.unwrap();

    assert!(snapshot(&tree, "dummy").errors.contains(ERROR_TIMEOUT));
    assert_eq!(provider.lookup_count(), 0);
}

#[tokio::test]
async fn open_failure_is_fatal() {
    let provider = Arc::new(StubProvider::new().on_open(Behavior::Fail));
    let session = session(vec![dummy_strategy()], vec![provider]);
    let tree = tree_of(vec![("dummy", seed_node("1.2.3.4"))]);

    let err = spider(&session, &tree).await.unwrap_err();
    assert!(matches!(err, CrawlError::Provider { .. }));
}

#[tokio::test]
async fn lookup_is_cached_per_address() {
    let provider = Arc::new(StubProvider::new().name("9.9.9.9", "shared"));
    let session = session(vec![dummy_strategy()], vec![provider.clone()]);
    let tree = tree_of(vec![
        ("dummy", seed_node("9.9.9.9")),
        ("dummy2", seed_node("9.9.9.9")),
    ]);

    spider(&session, &tree).await.unwrap();

    assert_eq!(provider.lookup_count(), 1);
    assert_eq!(
        snapshot(&tree, "dummy").service_name.as_deref(),
        Some("shared")
    );
    assert_eq!(
        snapshot(&tree, "dummy2").service_name.as_deref(),
        Some("shared")
    );
}

#[tokio::test]
async fn slow_lookup_is_fatal() {
    let provider = Arc::new(StubProvider::new().on_lookup(Behavior::Slow));
    let session = session(vec![dummy_strategy()], vec![provider]);
    let tree = tree_of(vec![("dummy", seed_node("1.2.3.4"))]);

    let err = spider(&session, &tree).await.unwrap_err();
    assert!(matches!(err, CrawlError::FatalTimeout { .. }));
}

#[tokio::test]
async fn lookup_failure_is_fatal() {
    let provider = Arc::new(StubProvider::new().on_lookup(Behavior::Fail));
    let session = session(vec![dummy_strategy()], vec![provider]);
    let tree = tree_of(vec![("dummy", seed_node("1.2.3.4"))]);

    let err = spider(&session, &tree).await.unwrap_err();
    assert!(matches!(err, CrawlError::Provider { .. }));
}

#[tokio::test]
async fn unresolved_name_blocks_expansion() {
    let provider = Arc::new(StubProvider::new());
    let session = session(vec![dummy_strategy()], vec![provider.clone()]);
    let tree = tree_of(vec![("dummy", seed_node("1.2.3.4"))]);

    spider(&session, &tree).await.unwrap();

    let node = snapshot(&tree, "dummy");
    assert!(node.errors.contains(ERROR_NAME_LOOKUP_FAILED));
    assert!(node.children.is_none());
    assert_eq!(provider.downstream_count(), 0);
}

#[tokio::test]
async fn cached_expansion_skips_the_child_connection() {
    // The seed's only child shares the seed's address, so by the time the
    // child layer runs, its name and children are both cached and no second
    // connection is opened.
    let provider = Arc::new(
        StubProvider::new().name("1.2.3.4", "foo").downstream(
            "1.2.3.4",
            vec![NodeTransport::new("1234")
                .with_address("1.2.3.4")
                .with_debug_identifier("foo")],
        ),
    );
    let session = session(vec![dummy_strategy()], vec![provider.clone()]);
    let tree = tree_of(vec![("dummy", seed_node("1.2.3.4"))]);

    spider(&session, &tree).await.unwrap();

    assert_eq!(provider.open_count(), 1);
    assert_eq!(provider.lookup_count(), 1);
}
