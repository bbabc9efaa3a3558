//! End-to-end scenarios over the seed surface, plus the structural
//! invariants every finished tree upholds.

use super::fixtures::*;
use meshmap_core::{seed_ref, CrawlConfig, Node, NodeTransport, Tree, Web, ERROR_TIMEOUT};
use std::sync::Arc;

fn seeded_config(seed: &str) -> CrawlConfig {
    CrawlConfig {
        seeds: vec![format!("{STUB_PROVIDER}:{seed}")],
        ..fast_config()
    }
}

#[tokio::test]
async fn a_two_level_crawl_produces_the_expected_tree() {
    let provider = Arc::new(
        StubProvider::new()
            .name("1.2.3.4", "foo")
            .name("5.6.7.8", "bar")
            .downstream(
                "1.2.3.4",
                vec![NodeTransport::new("1234")
                    .with_address("5.6.7.8")
                    .with_debug_identifier("bar")
                    .with_num_connections(10)],
            )
            .downstream("5.6.7.8", vec![]),
    );
    let session = session_with(
        seeded_config("1.2.3.4"),
        Web::default(),
        vec![dummy_strategy()],
        vec![provider],
    );

    let tree = session.seed_tree().unwrap();
    spider(&session, &tree).await.unwrap();

    let seed = snapshot(&tree, &seed_ref("1.2.3.4"));
    assert_eq!(seed.service_name.as_deref(), Some("foo"));
    assert_eq!(seed.protocol.id, "SEED");
    assert_eq!(seed.protocol_mux, "seed");

    let (child_ref, child) = only_child(&seed);
    assert_eq!(child_ref, "DUM_1234_bar");
    assert_eq!(child.service_name.as_deref(), Some("bar"));
    assert_eq!(child.children, Some(Default::default()));
}

#[tokio::test]
async fn a_seed_connection_timeout_leaves_a_clean_partial_tree() {
    let provider = Arc::new(StubProvider::new().on_open(Behavior::Timeout));
    let session = session_with(
        seeded_config("1.2.3.4"),
        Web::default(),
        vec![dummy_strategy()],
        vec![provider.clone()],
    );

    let tree = session.seed_tree().unwrap();
    // Tolerated: the run finishes without error.
    spider(&session, &tree).await.unwrap();

    let seed = snapshot(&tree, &seed_ref("1.2.3.4"));
    assert!(seed.errors.contains(ERROR_TIMEOUT));
    assert_eq!(provider.lookup_count(), 0);
    assert_eq!(provider.downstream_count(), 0);
}

#[tokio::test]
async fn malformed_seeds_are_rejected() {
    let provider = Arc::new(StubProvider::new());
    let session = session_with(
        CrawlConfig {
            seeds: vec!["no-separator".to_string()],
            ..fast_config()
        },
        Web::default(),
        vec![],
        vec![provider],
    );

    assert!(matches!(
        session.seed_tree(),
        Err(crate::CrawlError::MalformedSeed(_))
    ));
}

#[tokio::test]
async fn disabled_seed_providers_are_rejected() {
    let provider = Arc::new(StubProvider::new());
    let session = session_with(
        CrawlConfig {
            disable_providers: vec![STUB_PROVIDER.to_string()],
            ..seeded_config("1.2.3.4")
        },
        Web::default(),
        vec![],
        vec![provider],
    );

    assert!(matches!(
        session.seed_tree(),
        Err(crate::CrawlError::SeedProviderDisabled(_))
    ));
}

#[tokio::test]
async fn unknown_seed_providers_are_rejected() {
    let provider = Arc::new(StubProvider::new());
    let session = session_with(
        CrawlConfig {
            seeds: vec!["nope:1.2.3.4".to_string()],
            ..fast_config()
        },
        Web::default(),
        vec![],
        vec![provider],
    );

    assert!(matches!(
        session.seed_tree(),
        Err(crate::CrawlError::Registry(_))
    ));
}

fn assert_failed_nodes_are_unexpanded(tree: &Tree) {
    fn walk(node: &Node) {
        if !node.errors.is_empty() || !node.warnings.is_empty() {
            assert!(
                node.children.is_none(),
                "node with diagnostics was expanded: {node:?}"
            );
        }
        for child in node.children.iter().flatten() {
            walk(&child.1.snapshot());
        }
    }
    for node in tree.values() {
        walk(&node.snapshot());
    }
}

#[tokio::test]
async fn diagnosed_nodes_are_never_expanded() {
    // A mixed tree: a healthy branch, a defunct edge, an addressless edge,
    // and a cycle back to the seed.
    let provider = Arc::new(
        StubProvider::new()
            .name("1.2.3.4", "foo")
            .name("5.6.7.8", "bar")
            .name("7.7.7.7", "foo")
            .downstream(
                "1.2.3.4",
                vec![
                    NodeTransport::new("1234")
                        .with_address("5.6.7.8")
                        .with_debug_identifier("bar")
                        .with_num_connections(10),
                    NodeTransport::new("2345")
                        .with_address("6.6.6.6")
                        .with_debug_identifier("dead")
                        .with_num_connections(0),
                    NodeTransport::new("3456").with_debug_identifier("nowhere"),
                ],
            )
            .downstream(
                "5.6.7.8",
                vec![NodeTransport::new("4567")
                    .with_address("7.7.7.7")
                    .with_debug_identifier("foo")],
            ),
    );
    let session = session_with(
        seeded_config("1.2.3.4"),
        Web::default(),
        vec![dummy_strategy()],
        vec![provider],
    );

    let tree = session.seed_tree().unwrap();
    spider(&session, &tree).await.unwrap();

    assert_failed_nodes_are_unexpanded(&tree);

    // The loop back to `foo` was flagged as a cycle.
    let seed = snapshot(&tree, &seed_ref("1.2.3.4"));
    let children = seed.children.unwrap();
    let bar = children.get("DUM_1234_bar").unwrap().snapshot();
    let (_, looped) = only_child(&bar);
    assert!(looped.warnings.contains(meshmap_core::WARNING_CYCLE));
}
