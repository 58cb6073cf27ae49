//! Chaos test: network partition and merge.
//!
//! 6-member group. Split it 3 vs 3, let each side keep working, heal the
//! split and verify every member reports the merge with both sides' member
//! lists.

use std::sync::Arc;

use flock_cluster::{RpcCall, RpcHandler};
use flock_integration_tests::{TestCluster, ViewKind, wait_until};
use flock_types::{HandlerError, MethodCall, Value};

fn whoami(name: String) -> Arc<dyn RpcHandler> {
    Arc::new(move |_: &MethodCall| -> Result<Value, HandlerError> {
        Ok(Value::from(name.as_str()))
    })
}

#[tokio::test]
#[ntest::timeout(60000)]
async fn test_partition_and_merge() {
    let c = TestCluster::new(6).await;
    for i in 0..6 {
        c.service(i)
            .register_rpc_handler("whoami", whoami(c.node(i).name.clone()));
    }

    // --- Phase 1: split ---
    c.partition(&[&[0, 1, 2], &[3, 4, 5]]);

    for i in 0..3 {
        assert_eq!(c.view_names(i), vec!["node-0", "node-1", "node-2"]);
    }
    for i in 3..6 {
        assert_eq!(c.view_names(i), vec!["node-3", "node-4", "node-5"]);
    }
    // Each side elects its own coordinator.
    assert!(c.service(0).is_coordinator());
    assert!(c.service(3).is_coordinator());

    // --- Phase 2: each side only reaches its own members ---
    let left = c
        .service(1)
        .call_on_cluster(RpcCall::new("whoami", "name"))
        .await
        .unwrap();
    assert_eq!(left.len(), 3);
    let right = c
        .service(4)
        .call_on_coordinator(RpcCall::new("whoami", "name"))
        .await
        .unwrap();
    assert_eq!(right, Some(Value::from("node-3")));

    // --- Phase 3: heal ---
    c.heal();

    for i in 0..6 {
        let recorder = c.node(i).recorder.clone();
        wait_until(move || !recorder.merges().is_empty()).await;
        let (kind, view) = c.node(i).recorder.last().unwrap();
        assert_eq!(kind, ViewKind::Merge, "node {i} should see a merge");
        assert_eq!(view.len(), 6);

        let origins = view.merge_origins().unwrap();
        assert_eq!(origins.len(), 2);
        assert_eq!(origins[0].len(), 3);
        assert_eq!(origins[1].len(), 3);
    }

    // One coordinator again.
    let coordinators = (0..6).filter(|i| c.service(*i).is_coordinator()).count();
    assert_eq!(coordinators, 1);

    let everyone = c
        .service(5)
        .call_on_cluster(RpcCall::new("whoami", "name"))
        .await
        .unwrap();
    assert_eq!(everyone.len(), 6);
}

/// Members that stayed together through the split report the other side as
/// joined after the merge.
#[tokio::test]
#[ntest::timeout(60000)]
async fn test_merge_delta_is_other_side() {
    let c = TestCluster::new(4).await;
    c.partition(&[&[0, 1], &[2, 3]]);
    c.heal();

    let recorder = c.node(0).recorder.clone();
    wait_until(move || !recorder.merges().is_empty()).await;
    let merges = c.node(0).recorder.merges();
    assert_eq!(merges.len(), 1);
    let merged = &merges[0];
    assert_eq!(
        merged.joined(),
        &[c.node(2).identity(), c.node(3).identity()]
    );
    assert!(merged.left().is_empty());
}

/// Repeated split/heal cycles keep every member consistent.
#[tokio::test]
#[ntest::timeout(60000)]
async fn test_repeated_partitions() {
    let c = TestCluster::new(5).await;

    for round in 0..5 {
        let cut = 1 + round % 4;
        let left: Vec<usize> = (0..cut).collect();
        let right: Vec<usize> = (cut..5).collect();
        c.partition(&[left.as_slice(), right.as_slice()]);
        c.heal();

        let expected = c.view_names(0);
        assert_eq!(expected.len(), 5, "round {round}");
        for i in 1..5 {
            assert_eq!(c.view_names(i), expected, "round {round}, node {i}");
            assert_eq!(
                c.service(i).current_view_id(),
                c.service(0).current_view_id(),
                "round {round}, node {i}"
            );
        }
    }
}
