//! Integration test: group formation.
//!
//! Verifies that members agree on views, coordinator and join/leave deltas.

use flock_cluster::ClusterError;
use flock_integration_tests::{TestCluster, ViewKind};

/// Five members join one after the other and end up with the same view.
#[tokio::test]
async fn test_5_node_group_formation() {
    let c = TestCluster::new(5).await;

    let expected: Vec<String> = (0..5).map(|i| format!("node-{i}")).collect();
    for i in 0..5 {
        assert_eq!(c.view_names(i), expected, "node {i} should see all members");
        assert_eq!(c.service(i).current_view_id(), 4);
    }
}

/// The oldest member is the coordinator everywhere.
#[tokio::test]
async fn test_oldest_member_is_coordinator() {
    let c = TestCluster::new(3).await;

    assert!(c.service(0).is_coordinator());
    for i in 1..3 {
        assert!(!c.service(i).is_coordinator());
        assert_eq!(
            c.service(i).current_view().coordinator(),
            Some(&c.node(0).identity())
        );
    }
}

/// The first member is notified once per later join, with the joiner as delta.
#[tokio::test]
async fn test_join_deltas_reported_in_order() {
    let c = TestCluster::new(4).await;
    c.wait_for_notifications(0, 3).await;

    let views = c.node(0).recorder.views();
    assert_eq!(views.len(), 3);
    for (i, (kind, view)) in views.iter().enumerate() {
        assert_eq!(*kind, ViewKind::Changed);
        assert_eq!(view.joined(), &[c.node(i + 1).identity()]);
        assert!(view.left().is_empty());
        assert_eq!(view.len(), i + 2);
    }
}

/// Stopping the coordinator hands the role to the next oldest member.
#[tokio::test]
async fn test_coordinator_leave_promotes_next_member() {
    let c = TestCluster::new(3).await;
    let leaver = c.node(0).identity();

    c.stop(0).await;
    c.wait_for_notifications(1, 2).await;

    assert!(c.service(1).is_coordinator());
    assert_eq!(c.view_names(1), vec!["node-1", "node-2"]);
    let (_, view) = c.node(1).recorder.last().unwrap();
    assert_eq!(view.left(), &[leaver]);
}

/// A second process with a taken name cannot join.
#[tokio::test]
async fn test_duplicate_name_rejected() {
    let c = TestCluster::new(2).await;

    let clash = c.prepare_node("node-1");
    let err = clash.service.start().await.unwrap_err();
    assert!(matches!(err, ClusterError::DuplicateNode { .. }));

    // The member whose name was taken refuses the view.
    assert_eq!(c.view_names(1), vec!["node-0", "node-1"]);
}

/// Members added later see the full history of the group in their first view.
#[tokio::test]
async fn test_late_joiner_sees_everyone() {
    let mut c = TestCluster::new(2).await;
    let late = c.add_node().await;

    assert_eq!(c.view_names(late), vec!["node-0", "node-1", "node-2"]);
    // The first view is not delivered to listeners.
    assert!(c.node(late).recorder.views().is_empty());
}
