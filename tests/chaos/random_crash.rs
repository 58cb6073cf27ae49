//! Chaos test: members crashing one after another.
//!
//! 6-member group. Crash members in a fixed pseudo-random order while the
//! survivors keep calling each other; the survivors must always agree on
//! the view and the coordinator.

use std::sync::Arc;

use flock_cluster::RpcCall;
use flock_integration_tests::TestCluster;
use flock_types::{HandlerError, MethodCall, Value};

#[tokio::test]
#[ntest::timeout(60000)]
async fn test_survivors_stay_consistent() {
    let c = TestCluster::new(6).await;
    for i in 0..6 {
        c.service(i).register_rpc_handler(
            "ping",
            Arc::new(|_: &MethodCall| -> Result<Value, HandlerError> { Ok(Value::from("pong")) }),
        );
    }

    let mut alive: Vec<usize> = (0..6).collect();
    for victim in [4, 0, 2, 5, 1] {
        c.crash(victim);
        alive.retain(|i| *i != victim);

        let expected: Vec<String> = alive.iter().map(|i| format!("node-{i}")).collect();
        for i in &alive {
            assert_eq!(c.view_names(*i), expected, "after crashing {victim}, node {i}");
        }

        // The oldest survivor coordinates.
        let coordinator = alive[0];
        assert!(c.service(coordinator).is_coordinator());

        let caller = *alive.last().unwrap();
        let pongs = c
            .service(caller)
            .call_on_cluster(RpcCall::new("ping", "ping"))
            .await
            .unwrap();
        assert_eq!(pongs.len(), alive.len(), "after crashing {victim}");
    }
}

/// A member that crashed is reported as left by every survivor.
#[tokio::test]
#[ntest::timeout(60000)]
async fn test_crash_reported_as_left() {
    let c = TestCluster::new(3).await;
    let victim = c.node(1).identity();

    c.crash(1);

    for i in [0, 2] {
        c.wait_for_notifications(i, if i == 0 { 3 } else { 1 }).await;
        let (_, view) = c.node(i).recorder.last().unwrap();
        assert_eq!(view.left(), &[victim.clone()]);
    }
}
