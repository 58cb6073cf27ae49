//! Integration test: flush around view changes.
//!
//! On a flushing network every view change is bracketed by block/unblock,
//! listeners see the member blocked, and calls flow again afterwards.

use std::sync::{Arc, Mutex};

use flock_cluster::{GroupConfig, GroupService, ListenerResult, MembershipListener, RpcCall};
use flock_integration_tests::{GROUP, TestCluster};
use flock_types::{HandlerError, MembershipView, MethodCall, Value};

struct BlockedWatcher {
    service: GroupService,
    seen: Mutex<Vec<bool>>,
}

impl MembershipListener for BlockedWatcher {
    fn membership_changed(&self, _view: &MembershipView) -> ListenerResult {
        self.seen.lock().unwrap().push(self.service.is_flush_blocked());
        Ok(())
    }

    fn membership_changed_during_merge(&self, view: &MembershipView) -> ListenerResult {
        self.membership_changed(view)
    }
}

#[tokio::test]
async fn test_members_unblocked_after_formation() {
    let c = TestCluster::with_flush(4).await;
    for i in 0..4 {
        assert!(!c.service(i).is_flush_blocked(), "node {i} left blocked");
    }
}

#[tokio::test]
async fn test_every_view_change_is_flushed() {
    let mut config = GroupConfig::test_config(GROUP);
    config.allow_sync_listeners = true;
    let mut c = TestCluster::with_flush_config(1, config).await;

    let watcher = Arc::new(BlockedWatcher {
        service: c.service(0).clone(),
        seen: Mutex::new(Vec::new()),
    });
    c.service(0).register_membership_listener(watcher.clone(), true);

    c.add_node().await;
    c.add_node().await;
    c.partition(&[&[0], &[1, 2]]);
    c.heal();
    c.stop(2).await;

    assert_eq!(*watcher.seen.lock().unwrap(), vec![true; 5]);
    assert!(!c.service(0).is_flush_blocked());
}

#[tokio::test]
async fn test_calls_flow_after_view_change() {
    let mut c = TestCluster::with_flush(2).await;
    for i in 0..2 {
        c.service(i).register_rpc_handler(
            "echo",
            Arc::new(|call: &MethodCall| -> Result<Value, HandlerError> {
                Ok(call.arg(0).cloned().unwrap_or_default())
            }),
        );
    }

    c.add_node().await;

    let values = c
        .service(2)
        .call_on_cluster(RpcCall::new("echo", "echo").arg("ping").exclude_self(true))
        .await
        .unwrap();
    assert_eq!(values, vec![Value::from("ping"), Value::from("ping")]);
}
