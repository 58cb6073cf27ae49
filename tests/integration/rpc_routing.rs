//! Integration test: RPC routing across a group.
//!
//! Covers the three addressing modes, handler failures and nodes that do
//! not run the called service.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

use flock_cluster::{ClusterError, ResponseFilter, RpcCall, RpcHandler};
use flock_integration_tests::{TestCluster, wait_until};
use flock_types::{HandlerError, MethodCall, NodeIdentity, Value};

/// Handler that answers with its member's name and counts invocations.
struct Named {
    name: String,
    calls: AtomicUsize,
}

impl RpcHandler for Named {
    fn invoke(&self, call: &MethodCall) -> Result<Value, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match call.method.as_str() {
            "whoami" => Ok(Value::from(self.name.as_str())),
            "add" => {
                let a = call.arg(0).and_then(Value::as_i64).unwrap_or(0);
                let b = call.arg(1).and_then(Value::as_i64).unwrap_or(0);
                Ok(Value::Int(a + b))
            }
            "fail" => Err(HandlerError::new("IllegalState", "asked to fail")),
            other => Err(HandlerError::no_such_method(other)),
        }
    }
}

fn install(c: &TestCluster, members: &[usize]) -> Vec<Arc<Named>> {
    members
        .iter()
        .map(|i| {
            let handler = Arc::new(Named {
                name: c.node(*i).name.clone(),
                calls: AtomicUsize::new(0),
            });
            c.service(*i).register_rpc_handler("named", handler.clone());
            handler
        })
        .collect()
}

fn sorted_names(values: Vec<Value>) -> Vec<String> {
    let mut names: Vec<String> = values
        .into_iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    names.sort();
    names
}

/// Stops after the first accepted response.
struct FirstOnly {
    accepted: AtomicUsize,
}

impl ResponseFilter for FirstOnly {
    fn is_acceptable(&self, _response: &Value, _sender: &NodeIdentity) -> bool {
        self.accepted.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn need_more_responses(&self) -> bool {
        self.accepted.load(Ordering::SeqCst) == 0
    }
}

/// Accepts everything and records who it was shown.
#[derive(Default)]
struct Seen {
    senders: Mutex<Vec<String>>,
}

impl ResponseFilter for Seen {
    fn is_acceptable(&self, _response: &Value, sender: &NodeIdentity) -> bool {
        self.senders.lock().unwrap().push(sender.id().to_string());
        true
    }

    fn need_more_responses(&self) -> bool {
        true
    }
}

#[tokio::test]
async fn test_cluster_call_collects_every_member() {
    let c = TestCluster::new(4).await;
    let handlers = install(&c, &[0, 1, 2, 3]);

    let values = c
        .service(2)
        .call_on_cluster(RpcCall::new("named", "whoami"))
        .await
        .unwrap();
    assert_eq!(
        sorted_names(values),
        vec!["node-0", "node-1", "node-2", "node-3"]
    );
    for (i, handler) in handlers.iter().enumerate() {
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1, "node {i}");
    }
}

#[tokio::test]
async fn test_cluster_call_skips_members_without_service() {
    let c = TestCluster::new(4).await;
    install(&c, &[1, 3]);

    let values = c
        .service(0)
        .call_on_cluster(RpcCall::new("named", "whoami"))
        .await
        .unwrap();
    assert_eq!(sorted_names(values), vec!["node-1", "node-3"]);
}

#[tokio::test]
async fn test_cluster_call_excluding_self() {
    let c = TestCluster::new(3).await;
    let handlers = install(&c, &[0, 1, 2]);

    let values = c
        .service(1)
        .call_on_cluster(RpcCall::new("named", "whoami").exclude_self(true))
        .await
        .unwrap();
    assert_eq!(sorted_names(values), vec!["node-0", "node-2"]);
    assert_eq!(handlers[1].calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_filter_stops_collection() {
    let c = TestCluster::new(4).await;
    install(&c, &[0, 1, 2, 3]);

    let filter = Arc::new(FirstOnly {
        accepted: AtomicUsize::new(0),
    });
    let values = c
        .service(0)
        .call_on_cluster(
            RpcCall::new("named", "whoami")
                .exclude_self(true)
                .filter(filter.clone()),
        )
        .await
        .unwrap();
    assert_eq!(values.len(), 1);
    assert_eq!(filter.accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_filter_never_sees_members_without_service() {
    let c = TestCluster::new(5).await;
    install(&c, &[1, 3]);

    let filter = Arc::new(Seen::default());
    let values = c
        .service(0)
        .call_on_cluster(RpcCall::new("named", "whoami").filter(filter.clone()))
        .await
        .unwrap();
    assert_eq!(sorted_names(values), vec!["node-1", "node-3"]);

    let mut seen = filter.senders.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, vec!["node-1", "node-3"]);
}

#[tokio::test]
async fn test_failures_dropped_from_cluster_call() {
    let c = TestCluster::new(3).await;
    install(&c, &[0, 1, 2]);

    let values = c
        .service(0)
        .call_on_cluster(RpcCall::new("named", "fail"))
        .await
        .unwrap();
    assert!(values.is_empty());
}

#[tokio::test]
async fn test_node_call_carries_failure_kind() {
    let c = TestCluster::new(3).await;
    install(&c, &[0, 1, 2]);

    let err = c
        .service(0)
        .call_on_node(RpcCall::new("named", "fail"), &c.node(2).identity())
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::Remote(ref e) if e.kind == "IllegalState"));

    let sum = c
        .service(0)
        .call_on_node(RpcCall::new("named", "add").arg(40).arg(2), &c.node(2).identity())
        .await
        .unwrap();
    assert_eq!(sum, Some(Value::Int(42)));
}

#[tokio::test]
async fn test_coordinator_call_follows_coordinator_change() {
    let c = TestCluster::new(3).await;
    install(&c, &[0, 1, 2]);

    let before = c
        .service(2)
        .call_on_coordinator(RpcCall::new("named", "whoami"))
        .await
        .unwrap();
    assert_eq!(before, Some(Value::from("node-0")));

    c.stop(0).await;

    let after = c
        .service(2)
        .call_on_coordinator(RpcCall::new("named", "whoami"))
        .await
        .unwrap();
    assert_eq!(after, Some(Value::from("node-1")));
}

#[tokio::test]
async fn test_async_cluster_call_reaches_everyone() {
    let c = TestCluster::new(3).await;
    let handlers = install(&c, &[0, 1, 2]);

    c.service(0)
        .call_async_on_cluster(RpcCall::new("named", "whoami"))
        .await
        .unwrap();

    wait_until(|| {
        handlers
            .iter()
            .all(|h| h.calls.load(Ordering::SeqCst) == 1)
    })
    .await;
}

#[tokio::test]
async fn test_call_to_crashed_member_fails() {
    let c = TestCluster::new(3).await;
    install(&c, &[0, 1, 2]);
    let victim = c.node(2).identity();

    c.crash(2);

    let err = c
        .service(0)
        .call_on_node(RpcCall::new("named", "whoami"), &victim)
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::Suspected(_)));

    let values = c
        .service(0)
        .call_on_cluster(RpcCall::new("named", "whoami"))
        .await
        .unwrap();
    assert_eq!(sorted_names(values), vec!["node-0", "node-1"]);
}
