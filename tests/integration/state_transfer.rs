//! Integration test: state transfer to joining members.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use flock_cluster::{ClusterError, StateTransferError, TransferredState};
use flock_integration_tests::TestCluster;
use flock_net::{Channel, Codec, PostcardCodec};
use flock_types::Value;

fn provide_counter(c: &TestCluster, i: usize, counter: Arc<AtomicI64>) {
    c.service(i).register_state_provider(
        "counter",
        Arc::new(move || Value::Int(counter.load(Ordering::SeqCst))),
    );
}

/// A joiner gets the coordinator's current state, not a stale copy.
#[tokio::test]
async fn test_joiner_receives_current_state() {
    let mut c = TestCluster::new(2).await;
    let counter = Arc::new(AtomicI64::new(1));
    provide_counter(&c, 0, counter.clone());
    counter.store(17, Ordering::SeqCst);

    let joiner = c.add_node().await;
    let result = c
        .service(joiner)
        .request_service_state("counter")
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(result.state_received());
    assert_eq!(
        result.state().and_then(TransferredState::as_value),
        Some(&Value::Int(17))
    );
}

/// Several services travel in one stream; each request gets its own.
#[tokio::test]
async fn test_services_routed_independently() {
    let mut c = TestCluster::new(1).await;
    c.service(0)
        .register_state_provider("alpha", Arc::new(|| Value::from("a-state")));
    c.service(0)
        .register_state_provider("beta", Arc::new(|| Value::from(vec![Value::Int(1), Value::Int(2)])));

    let joiner = c.add_node().await;
    let alpha = c.service(joiner).request_service_state("alpha").unwrap();
    let alpha = alpha.wait().await.unwrap();
    let beta = c
        .service(joiner)
        .request_raw_service_state("beta")
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(
        alpha.state().and_then(TransferredState::as_value),
        Some(&Value::from("a-state"))
    );
    let raw = beta.state().and_then(TransferredState::as_bytes).unwrap();
    assert_eq!(
        PostcardCodec.decode(raw).unwrap(),
        Value::from(vec![Value::Int(1), Value::Int(2)])
    );
}

/// Only the coordinator answers; providers on other members are not asked.
#[tokio::test]
async fn test_state_comes_from_coordinator() {
    let mut c = TestCluster::new(2).await;
    provide_counter(&c, 0, Arc::new(AtomicI64::new(1)));
    provide_counter(&c, 1, Arc::new(AtomicI64::new(2)));

    let joiner = c.add_node().await;
    let result = c
        .service(joiner)
        .request_service_state("counter")
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(
        result.into_state(),
        Some(TransferredState::Decoded(Value::Int(1)))
    );
}

/// A coordinator without a provider answers with an empty stream.
#[tokio::test]
async fn test_no_provider_on_coordinator_yields_no_state() {
    let mut c = TestCluster::new(1).await;
    let joiner = c.add_node().await;

    let result = c
        .service(joiner)
        .request_service_state("counter")
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(result.state_received());
    assert!(result.state().is_none());
}

/// The first member of a group has nobody to ask and starts empty. Asking
/// again starts a new transfer, in any format.
#[tokio::test]
async fn test_retry_after_empty_result() {
    let c = TestCluster::new(1).await;

    let first = c
        .service(0)
        .request_service_state("counter")
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(!first.state_received());

    // Retrying replaces the finished task instead of reporting it pending.
    let again = c.service(0).request_raw_service_state("counter").unwrap();
    let again = again.wait().await.unwrap();
    assert!(!again.state_received());
}

/// A non-coordinator that finds nobody to ask fails instead of starting
/// with empty state.
#[tokio::test]
async fn test_orphaned_member_fails_initial_transfer() {
    let c = TestCluster::new(2).await;
    // The coordinator's receiver goes away without a new view being installed.
    c.node(0).channel.set_receiver(None);

    let err = c
        .service(1)
        .request_service_state("counter")
        .unwrap()
        .wait()
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClusterError::StateTransfer(StateTransferError::InitialTransferFailed { .. })
    ));
}
