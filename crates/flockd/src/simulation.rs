//! In-process group simulation.
//!
//! Runs a group of members on a [`MemoryNetwork`] and walks it through
//! joins, RPC calls, state transfer, a partition and its merge, and a crash.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::{Context, Result};
use flock_cluster::{GroupService, ListenerResult, MembershipListener, RpcCall, TransferredState};
use flock_net::{Channel, MemoryChannel, MemoryNetwork};
use flock_types::{HandlerError, MembershipView, MethodCall, Value};
use tracing::{info, warn};

use crate::config::CliConfig;

/// Service answering `hello` with the member's name.
const GREETER: &str = "greeter";
/// Service whose state is a single counter.
const COUNTER: &str = "counter";

struct SimNode {
    name: String,
    service: GroupService,
    channel: Arc<MemoryChannel>,
}

/// Logs every view a member installs.
struct ViewLogger {
    node: String,
}

impl MembershipListener for ViewLogger {
    fn membership_changed(&self, view: &MembershipView) -> ListenerResult {
        info!(
            node = %self.node,
            view = %view,
            joined = view.joined().len(),
            left = view.left().len(),
            "view changed"
        );
        Ok(())
    }

    fn membership_changed_during_merge(&self, view: &MembershipView) -> ListenerResult {
        let partitions = view.merge_origins().map_or(0, <[_]>::len);
        info!(node = %self.node, view = %view, partitions, "partitions merged");
        Ok(())
    }
}

fn greeter(
    name: String,
    counter: Arc<AtomicI64>,
) -> impl Fn(&MethodCall) -> Result<Value, HandlerError> + Send + Sync {
    move |call: &MethodCall| match call.method.as_str() {
        "hello" => Ok(Value::from(format!("hello from {name}"))),
        "increment" => {
            let by = call
                .arg(0)
                .and_then(Value::as_i64)
                .ok_or_else(|| HandlerError::bad_argument("increment takes an integer"))?;
            Ok(Value::Int(counter.fetch_add(by, Ordering::SeqCst) + by))
        }
        other => Err(HandlerError::no_such_method(other)),
    }
}

async fn start_node(net: &MemoryNetwork, config: &CliConfig, name: String) -> Result<SimNode> {
    let channel = net.channel(&name);
    let service = GroupService::new(channel.clone(), config.group.clone())
        .with_context(|| format!("failed to build service for {name}"))?;

    let counter = Arc::new(AtomicI64::new(0));
    service.register_rpc_handler(GREETER, Arc::new(greeter(name.clone(), counter.clone())));
    let state = counter.clone();
    service.register_state_provider(
        COUNTER,
        Arc::new(move || Value::Int(state.load(Ordering::SeqCst))),
    );
    service.register_membership_listener(Arc::new(ViewLogger { node: name.clone() }), false);

    service
        .start()
        .await
        .with_context(|| format!("failed to start {name}"))?;

    let result = service
        .request_service_state(COUNTER)?
        .wait()
        .await
        .with_context(|| format!("state transfer failed on {name}"))?;
    if let Some(TransferredState::Decoded(Value::Int(value))) = result.state() {
        counter.store(*value, Ordering::SeqCst);
        println!("  {name} joined, counter state {value}");
    } else {
        println!("  {name} joined as first member");
    }

    Ok(SimNode {
        name,
        service,
        channel,
    })
}

fn print_views(nodes: &[SimNode]) {
    for node in nodes {
        println!(
            "  {:<12} view {}{}",
            node.name,
            node.service.current_view(),
            if node.service.is_coordinator() {
                "  (coordinator)"
            } else {
                ""
            }
        );
    }
}

/// Run the scripted scenario and print what every step observed.
pub async fn run(config: &CliConfig) -> Result<()> {
    let net = if config.simulation.flush {
        MemoryNetwork::with_flush()
    } else {
        MemoryNetwork::new()
    };
    let group = &config.group.group_name;

    println!("flock simulation");
    println!("  group:   {group}");
    println!("  members: {}", config.simulation.nodes);
    println!("  flush:   {}", config.simulation.flush);
    println!();

    // --- Formation ---
    println!("Forming group:");
    let mut nodes = Vec::with_capacity(config.simulation.nodes + 1);
    for i in 1..=config.simulation.nodes {
        nodes.push(start_node(&net, config, config.node_name(i)).await?);
    }
    print_views(&nodes);
    println!();

    // --- RPC ---
    println!("RPC:");
    let caller = nodes.last().context("no members")?;
    let replies = caller
        .service
        .call_on_cluster(RpcCall::new(GREETER, "hello"))
        .await?;
    for reply in &replies {
        println!("  {} <- {}", caller.name, reply.as_str().unwrap_or("?"));
    }
    let total = caller
        .service
        .call_on_coordinator(RpcCall::new(GREETER, "increment").arg(5))
        .await?;
    println!("  coordinator counter after increment: {total:?}");
    match caller
        .service
        .call_on_coordinator(RpcCall::new(GREETER, "explode"))
        .await
    {
        Ok(value) => println!("  unexpected reply {value:?}"),
        Err(e) => println!("  failing call reported: {e}"),
    }
    println!();

    // --- State transfer ---
    println!("State transfer:");
    let late = start_node(&net, config, config.node_name(config.simulation.nodes + 1)).await?;
    nodes.push(late);
    println!();

    // --- Partition and merge ---
    if nodes.len() >= 2 {
        println!("Partition:");
        let half = nodes.len() / 2;
        let left: Vec<_> = nodes[..half].iter().map(|n| n.channel.local_address()).collect();
        let right: Vec<_> = nodes[half..].iter().map(|n| n.channel.local_address()).collect();
        net.partition(group, &[left, right]);
        print_views(&nodes);
        println!();

        println!("Merge:");
        net.heal(group);
        print_views(&nodes);
        println!();
    }

    // --- Crash ---
    if let Some(victim) = nodes.pop() {
        println!("Crash of {}:", victim.name);
        net.crash(victim.channel.local_address());
        print_views(&nodes);
        println!();
    }

    // --- History ---
    if let Some(coordinator) = nodes.iter().find(|n| n.service.is_coordinator()) {
        println!("History of {}:", coordinator.name);
        for line in coordinator.service.show_history().lines() {
            println!("  {line}");
        }
    } else {
        warn!("no coordinator left after the scenario");
    }

    for node in &nodes {
        node.service.stop().await;
    }
    Ok(())
}
