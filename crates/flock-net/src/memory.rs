//! In-process group transport.
//!
//! [`MemoryNetwork`] owns the membership of every group and hands out
//! [`MemoryChannel`]s bound to it. Views are computed under the network lock
//! and pushed to receivers after the lock is released, so a receiver may
//! call back into its channel from inside a callback.
//!
//! With flush enabled every view installation is bracketed by
//! `block()` / `unblock()` on each member that receives the view.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::NetError;
use crate::message::{Address, Destination, RawView, Response, ResponseMode, ResponseOutcome};
use crate::{Channel, ChannelReceiver, SendOptions};

/// First port handed out to registered channels.
const BASE_PORT: u16 = 7800;

// ---------------------------------------------------------------------------
// Shared network state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct NetworkState {
    next_address: u64,
    nodes: HashMap<Address, NodeEntry>,
    groups: HashMap<String, GroupState>,
}

struct NodeEntry {
    name: Option<String>,
    physical: SocketAddr,
    discard_own: bool,
    receiver: Option<Arc<dyn ChannelReceiver>>,
    group: Option<String>,
    view: Option<RawView>,
}

/// Partitions of one group. A healthy group has exactly one.
#[derive(Default)]
struct GroupState {
    next_view_id: i64,
    partitions: Vec<RawView>,
}

impl GroupState {
    fn next_id(&mut self) -> i64 {
        let id = self.next_view_id;
        self.next_view_id += 1;
        id
    }

    fn all_members(&self) -> Vec<Address> {
        self.partitions
            .iter()
            .flat_map(|p| p.members.iter().copied())
            .collect()
    }
}

/// Views waiting to be pushed once the lock is released.
#[derive(Default)]
#[must_use]
struct Installation {
    views: Vec<(Arc<dyn ChannelReceiver>, RawView)>,
}

impl Installation {
    fn deliver(self, flush: bool) {
        if flush {
            for (receiver, _) in &self.views {
                receiver.block();
            }
        }
        for (receiver, view) in &self.views {
            receiver.view_accepted(view.clone());
        }
        if flush {
            for (receiver, _) in &self.views {
                receiver.unblock();
            }
        }
    }
}

impl NetworkState {
    /// Record `views` on their members and collect the receivers to notify.
    fn install(&mut self, views: Vec<RawView>) -> Installation {
        let mut installation = Installation::default();
        for view in views {
            for member in &view.members {
                if let Some(entry) = self.nodes.get_mut(member) {
                    entry.view = Some(view.clone());
                    if let Some(receiver) = &entry.receiver {
                        installation.views.push((receiver.clone(), view.clone()));
                    }
                }
            }
        }
        installation
    }

    fn join(&mut self, address: Address, group: &str) -> Result<Installation, NetError> {
        let entry = self.nodes.get_mut(&address).ok_or(NetError::Closed)?;
        if let Some(current) = &entry.group {
            if current == group {
                return Ok(Installation::default());
            }
            return Err(NetError::AlreadyConnected(current.clone()));
        }
        entry.group = Some(group.to_string());

        let state = self.groups.entry(group.to_string()).or_default();
        let view_id = state.next_id();
        let view = match state.partitions.first_mut() {
            Some(partition) => {
                let mut members = partition.members.clone();
                members.push(address);
                let view = RawView::new(view_id, members);
                *partition = view.clone();
                view
            }
            None => {
                let view = RawView::new(view_id, vec![address]);
                state.partitions.push(view.clone());
                view
            }
        };

        debug!(%address, group, view_id, members = view.members.len(), "member joined");
        Ok(self.install(vec![view]))
    }

    fn leave(&mut self, address: Address, crashed: bool) -> Installation {
        let Some(entry) = self.nodes.get_mut(&address) else {
            return Installation::default();
        };
        let Some(group) = entry.group.take() else {
            return Installation::default();
        };
        entry.view = None;
        if crashed {
            entry.receiver = None;
        }

        let Some(state) = self.groups.get_mut(&group) else {
            return Installation::default();
        };
        let Some(index) = state
            .partitions
            .iter()
            .position(|p| p.members.contains(&address))
        else {
            return Installation::default();
        };

        let members: Vec<Address> = state.partitions[index]
            .members
            .iter()
            .copied()
            .filter(|m| *m != address)
            .collect();
        if members.is_empty() {
            state.partitions.remove(index);
            return Installation::default();
        }

        let view = RawView::new(state.next_id(), members);
        state.partitions[index] = view.clone();
        debug!(%address, group, view_id = view.view_id, crashed, "member left");
        self.install(vec![view])
    }

    fn partition(&mut self, group: &str, splits: &[Vec<Address>]) -> Installation {
        let Some(state) = self.groups.get_mut(group) else {
            return Installation::default();
        };
        let current = state.all_members();

        let mut views: Vec<RawView> = Vec::new();
        for split in splits {
            let members: Vec<Address> = split
                .iter()
                .copied()
                .filter(|a| current.contains(a))
                .collect();
            if !members.is_empty() {
                views.push(RawView::new(state.next_id(), members));
            }
        }
        let leftover: Vec<Address> = current
            .iter()
            .copied()
            .filter(|a| !views.iter().any(|v| v.members.contains(a)))
            .collect();
        if !leftover.is_empty() {
            views.push(RawView::new(state.next_id(), leftover));
        }

        state.partitions = views.clone();
        debug!(group, partitions = views.len(), "group partitioned");
        self.install(views)
    }

    fn heal(&mut self, group: &str) -> Installation {
        let Some(state) = self.groups.get_mut(group) else {
            return Installation::default();
        };
        if state.partitions.len() < 2 {
            return Installation::default();
        }

        let subgroups = std::mem::take(&mut state.partitions);
        let members = subgroups
            .iter()
            .flat_map(|v| v.members.iter().copied())
            .collect();
        let view = RawView {
            view_id: state.next_id(),
            members,
            subgroups: Some(subgroups),
        };
        state.partitions = vec![view.clone()];
        debug!(group, view_id = view.view_id, "partitions merged");
        self.install(vec![view])
    }
}

// ---------------------------------------------------------------------------
// MemoryNetwork
// ---------------------------------------------------------------------------

/// An in-process network hosting any number of groups.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
    flush: bool,
}

impl MemoryNetwork {
    /// A network without flush support.
    pub fn new() -> Self {
        Self::default()
    }

    /// A network that brackets view changes with block/unblock.
    pub fn with_flush() -> Self {
        Self {
            state: Arc::default(),
            flush: true,
        }
    }

    /// Register a named channel that discards its own messages.
    pub fn channel(&self, name: &str) -> Arc<MemoryChannel> {
        self.register(Some(name), true)
    }

    /// Register a channel.
    ///
    /// Without a name the channel has no logical name and members see it by
    /// its physical address only.
    pub fn register(&self, name: Option<&str>, discard_own_messages: bool) -> Arc<MemoryChannel> {
        let mut state = lock(&self.state);
        state.next_address += 1;
        let address = Address::new(state.next_address);
        let port = BASE_PORT.wrapping_add(state.next_address as u16);
        state.nodes.insert(
            address,
            NodeEntry {
                name: name.map(str::to_string),
                physical: SocketAddr::from(([127, 0, 0, 1], port)),
                discard_own: discard_own_messages,
                receiver: None,
                group: None,
                view: None,
            },
        );

        Arc::new(MemoryChannel {
            state: self.state.clone(),
            address,
            flush: self.flush,
        })
    }

    /// Split `group` into the given partitions.
    ///
    /// Members not listed in any split end up together in one extra
    /// partition.
    pub fn partition(&self, group: &str, splits: &[Vec<Address>]) {
        let installation = lock(&self.state).partition(group, splits);
        installation.deliver(self.flush);
    }

    /// Merge every partition of `group` back into a single view.
    pub fn heal(&self, group: &str) {
        let installation = lock(&self.state).heal(group);
        installation.deliver(self.flush);
    }

    /// Drop `address` from its group without a clean disconnect.
    ///
    /// Requests to the crashed member are answered as suspected.
    pub fn crash(&self, address: Address) {
        let installation = lock(&self.state).leave(address, true);
        installation.deliver(self.flush);
    }

    /// Tell every other member of `address`'s partition that it is suspected.
    pub fn suspect(&self, address: Address) {
        let receivers: Vec<Arc<dyn ChannelReceiver>> = {
            let state = lock(&self.state);
            let Some(view) = state.nodes.get(&address).and_then(|e| e.view.clone()) else {
                return;
            };
            view.members
                .iter()
                .filter(|m| **m != address)
                .filter_map(|m| state.nodes.get(m).and_then(|e| e.receiver.clone()))
                .collect()
        };
        for receiver in receivers {
            receiver.suspect(address);
        }
    }

    /// Start a flush on `address` without installing a view.
    pub fn block(&self, address: Address) {
        if let Some(receiver) = self.receiver_of(address) {
            receiver.block();
        }
    }

    /// Finish a flush started with [`MemoryNetwork::block`].
    pub fn unblock(&self, address: Address) {
        if let Some(receiver) = self.receiver_of(address) {
            receiver.unblock();
        }
    }

    fn receiver_of(&self, address: Address) -> Option<Arc<dyn ChannelReceiver>> {
        lock(&self.state)
            .nodes
            .get(&address)
            .and_then(|e| e.receiver.clone())
    }

    /// The view currently installed on `address`.
    pub fn view_of(&self, address: Address) -> Option<RawView> {
        lock(&self.state)
            .nodes
            .get(&address)
            .and_then(|e| e.view.clone())
    }
}

fn lock(state: &Mutex<NetworkState>) -> MutexGuard<'_, NetworkState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// MemoryChannel
// ---------------------------------------------------------------------------

/// A channel attached to a [`MemoryNetwork`].
pub struct MemoryChannel {
    state: Arc<Mutex<NetworkState>>,
    address: Address,
    flush: bool,
}

/// A destination resolved for one send.
struct Target {
    address: Address,
    receiver: Option<Arc<dyn ChannelReceiver>>,
}

impl MemoryChannel {
    fn resolve_targets(
        &self,
        destination: Destination,
        options: &SendOptions,
    ) -> Result<Vec<Target>, NetError> {
        let state = lock(&self.state);
        let me = state.nodes.get(&self.address).ok_or(NetError::Closed)?;
        let view = me.view.as_ref().ok_or(NetError::NotConnected)?;

        let candidates = match destination {
            Destination::All => view.members.clone(),
            Destination::Node(address) => vec![address],
        };

        let targets = candidates
            .into_iter()
            .filter(|a| !options.exclusions.contains(a))
            .filter(|a| !(*a == self.address && me.discard_own))
            .map(|address| {
                let receiver = if view.members.contains(&address) {
                    state.nodes.get(&address).and_then(|e| e.receiver.clone())
                } else {
                    None
                };
                Target { address, receiver }
            })
            .collect();
        Ok(targets)
    }
}

#[async_trait::async_trait]
impl Channel for MemoryChannel {
    async fn connect(&self, group: &str) -> Result<(), NetError> {
        let installation = lock(&self.state).join(self.address, group)?;
        installation.deliver(self.flush);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), NetError> {
        let installation = lock(&self.state).leave(self.address, false);
        installation.deliver(self.flush);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        lock(&self.state)
            .nodes
            .get(&self.address)
            .is_some_and(|e| e.group.is_some())
    }

    fn flush_supported(&self) -> bool {
        self.flush
    }

    fn discard_own_messages(&self) -> bool {
        lock(&self.state)
            .nodes
            .get(&self.address)
            .is_some_and(|e| e.discard_own)
    }

    fn local_address(&self) -> Address {
        self.address
    }

    fn group_name(&self) -> Option<String> {
        lock(&self.state)
            .nodes
            .get(&self.address)
            .and_then(|e| e.group.clone())
    }

    fn view(&self) -> Option<RawView> {
        lock(&self.state)
            .nodes
            .get(&self.address)
            .and_then(|e| e.view.clone())
    }

    fn physical_address(&self, address: Address) -> Option<SocketAddr> {
        lock(&self.state).nodes.get(&address).map(|e| e.physical)
    }

    fn logical_name(&self, address: Address) -> Option<String> {
        lock(&self.state)
            .nodes
            .get(&address)
            .and_then(|e| e.name.clone())
    }

    fn set_receiver(&self, receiver: Option<Arc<dyn ChannelReceiver>>) {
        if let Some(entry) = lock(&self.state).nodes.get_mut(&self.address) {
            entry.receiver = receiver;
        }
    }

    async fn send(
        &self,
        destination: Destination,
        payload: Bytes,
        options: SendOptions,
    ) -> Result<Vec<Response>, NetError> {
        let targets = self.resolve_targets(destination, &options)?;
        let from = self.address;

        if options.mode == ResponseMode::None {
            for target in targets {
                if let Some(receiver) = target.receiver {
                    let payload = payload.clone();
                    tokio::task::spawn_blocking(move || {
                        receiver.handle(from, payload);
                    });
                }
            }
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + options.timeout;
        let mut responses = Vec::with_capacity(targets.len());
        let mut done = false;

        for target in targets {
            if done
                || options
                    .filter
                    .as_ref()
                    .is_some_and(|f| !f.need_more_responses())
            {
                responses.push(Response {
                    sender: target.address,
                    outcome: ResponseOutcome::NotReceived,
                });
                continue;
            }

            let Some(receiver) = target.receiver else {
                responses.push(Response {
                    sender: target.address,
                    outcome: ResponseOutcome::Suspected,
                });
                continue;
            };

            let request = payload.clone();
            let handled = tokio::task::spawn_blocking(move || receiver.handle(from, request));
            let outcome = match tokio::time::timeout_at(deadline, handled).await {
                Ok(Ok(bytes)) => {
                    let acceptable = options
                        .filter
                        .as_ref()
                        .is_none_or(|f| f.is_acceptable(&bytes, target.address));
                    if acceptable {
                        if options.mode == ResponseMode::First {
                            done = true;
                        }
                        ResponseOutcome::Received(bytes)
                    } else {
                        ResponseOutcome::NotReceived
                    }
                }
                Ok(Err(e)) => ResponseOutcome::Failed(e.to_string()),
                Err(_) => ResponseOutcome::NotReceived,
            };
            trace!(from = %from, to = %target.address, ?outcome, "response collected");
            responses.push(Response {
                sender: target.address,
                outcome,
            });
        }

        Ok(responses)
    }

    async fn get_state(&self, _timeout: Duration) -> Result<(), NetError> {
        let (provider, requester) = {
            let state = lock(&self.state);
            let me = state.nodes.get(&self.address).ok_or(NetError::Closed)?;
            let view = me.view.as_ref().ok_or(NetError::NotConnected)?;
            let requester = me.receiver.clone().ok_or(NetError::Closed)?;
            let coordinator = view.coordinator().ok_or(NetError::NoStateProvider)?;
            if coordinator == self.address {
                return Err(NetError::NoStateProvider);
            }
            let provider = state
                .nodes
                .get(&coordinator)
                .and_then(|e| e.receiver.clone())
                .ok_or(NetError::NoStateProvider)?;
            (provider, requester)
        };

        tokio::task::spawn_blocking(move || {
            let mut out = BytesMut::new();
            provider.get_state(&mut out);
            requester.set_state(out.freeze());
        });
        Ok(())
    }
}
