//! Membership tracking and view-change processing.
//!
//! [`Membership`] holds the current view behind an [`ArcSwap`] so readers
//! never block the transport thread that replaces it. [`ViewProcessor`]
//! turns every view pushed by the channel into a [`MembershipView`],
//! publishes it and fans it out to listeners.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use flock_net::{Address, RawView};
use flock_types::{MembershipView, NodeIdentity};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::ClusterError;
use crate::history::ViewHistory;
use crate::listener::{self, ListenerRegistry, ViewNotifier};
use crate::resolver::NodeResolver;

// ---------------------------------------------------------------------------
// Current view
// ---------------------------------------------------------------------------

/// A published view together with the transport addresses of its members.
pub(crate) struct ViewSnapshot {
    pub(crate) view: Arc<MembershipView>,
    /// `addresses[i]` is the address of `view.members()[i]`.
    pub(crate) addresses: Vec<Address>,
}

impl ViewSnapshot {
    fn initial() -> Self {
        Self {
            view: Arc::new(MembershipView::initial()),
            addresses: Vec::new(),
        }
    }

    pub(crate) fn coordinator_address(&self) -> Option<Address> {
        self.addresses.first().copied()
    }

    pub(crate) fn address_of(&self, node: &NodeIdentity) -> Option<Address> {
        self.view
            .members()
            .iter()
            .position(|m| m == node)
            .and_then(|i| self.addresses.get(i).copied())
    }
}

/// The local node as seen by the transport.
struct LocalNode {
    address: Address,
    identity: NodeIdentity,
}

/// Shared membership state: current view, local node, first-view barrier.
pub(crate) struct Membership {
    current: ArcSwap<ViewSnapshot>,
    local: OnceLock<LocalNode>,
    view_id: watch::Sender<i64>,
}

impl Membership {
    pub(crate) fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(ViewSnapshot::initial()),
            local: OnceLock::new(),
            view_id: watch::Sender::new(MembershipView::NO_VIEW),
        }
    }

    pub(crate) fn snapshot(&self) -> Arc<ViewSnapshot> {
        self.current.load_full()
    }

    pub(crate) fn view(&self) -> Arc<MembershipView> {
        self.current.load().view.clone()
    }

    fn publish(&self, snapshot: ViewSnapshot) {
        let view_id = snapshot.view.view_id();
        self.current.store(Arc::new(snapshot));
        self.view_id.send_replace(view_id);
    }

    /// Forget the current view; the next one is treated as the first.
    pub(crate) fn reset(&self) {
        self.publish(ViewSnapshot::initial());
    }

    pub(crate) fn set_local(&self, address: Address, identity: NodeIdentity) {
        let _ = self.local.set(LocalNode { address, identity });
    }

    pub(crate) fn local(&self) -> Option<&NodeIdentity> {
        self.local.get().map(|l| &l.identity)
    }

    pub(crate) fn local_address(&self) -> Option<Address> {
        self.local.get().map(|l| l.address)
    }

    pub(crate) fn is_coordinator(&self) -> bool {
        let view = self.view();
        match (self.local(), view.coordinator()) {
            (Some(me), Some(coordinator)) => me == coordinator,
            _ => false,
        }
    }

    /// Block until the first view was accepted, at most `timeout`.
    pub(crate) async fn wait_for_view(&self, timeout: Duration) -> Result<(), ClusterError> {
        let mut rx = self.view_id.subscribe();
        let accepted = tokio::time::timeout(timeout, async {
            rx.wait_for(|id| *id >= 0).await.map(|_| ())
        })
        .await;

        match accepted {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ClusterError::Interrupted("view wait")),
            Err(_) => Err(ClusterError::Timeout {
                operation: "initial view",
                after: timeout,
            }),
        }
    }

    /// Fail if the local node appears more than once in `snapshot`.
    pub(crate) fn verify_unique(&self, snapshot: &ViewSnapshot) -> Result<(), ClusterError> {
        let Some(local) = self.local.get() else {
            return Ok(());
        };

        let entries: Vec<usize> = snapshot
            .view
            .members()
            .iter()
            .enumerate()
            .filter(|(_, m)| **m == local.identity)
            .map(|(i, _)| i)
            .collect();
        if entries.len() < 2 {
            return Ok(());
        }

        let other = entries
            .iter()
            .copied()
            .find(|i| snapshot.addresses.get(*i) != Some(&local.address))
            .unwrap_or(entries[1]);
        Err(ClusterError::DuplicateNode {
            local: local.identity.clone(),
            other: snapshot.view.members()[other].clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// View processing
// ---------------------------------------------------------------------------

/// Turns channel views into published [`MembershipView`]s.
pub(crate) struct ViewProcessor {
    membership: Arc<Membership>,
    resolver: Arc<NodeResolver>,
    history: Arc<ViewHistory>,
    listeners: Arc<ListenerRegistry>,
    notifier: Arc<ViewNotifier>,
}

impl ViewProcessor {
    pub(crate) fn new(
        membership: Arc<Membership>,
        resolver: Arc<NodeResolver>,
        history: Arc<ViewHistory>,
        listeners: Arc<ListenerRegistry>,
        notifier: Arc<ViewNotifier>,
    ) -> Self {
        Self {
            membership,
            resolver,
            history,
            listeners,
            notifier,
        }
    }

    /// Accept a view delivered by the channel.
    ///
    /// The first view only wakes the tasks waiting for it; later views are
    /// also handed to listeners. A view in which the local node appears
    /// twice is rejected and not published.
    pub(crate) fn process(&self, raw: RawView) -> Result<Arc<MembershipView>, ClusterError> {
        let previous = self.membership.view();
        let members = self.resolver.resolve_all(&raw.members)?;
        let merge_origins = raw
            .subgroups
            .as_ref()
            .map(|subgroups| {
                subgroups
                    .iter()
                    .map(|sub| self.resolver.resolve_all(&sub.members))
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;

        let view = Arc::new(MembershipView::next(
            &previous,
            raw.view_id,
            members,
            merge_origins,
        ));
        let snapshot = ViewSnapshot {
            view: view.clone(),
            addresses: raw.members,
        };

        let first = !previous.is_established();
        if !first {
            self.membership.verify_unique(&snapshot)?;
        }

        if view.is_merge() {
            self.history
                .record(format!("merged view {view} (previous {previous})"));
        } else {
            self.history
                .record(format!("view {view} installed (previous {previous})"));
        }
        self.membership.publish(snapshot);

        if first {
            info!(
                view_id = view.view_id(),
                members = view.len(),
                "initial view accepted"
            );
            debug!(view = %view, "initial membership");
            return Ok(view);
        }

        info!(
            view_id = view.view_id(),
            members = view.len(),
            joined = view.joined().len(),
            left = view.left().len(),
            merge = view.is_merge(),
            "new view accepted"
        );
        debug!(
            joined = ?names(view.joined()),
            left = ?names(view.left()),
            "membership delta"
        );

        self.notifier.enqueue(view.clone());
        let sync_listeners = self.listeners.sync_listeners();
        if !sync_listeners.is_empty() {
            listener::notify(&sync_listeners, &view, "sync");
        }

        Ok(view)
    }
}

fn names(nodes: &[NodeIdentity]) -> Vec<&str> {
    nodes.iter().map(NodeIdentity::id).collect()
}
