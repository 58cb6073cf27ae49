//! Shared types for flock.
//!
//! This crate defines the value types exchanged between the flock crates and
//! handed to applications: member identities ([`NodeIdentity`]), membership
//! snapshots ([`MembershipView`]) and the self-describing RPC object model
//! ([`Value`], [`MethodCall`], [`HandlerError`]).

mod value;

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

pub use value::{HandlerError, MethodCall, Value};

// ---------------------------------------------------------------------------
// Node identity
// ---------------------------------------------------------------------------

/// Identity of a group member: a logical name plus its physical address.
///
/// Two identities are equal when their `id` is equal. Hashing and ordering
/// only look at the `id` too, so an identity can be used as a map key even
/// when the physical address of a restarted node changed.
#[derive(Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    id: String,
    address: IpAddr,
    port: u16,
}

impl NodeIdentity {
    /// Create an identity from a logical name and a socket address.
    pub fn new(id: impl Into<String>, socket: SocketAddr) -> Self {
        Self {
            id: id.into(),
            address: socket.ip(),
            port: socket.port(),
        }
    }

    /// Create an identity for a member without a logical name.
    ///
    /// The id falls back to `"<ip>:<port>"`.
    pub fn unnamed(socket: SocketAddr) -> Self {
        Self::new(socket.to_string(), socket)
    }

    /// Logical name of the member.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// IP address the member's transport is bound to.
    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// Port the member's transport is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Full socket address of the member.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl PartialEq for NodeIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeIdentity {}

impl Hash for NodeIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for NodeIdentity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeIdentity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeIdentity({}@{})", self.id, self.socket_addr())
    }
}

// ---------------------------------------------------------------------------
// Membership view
// ---------------------------------------------------------------------------

/// Immutable snapshot of the group membership.
///
/// Views are totally ordered by `view_id`. The first member of a view is
/// its coordinator. `joined` and `left` are computed against the view this
/// one replaced, and `merge_origins` is only set when the view was produced
/// by merging partitions back together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipView {
    view_id: i64,
    members: Vec<NodeIdentity>,
    joined: Vec<NodeIdentity>,
    left: Vec<NodeIdentity>,
    merge_origins: Option<Vec<Vec<NodeIdentity>>>,
}

impl MembershipView {
    /// View id used before any view was accepted.
    pub const NO_VIEW: i64 = -1;

    /// The placeholder view held before the transport delivered one.
    pub fn initial() -> Self {
        Self {
            view_id: Self::NO_VIEW,
            members: Vec::new(),
            joined: Vec::new(),
            left: Vec::new(),
            merge_origins: None,
        }
    }

    /// Build the view that follows `previous`.
    ///
    /// `joined` holds the members absent from `previous` and `left` the
    /// members of `previous` absent from `members`, each in the order of the
    /// list it was taken from. The result depends on nothing but the
    /// arguments.
    pub fn next(
        previous: &MembershipView,
        view_id: i64,
        members: Vec<NodeIdentity>,
        merge_origins: Option<Vec<Vec<NodeIdentity>>>,
    ) -> Self {
        let joined = members
            .iter()
            .filter(|m| !previous.members.contains(m))
            .cloned()
            .collect();
        let left = previous
            .members
            .iter()
            .filter(|m| !members.contains(m))
            .cloned()
            .collect();

        Self {
            view_id,
            members,
            joined,
            left,
            merge_origins,
        }
    }

    /// Monotonically increasing id, [`Self::NO_VIEW`] before the first view.
    pub fn view_id(&self) -> i64 {
        self.view_id
    }

    /// Whether this is a real view delivered by the transport.
    pub fn is_established(&self) -> bool {
        self.view_id >= 0
    }

    /// Members in the order the transport reported them.
    pub fn members(&self) -> &[NodeIdentity] {
        &self.members
    }

    /// The coordinator, i.e. the first member.
    pub fn coordinator(&self) -> Option<&NodeIdentity> {
        self.members.first()
    }

    /// Members that were not part of the previous view.
    pub fn joined(&self) -> &[NodeIdentity] {
        &self.joined
    }

    /// Members of the previous view that are gone.
    pub fn left(&self) -> &[NodeIdentity] {
        &self.left
    }

    /// Member lists of the partitions this view merged, if it is a merge.
    pub fn merge_origins(&self) -> Option<&[Vec<NodeIdentity>]> {
        self.merge_origins.as_deref()
    }

    /// Whether this view was produced by a partition merge.
    pub fn is_merge(&self) -> bool {
        self.merge_origins.is_some()
    }

    /// Whether `node` is a member of this view.
    pub fn contains(&self, node: &NodeIdentity) -> bool {
        self.members.contains(node)
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the view has no members (only true before the first view).
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Logical names of the members, in view order.
    pub fn member_names(&self) -> Vec<String> {
        self.members.iter().map(|m| m.id().to_string()).collect()
    }
}

impl Default for MembershipView {
    fn default() -> Self {
        Self::initial()
    }
}

impl fmt::Display for MembershipView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] (", self.view_id)?;
        for (i, member) in self.members.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{member}")?;
        }
        f.write_str(")")
    }
}
