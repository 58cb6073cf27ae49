//! Error types for the cluster crate.

use std::time::Duration;

use flock_net::{Address, CodecError, NetError};
use flock_types::{HandlerError, NodeIdentity};

use crate::state::{StateFormatKind, StateTransferError};

/// Errors produced by the group service.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The local node shows up more than once in a view.
    ///
    /// Usually two processes were started with the same node name.
    #[error(
        "node {local:?} is already registered as {other:?}; \
         another member of the group uses the same node name"
    )]
    DuplicateNode {
        /// The local node.
        local: NodeIdentity,
        /// The other entry carrying the same name.
        other: NodeIdentity,
    },

    /// The transport has no physical address for a member.
    #[error("address {0} is not registered with the transport")]
    AddressNotRegistered(Address),

    /// The target of a call is not a known member.
    #[error("node not found: {0}")]
    NodeNotFound(NodeIdentity),

    /// No view has been installed yet.
    #[error("no view installed")]
    NoView,

    /// The service has not been started or was stopped.
    #[error("service not started")]
    NotStarted,

    /// A bounded wait expired.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// What was being waited for.
        operation: &'static str,
        /// How long the wait lasted.
        after: Duration,
    },

    /// A wait ended because the thing being waited on went away.
    #[error("{0} interrupted")]
    Interrupted(&'static str),

    /// The remote handler failed.
    #[error("remote invocation failed: {0}")]
    Remote(HandlerError),

    /// The target is suspected or unreachable.
    #[error("node {0} is unreachable")]
    Suspected(NodeIdentity),

    /// A state transfer in a different format is already running.
    #[error("state transfer for {service} already pending as {pending}")]
    StateTransferPending {
        /// The service whose state was requested.
        service: String,
        /// The format of the pending request.
        pending: StateFormatKind,
    },

    /// The state transfer failed.
    #[error(transparent)]
    StateTransfer(#[from] StateTransferError),

    /// Encoding or decoding a value failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Wire framing failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A channel-level error.
    #[error("channel error: {0}")]
    Net(#[from] NetError),
}

impl ClusterError {
    /// Whether retrying the operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClusterError::Timeout { .. } | ClusterError::Interrupted(_)
        )
    }
}
