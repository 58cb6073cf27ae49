//! Error types for channel operations.

use crate::message::Address;

/// Errors that can occur while talking to the group transport.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// The channel is not connected to a group.
    #[error("channel not connected")]
    NotConnected,

    /// The channel is already connected to a different group.
    #[error("channel already connected to group {0}")]
    AlreadyConnected(String),

    /// No other member can provide state.
    #[error("no state provider available")]
    NoStateProvider,

    /// The destination is not part of this channel's view.
    #[error("destination {0} is not reachable")]
    Unreachable(Address),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The transport has been shut down.
    #[error("channel closed")]
    Closed,
}
