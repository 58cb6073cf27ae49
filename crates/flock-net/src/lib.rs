//! Group channel abstraction for flock.
//!
//! This crate defines the seam between the group-communication core and the
//! reliable-multicast transport underneath it:
//!
//! - [`Channel`]: what the core asks of a transport: join/leave a group,
//!   send to one or all members and collect responses, pull state.
//! - [`ChannelReceiver`]: the callbacks a transport pushes into the core
//!   (views, suspicions, flush block/unblock, requests, state exchange).
//! - [`Codec`]: turns [`Value`](flock_types::Value)s into bytes and back.
//! - [`MemoryNetwork`]: an in-process transport used by tests and the
//!   simulator. It supports partitions, merges and flush.

mod codec;
mod error;
mod memory;
mod message;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};

pub use codec::{Codec, CodecError, PostcardCodec};
pub use error::NetError;
pub use memory::{MemoryChannel, MemoryNetwork};
pub use message::{
    Address, Destination, RawView, Response, ResponseMode, ResponseOutcome, SendOptions,
};

/// Operations the core needs from a group transport.
///
/// Callbacks flow the other way through the [`ChannelReceiver`] installed
/// with [`Channel::set_receiver`].
#[async_trait::async_trait]
pub trait Channel: Send + Sync {
    /// Join `group`. The first view is pushed to the receiver, possibly
    /// before this call returns.
    async fn connect(&self, group: &str) -> Result<(), NetError>;

    /// Leave the group.
    async fn disconnect(&self) -> Result<(), NetError>;

    /// Whether the channel is currently a member of a group.
    fn is_connected(&self) -> bool;

    /// Whether the channel delivers block/unblock around view changes.
    fn flush_supported(&self) -> bool;

    /// Whether messages sent by this channel are never delivered back to it.
    fn discard_own_messages(&self) -> bool;

    /// Transport address of this channel.
    fn local_address(&self) -> Address;

    /// Group the channel is connected to.
    fn group_name(&self) -> Option<String>;

    /// The last view installed on this channel.
    fn view(&self) -> Option<RawView>;

    /// Physical address registered for `address`.
    fn physical_address(&self, address: Address) -> Option<SocketAddr>;

    /// Logical name registered for `address`.
    fn logical_name(&self, address: Address) -> Option<String>;

    /// Install (or remove) the callback target.
    fn set_receiver(&self, receiver: Option<Arc<dyn ChannelReceiver>>);

    /// Send `payload` and collect responses according to `options.mode`.
    ///
    /// With [`ResponseMode::None`] the call returns as soon as the message
    /// is handed to the transport and the result is empty.
    async fn send(
        &self,
        destination: Destination,
        payload: Bytes,
        options: SendOptions,
    ) -> Result<Vec<Response>, NetError>;

    /// Ask the group for its state.
    ///
    /// On success the state arrives later through
    /// [`ChannelReceiver::set_state`]. Fails with
    /// [`NetError::NoStateProvider`] when no other member can provide it.
    async fn get_state(&self, timeout: Duration) -> Result<(), NetError>;
}

/// Callbacks pushed by a [`Channel`].
///
/// Implementations run on transport threads and must return promptly.
pub trait ChannelReceiver: Send + Sync {
    /// A new view was installed.
    fn view_accepted(&self, view: RawView);

    /// A member is suspected of having failed.
    fn suspect(&self, _address: Address) {}

    /// A flush is starting; outbound traffic should pause.
    fn block(&self) {}

    /// The flush completed.
    fn unblock(&self) {}

    /// Handle a request and produce the response payload.
    fn handle(&self, sender: Address, request: Bytes) -> Bytes;

    /// Write the local state into `out` for a joining member.
    fn get_state(&self, _out: &mut BytesMut) {}

    /// Install state pulled from another member.
    fn set_state(&self, _state: Bytes) {}
}

/// Filters responses while a send is collecting them.
pub trait RspFilter: Send + Sync {
    /// Whether the response from `sender` should be kept.
    fn is_acceptable(&self, response: &[u8], sender: Address) -> bool;

    /// Whether the send should keep waiting for more responses.
    fn need_more_responses(&self) -> bool;
}
