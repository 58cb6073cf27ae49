//! Group-communication core for flock.
//!
//! A [`GroupService`] sits on top of a [`flock_net::Channel`] and gives an
//! application:
//!
//! - a consistent [`MembershipView`](flock_types::MembershipView) of the
//!   group with listener notification on every change, merges included;
//! - service-scoped RPC: call every member, the coordinator or one node;
//! - per-service state transfer from an existing member to a joining one.
//!
//! Outbound calls are held back while the channel runs a flush around a
//! view change (see [`FlushGate`]).

mod config;
mod error;
mod executor;
mod gate;
mod history;
mod listener;
mod resolver;
mod rpc;
mod service;
mod state;
mod view;

pub use config::GroupConfig;
pub use error::ClusterError;
pub use gate::FlushGate;
pub use history::ViewHistory;
pub use listener::{ListenerResult, MembershipListener};
pub use rpc::{ResponseFilter, RpcCall, RpcHandler};
pub use service::{GroupService, GroupServiceBuilder};
pub use state::{
    StateFormat, StateFormatKind, StateProvider, StateTransferError, StateTransferHandle,
    StateTransferResult, TransferredState,
};
