//! Addressing and response types shared by every channel implementation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::RspFilter;

/// Opaque transport address of a channel member.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(u64);

impl Address {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "addr-{}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0)
    }
}

/// A view as the transport reports it.
///
/// `subgroups` is set when the view is the result of a merge and holds the
/// views of the partitions that were merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawView {
    pub view_id: i64,
    pub members: Vec<Address>,
    pub subgroups: Option<Vec<RawView>>,
}

impl RawView {
    pub fn new(view_id: i64, members: Vec<Address>) -> Self {
        Self {
            view_id,
            members,
            subgroups: None,
        }
    }

    /// Whether the view came out of a merge.
    pub fn is_merge(&self) -> bool {
        self.subgroups.is_some()
    }

    /// First member of the view.
    pub fn coordinator(&self) -> Option<Address> {
        self.members.first().copied()
    }
}

/// Where a message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Every member of the current view.
    All,
    /// A single member.
    Node(Address),
}

/// How many responses a send waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseMode {
    /// Wait for every destination.
    #[default]
    All,
    /// Stop at the first usable response.
    First,
    /// Fire and forget.
    None,
}

/// Per-send options.
#[derive(Clone)]
pub struct SendOptions {
    pub mode: ResponseMode,
    pub timeout: Duration,
    /// Members that must not receive the message.
    pub exclusions: Vec<Address>,
    /// Whether the message may be delivered out of order.
    pub unordered: bool,
    pub filter: Option<Arc<dyn RspFilter>>,
}

impl SendOptions {
    pub fn new(mode: ResponseMode, timeout: Duration) -> Self {
        Self {
            mode,
            timeout,
            exclusions: Vec::new(),
            unordered: false,
            filter: None,
        }
    }

    pub fn exclude(mut self, address: Address) -> Self {
        if !self.exclusions.contains(&address) {
            self.exclusions.push(address);
        }
        self
    }

    pub fn unordered(mut self, unordered: bool) -> Self {
        self.unordered = unordered;
        self
    }

    pub fn filter(mut self, filter: Option<Arc<dyn RspFilter>>) -> Self {
        self.filter = filter;
        self
    }
}

impl fmt::Debug for SendOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendOptions")
            .field("mode", &self.mode)
            .field("timeout", &self.timeout)
            .field("exclusions", &self.exclusions)
            .field("unordered", &self.unordered)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

/// What happened to one destination of a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// The member answered.
    Received(Bytes),
    /// No (acceptable) answer arrived before the send completed.
    NotReceived,
    /// The member is suspected or unreachable.
    Suspected,
    /// The member failed to process the request at transport level.
    Failed(String),
}

/// A response from one member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub sender: Address,
    pub outcome: ResponseOutcome,
}

impl Response {
    /// The payload, if one was received.
    pub fn payload(&self) -> Option<&Bytes> {
        match &self.outcome {
            ResponseOutcome::Received(bytes) => Some(bytes),
            _ => None,
        }
    }
}
