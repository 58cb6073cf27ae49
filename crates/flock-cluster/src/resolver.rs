//! Maps transport addresses to node identities.

use std::sync::Arc;

use dashmap::DashMap;
use flock_net::{Address, Channel};
use flock_types::NodeIdentity;
use tracing::trace;

use crate::error::ClusterError;

/// Resolves [`Address`]es into [`NodeIdentity`]s.
///
/// An identity is built once, on first resolution, and cached for the life
/// of the resolver.
pub(crate) struct NodeResolver {
    channel: Arc<dyn Channel>,
    cache: DashMap<Address, NodeIdentity>,
}

impl NodeResolver {
    pub(crate) fn new(channel: Arc<dyn Channel>) -> Self {
        Self {
            channel,
            cache: DashMap::new(),
        }
    }

    pub(crate) fn resolve(&self, address: Address) -> Result<NodeIdentity, ClusterError> {
        if let Some(node) = self.cache.get(&address) {
            return Ok(node.clone());
        }

        let socket = self
            .channel
            .physical_address(address)
            .ok_or(ClusterError::AddressNotRegistered(address))?;
        let node = match self.channel.logical_name(address) {
            Some(name) => NodeIdentity::new(name, socket),
            None => NodeIdentity::unnamed(socket),
        };
        trace!(%address, node = %node, "resolved member");

        Ok(self.cache.entry(address).or_insert(node).clone())
    }

    pub(crate) fn resolve_all(&self, addresses: &[Address]) -> Result<Vec<NodeIdentity>, ClusterError> {
        addresses.iter().map(|a| self.resolve(*a)).collect()
    }

    /// Reverse lookup among the identities resolved so far.
    pub(crate) fn address_of(&self, node: &NodeIdentity) -> Option<Address> {
        self.cache
            .iter()
            .find(|entry| entry.value() == node)
            .map(|entry| *entry.key())
    }
}
