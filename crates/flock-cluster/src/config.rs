//! Group service configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ClusterError;

/// Settings of one [`GroupService`](crate::GroupService).
///
/// Deserializes from the `[group]` table of the daemon's TOML file; every
/// field has a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Name of the group to join.
    pub group_name: String,
    /// Default timeout of synchronous RPC calls.
    pub method_call_timeout_ms: u64,
    /// How long a state transfer may take.
    pub state_transfer_timeout_ms: u64,
    /// How long `start` waits for the first view. Defaults to the method
    /// call timeout.
    pub view_wait_timeout_ms: Option<u64>,
    /// Number of entries kept in the view history. 0 disables it.
    pub max_history_length: usize,
    /// Whether listeners may ask to be notified on the transport thread.
    pub allow_sync_listeners: bool,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            group_name: String::new(),
            method_call_timeout_ms: 60_000,
            state_transfer_timeout_ms: 60_000,
            view_wait_timeout_ms: None,
            max_history_length: 100,
            allow_sync_listeners: false,
        }
    }
}

impl GroupConfig {
    /// Defaults for the named group.
    pub fn new(group_name: impl Into<String>) -> Self {
        Self {
            group_name: group_name.into(),
            ..Self::default()
        }
    }

    /// Short timeouts for tests.
    pub fn test_config(group_name: impl Into<String>) -> Self {
        Self {
            group_name: group_name.into(),
            method_call_timeout_ms: 2_000,
            state_transfer_timeout_ms: 2_000,
            view_wait_timeout_ms: Some(2_000),
            ..Self::default()
        }
    }

    /// Reject configurations the service cannot run with.
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.group_name.trim().is_empty() {
            return Err(ClusterError::Config("group name not defined".into()));
        }
        if self.method_call_timeout_ms == 0 {
            return Err(ClusterError::Config(
                "method_call_timeout_ms must be positive".into(),
            ));
        }
        if self.state_transfer_timeout_ms == 0 {
            return Err(ClusterError::Config(
                "state_transfer_timeout_ms must be positive".into(),
            ));
        }
        if self.view_wait_timeout_ms == Some(0) {
            return Err(ClusterError::Config(
                "view_wait_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn method_call_timeout(&self) -> Duration {
        Duration::from_millis(self.method_call_timeout_ms)
    }

    pub fn state_transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.state_transfer_timeout_ms)
    }

    pub fn view_wait_timeout(&self) -> Duration {
        Duration::from_millis(
            self.view_wait_timeout_ms
                .unwrap_or(self.method_call_timeout_ms),
        )
    }
}
