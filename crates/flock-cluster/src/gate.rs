//! Gate that holds outbound RPC back while the transport flushes.

use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::error::ClusterError;

/// A re-closable open/closed gate.
///
/// Starts closed. The transport's `block` closes it and `unblock` opens it;
/// callers wait for it to be open with a bounded wait.
pub struct FlushGate {
    open: watch::Sender<bool>,
}

impl FlushGate {
    pub fn new() -> Self {
        Self {
            open: watch::Sender::new(false),
        }
    }

    pub fn open(&self) {
        if !self.open.send_replace(true) {
            debug!("flush gate opened");
        }
    }

    pub fn close(&self) {
        if self.open.send_replace(false) {
            debug!("flush gate closed");
        }
    }

    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    /// Wait until the gate is open, at most `timeout`.
    pub async fn wait(&self, timeout: Duration) -> Result<(), ClusterError> {
        let mut rx = self.open.subscribe();
        let opened = tokio::time::timeout(timeout, async {
            rx.wait_for(|open| *open).await.map(|_| ())
        })
        .await;

        match opened {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ClusterError::Interrupted("flush wait")),
            Err(_) => Err(ClusterError::Timeout {
                operation: "flush wait",
                after: timeout,
            }),
        }
    }
}

impl Default for FlushGate {
    fn default() -> Self {
        Self::new()
    }
}
