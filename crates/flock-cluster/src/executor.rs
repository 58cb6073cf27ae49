//! Where background work of the service runs.

use std::future::Future;
use std::thread;

use tokio::runtime::Handle;
use tracing::error;

/// Spawns state-transfer tasks and local asynchronous invocations.
///
/// Uses the configured runtime handle, else the runtime of the caller, else
/// a dedicated thread that lives for one piece of work.
#[derive(Clone, Default)]
pub(crate) struct Executor {
    handle: Option<Handle>,
}

impl Executor {
    pub(crate) fn new(handle: Option<Handle>) -> Self {
        Self { handle }
    }

    fn runtime(&self) -> Option<Handle> {
        self.handle.clone().or_else(|| Handle::try_current().ok())
    }

    pub(crate) fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Some(handle) = self.runtime() {
            handle.spawn(future);
            return;
        }

        let spawned = thread::Builder::new().name(name.to_string()).spawn(move || {
            match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime.block_on(future),
                Err(e) => error!(error = %e, "failed to build worker runtime"),
            }
        });
        if let Err(e) = spawned {
            error!(name, error = %e, "failed to spawn worker thread");
        }
    }

    pub(crate) fn spawn_blocking<F>(&self, name: &str, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(handle) = self.runtime() {
            handle.spawn_blocking(work);
            return;
        }

        if let Err(e) = thread::Builder::new().name(name.to_string()).spawn(work) {
            error!(name, error = %e, "failed to spawn worker thread");
        }
    }
}
