//! Membership listeners and their notification paths.
//!
//! Listeners are notified either on the single background notifier thread
//! (the default) or inline on the transport thread when the service allows
//! synchronous listeners. A failing or panicking listener is logged and the
//! remaining listeners still run.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;

use flock_types::MembershipView;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Result returned by listener callbacks.
pub type ListenerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Receives membership changes.
pub trait MembershipListener: Send + Sync {
    /// A new view was installed.
    fn membership_changed(&self, view: &MembershipView) -> ListenerResult;

    /// A view produced by merging partitions was installed.
    ///
    /// `view.merge_origins()` holds the member lists of the merged
    /// partitions.
    fn membership_changed_during_merge(&self, view: &MembershipView) -> ListenerResult {
        self.membership_changed(view)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type Listeners = RwLock<Vec<Arc<dyn MembershipListener>>>;

/// The registered listeners, split by notification path.
pub(crate) struct ListenerRegistry {
    sync: Listeners,
    asynchronous: Listeners,
    allow_sync: bool,
}

impl ListenerRegistry {
    pub(crate) fn new(allow_sync: bool) -> Self {
        Self {
            sync: RwLock::new(Vec::new()),
            asynchronous: RwLock::new(Vec::new()),
            allow_sync,
        }
    }

    /// Register `listener`. Returns whether it will be notified inline.
    pub(crate) fn register(&self, listener: Arc<dyn MembershipListener>, synchronous: bool) -> bool {
        let inline = synchronous && self.allow_sync;
        if synchronous && !inline {
            debug!("synchronous listeners are disabled, registering asynchronously");
        }
        let list = if inline { &self.sync } else { &self.asynchronous };
        list.write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
        inline
    }

    pub(crate) fn unregister(&self, listener: &Arc<dyn MembershipListener>, synchronous: bool) {
        let list = if synchronous && self.allow_sync {
            &self.sync
        } else {
            &self.asynchronous
        };
        list.write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|l| !same_listener(l, listener));
    }

    pub(crate) fn sync_listeners(&self) -> Vec<Arc<dyn MembershipListener>> {
        self.sync
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn async_listeners(&self) -> Vec<Arc<dyn MembershipListener>> {
        self.asynchronous
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn same_listener(a: &Arc<dyn MembershipListener>, b: &Arc<dyn MembershipListener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Invoke every listener with `view`, isolating failures.
pub(crate) fn notify(listeners: &[Arc<dyn MembershipListener>], view: &MembershipView, path: &str) {
    for listener in listeners {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            if view.is_merge() {
                listener.membership_changed_during_merge(view)
            } else {
                listener.membership_changed(view)
            }
        }));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(view_id = view.view_id(), path, error = %e, "membership listener failed");
            }
            Err(_) => {
                warn!(view_id = view.view_id(), path, "membership listener panicked");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Background notifier
// ---------------------------------------------------------------------------

/// Single worker delivering views to asynchronous listeners in FIFO order.
///
/// Views enqueued before [`ViewNotifier::start`] are buffered and delivered
/// once the worker runs.
pub(crate) struct ViewNotifier {
    tx: Mutex<Option<mpsc::UnboundedSender<Arc<MembershipView>>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<MembershipView>>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ViewNotifier {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            worker: Mutex::new(None),
        }
    }

    pub(crate) fn enqueue(&self, view: Arc<MembershipView>) {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match tx.as_ref() {
            Some(tx) => {
                if tx.send(view).is_err() {
                    debug!("view notifier gone, dropping notification");
                }
            }
            None => debug!("view notifier stopped, dropping notification"),
        }
    }

    /// Spawn the worker thread. Does nothing if it is already running.
    pub(crate) fn start(&self, registry: Arc<ListenerRegistry>) {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return;
        }

        let rx = {
            let mut tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
            match self.rx.lock().unwrap_or_else(PoisonError::into_inner).take() {
                Some(rx) => rx,
                None => {
                    let (new_tx, new_rx) = mpsc::unbounded_channel();
                    *tx = Some(new_tx);
                    new_rx
                }
            }
        };

        let spawned = thread::Builder::new()
            .name("flock-view-notifier".into())
            .spawn(move || run_notifier(rx, registry));
        match spawned {
            Ok(handle) => *worker = Some(handle),
            Err(e) => error!(error = %e, "failed to spawn view notifier"),
        }
    }

    /// Close the queue. The worker drains what is queued and exits; the
    /// returned handle joins it.
    pub(crate) fn stop(&self) -> Option<thread::JoinHandle<()>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

fn run_notifier(mut rx: mpsc::UnboundedReceiver<Arc<MembershipView>>, registry: Arc<ListenerRegistry>) {
    debug!("view notifier started");
    while let Some(view) = rx.blocking_recv() {
        notify(&registry.async_listeners(), &view, "async");
    }
    debug!("view notifier stopped");
}
