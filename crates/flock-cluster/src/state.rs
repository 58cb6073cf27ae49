//! Per-service state transfer.
//!
//! A joining node asks the group for the state of a named service. The
//! request runs as a background [`StateTransferTask`]; the channel pulls the
//! state of every registered [`StateProvider`] from the coordinator as one
//! stream and pushes it back through `set_state`, where each chunk is routed
//! to the task of its service.
//!
//! At most one task per service is in flight. A second request for the same
//! service attaches to the running task and observes the same outcome.
//!
//! Stream layout, repeated until the end of the stream:
//!
//! ```text
//! +----------------+-----------+----------------+-------------+
//! | name_len (u16) | name utf8 | state_len (u32)| state bytes |
//! +----------------+-----------+----------------+-------------+
//! ```

use std::collections::HashSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use flock_net::{Channel, Codec, CodecError, NetError};
use flock_types::Value;
use tokio::sync::{Notify, watch};
use tracing::{debug, error, warn};

use crate::error::ClusterError;
use crate::executor::Executor;
use crate::view::Membership;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Supplies the current state of a service to joining nodes.
pub trait StateProvider: Send + Sync {
    fn current_state(&self) -> Value;
}

impl<F> StateProvider for F
where
    F: Fn() -> Value + Send + Sync,
{
    fn current_state(&self) -> Value {
        self()
    }
}

/// How the requester wants the state handed back.
#[derive(Clone)]
pub enum StateFormat {
    /// The bytes exactly as the provider's codec produced them.
    Raw,
    /// Decoded with the given codec, or the service's default codec.
    Decoded(Option<Arc<dyn Codec>>),
}

impl StateFormat {
    pub fn kind(&self) -> StateFormatKind {
        match self {
            StateFormat::Raw => StateFormatKind::Raw,
            StateFormat::Decoded(_) => StateFormatKind::Decoded,
        }
    }

    fn materialize(&self, bytes: Bytes, fallback: &dyn Codec) -> Result<TransferredState, CodecError> {
        match self {
            StateFormat::Raw => Ok(TransferredState::Raw(bytes)),
            StateFormat::Decoded(codec) => {
                let codec = codec.as_deref().unwrap_or(fallback);
                codec.decode(&bytes).map(TransferredState::Decoded)
            }
        }
    }
}

impl Default for StateFormat {
    fn default() -> Self {
        StateFormat::Decoded(None)
    }
}

impl fmt::Debug for StateFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateFormat::Raw => f.write_str("Raw"),
            StateFormat::Decoded(codec) => f.debug_tuple("Decoded").field(codec).finish(),
        }
    }
}

/// [`StateFormat`] without its codec, for comparisons and messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateFormatKind {
    Raw,
    Decoded,
}

impl fmt::Display for StateFormatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateFormatKind::Raw => f.write_str("raw stream"),
            StateFormatKind::Decoded => f.write_str("decoded value"),
        }
    }
}

/// State handed back to the requester.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferredState {
    Raw(Bytes),
    Decoded(Value),
}

impl TransferredState {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            TransferredState::Decoded(value) => Some(value),
            TransferredState::Raw(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            TransferredState::Raw(bytes) => Some(bytes),
            TransferredState::Decoded(_) => None,
        }
    }
}

/// Outcome of a successful state transfer.
///
/// `state_received()` is false when there was nobody to ask: the local
/// node is the coordinator of a fresh group.
#[derive(Debug, Clone, PartialEq)]
pub struct StateTransferResult {
    received: bool,
    state: Option<TransferredState>,
}

impl StateTransferResult {
    fn empty() -> Self {
        Self {
            received: false,
            state: None,
        }
    }

    fn received(state: Option<TransferredState>) -> Self {
        Self {
            received: true,
            state,
        }
    }

    /// Whether another member answered the request.
    pub fn state_received(&self) -> bool {
        self.received
    }

    /// The state, if the answering member had any for the service.
    pub fn state(&self) -> Option<&TransferredState> {
        self.state.as_ref()
    }

    pub fn into_state(self) -> Option<TransferredState> {
        self.state
    }
}

/// Why a state transfer failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateTransferError {
    /// No member could provide state and the local node is not the
    /// coordinator, so it is not the first member of the group.
    #[error("initial state transfer failed for {service}: no state provider available")]
    InitialTransferFailed { service: String },

    #[error("state transfer for {service} timed out after {after:?}")]
    Timeout { service: String, after: Duration },

    #[error("state for {service} could not be decoded: {reason}")]
    Decode { service: String, reason: String },

    #[error("state transfer for {service} failed: {reason}")]
    Channel { service: String, reason: String },
}

type Outcome = Option<Result<StateTransferResult, StateTransferError>>;

/// Handle on a running (or finished) state transfer.
///
/// Dropping the handle stops waiting; the transfer itself keeps running.
#[derive(Debug)]
pub struct StateTransferHandle {
    service: String,
    outcome: watch::Receiver<Outcome>,
}

impl StateTransferHandle {
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The outcome, if the transfer already finished.
    pub fn try_result(&self) -> Option<Result<StateTransferResult, StateTransferError>> {
        self.outcome.borrow().clone()
    }

    /// Wait for the transfer to finish.
    pub async fn wait(mut self) -> Result<StateTransferResult, ClusterError> {
        let outcome = self
            .outcome
            .wait_for(Option::is_some)
            .await
            .map(|outcome| outcome.clone())
            .map_err(|_| ClusterError::Interrupted("state transfer"))?;
        match outcome {
            Some(result) => result.map_err(ClusterError::from),
            None => Err(ClusterError::Interrupted("state transfer")),
        }
    }

    /// Wait at most `timeout` for the transfer to finish.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<StateTransferResult, ClusterError> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| ClusterError::Timeout {
                operation: "state transfer wait",
                after: timeout,
            })?
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// What `set_state` handed to a task.
enum Delivery {
    /// The bytes of the service's chunk.
    Chunk(Bytes),
    /// The stream was complete and had no chunk for the service.
    Absent,
}

/// One in-flight state transfer.
pub(crate) struct StateTransferTask {
    service: String,
    format: StateFormat,
    /// Set while `get_state` may still answer into this task.
    awaiting: AtomicBool,
    delivery: Mutex<Option<Delivery>>,
    delivered: Notify,
    outcome: watch::Sender<Outcome>,
}

impl StateTransferTask {
    fn new(service: &str, format: StateFormat) -> Self {
        Self {
            service: service.to_string(),
            format,
            awaiting: AtomicBool::new(false),
            delivery: Mutex::new(None),
            delivered: Notify::new(),
            outcome: watch::Sender::new(None),
        }
    }

    fn handle(&self) -> StateTransferHandle {
        StateTransferHandle {
            service: self.service.clone(),
            outcome: self.outcome.subscribe(),
        }
    }

    fn awaiting(&self) -> bool {
        self.awaiting.load(Ordering::Acquire)
    }

    /// Finished, but without state from another member.
    fn completed_without_state(&self) -> bool {
        match &*self.outcome.borrow() {
            Some(Ok(result)) => !result.state_received(),
            Some(Err(_)) => true,
            None => false,
        }
    }

    /// Hand `delivery` to the task unless it already got one.
    fn deliver(&self, delivery: Delivery) -> bool {
        if !self.awaiting.swap(false, Ordering::AcqRel) {
            return false;
        }
        *self.delivery.lock().unwrap_or_else(PoisonError::into_inner) = Some(delivery);
        self.delivered.notify_one();
        true
    }

    async fn wait_delivery(&self) -> Delivery {
        loop {
            let ready = self
                .delivery
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(delivery) = ready {
                return delivery;
            }
            self.delivered.notified().await;
        }
    }

    fn finish(&self, outcome: Result<StateTransferResult, StateTransferError>) {
        self.awaiting.store(false, Ordering::Release);
        self.outcome.send_replace(Some(outcome));
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Owns the state providers and the in-flight transfer tasks.
pub(crate) struct StateTransferCoordinator {
    channel: Arc<dyn Channel>,
    membership: Arc<Membership>,
    codec: Arc<dyn Codec>,
    executor: Executor,
    timeout: Duration,
    providers: DashMap<String, Arc<dyn StateProvider>>,
    tasks: DashMap<String, Arc<StateTransferTask>>,
}

impl StateTransferCoordinator {
    pub(crate) fn new(
        channel: Arc<dyn Channel>,
        membership: Arc<Membership>,
        codec: Arc<dyn Codec>,
        executor: Executor,
        timeout: Duration,
    ) -> Self {
        Self {
            channel,
            membership,
            codec,
            executor,
            timeout,
            providers: DashMap::new(),
            tasks: DashMap::new(),
        }
    }

    pub(crate) fn register_provider(&self, service: &str, provider: Arc<dyn StateProvider>) {
        self.providers.insert(service.to_string(), provider);
        debug!(service, "registered state provider");
    }

    pub(crate) fn unregister_provider(&self, service: &str) {
        if self.providers.remove(service).is_some() {
            debug!(service, "unregistered state provider");
        }
    }

    /// Request the state of `service` from the group.
    pub(crate) fn request(
        self: &Arc<Self>,
        service: &str,
        format: StateFormat,
    ) -> Result<StateTransferHandle, ClusterError> {
        let (task, fresh) = match self.tasks.entry(service.to_string()) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get().clone();
                if existing.completed_without_state() {
                    let task = Arc::new(StateTransferTask::new(service, format));
                    occupied.insert(task.clone());
                    (task, true)
                } else if existing.format.kind() == format.kind() {
                    warn!(service, "concurrent state request, attaching to the pending transfer");
                    (existing, false)
                } else {
                    return Err(ClusterError::StateTransferPending {
                        service: service.to_string(),
                        pending: existing.format.kind(),
                    });
                }
            }
            Entry::Vacant(vacant) => {
                let task = Arc::new(StateTransferTask::new(service, format));
                vacant.insert(task.clone());
                (task, true)
            }
        };

        let handle = task.handle();
        if fresh {
            debug!(service, format = %task.format.kind(), "starting state transfer");
            let coordinator = self.clone();
            self.executor.spawn("flock-state-transfer", async move {
                coordinator.run(task).await;
            });
        }
        Ok(handle)
    }

    /// Drive `task` to its outcome.
    ///
    /// The task stays registered until its outcome is published, so
    /// requests arriving meanwhile attach to it.
    async fn run(&self, task: Arc<StateTransferTask>) {
        let started = Instant::now();
        let outcome = self.transfer(&task).await;
        match &outcome {
            Ok(result) => debug!(
                service = %task.service,
                received = result.state_received(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "state transfer finished"
            ),
            Err(e) => warn!(service = %task.service, error = %e, "state transfer failed"),
        }
        task.finish(outcome);
        self.tasks
            .remove_if(&task.service, |_, registered| Arc::ptr_eq(registered, &task));
    }

    async fn transfer(&self, task: &StateTransferTask) -> Result<StateTransferResult, StateTransferError> {
        let service = &task.service;
        task.awaiting.store(true, Ordering::Release);

        match self.channel.get_state(self.timeout).await {
            Ok(()) => {
                let delivery = tokio::time::timeout(self.timeout, task.wait_delivery())
                    .await
                    .map_err(|_| StateTransferError::Timeout {
                        service: service.clone(),
                        after: self.timeout,
                    })?;
                match delivery {
                    Delivery::Chunk(bytes) => task
                        .format
                        .materialize(bytes, self.codec.as_ref())
                        .map(|state| StateTransferResult::received(Some(state)))
                        .map_err(|e| StateTransferError::Decode {
                            service: service.clone(),
                            reason: e.to_string(),
                        }),
                    Delivery::Absent => {
                        debug!(service = %service, "state provider has no state for service");
                        Ok(StateTransferResult::received(None))
                    }
                }
            }
            Err(NetError::NoStateProvider) => {
                self.membership
                    .wait_for_view(self.timeout)
                    .await
                    .map_err(|_| StateTransferError::Timeout {
                        service: service.clone(),
                        after: self.timeout,
                    })?;
                if self.membership.is_coordinator() {
                    debug!(service = %service, "no state provider, local node is the first member");
                    Ok(StateTransferResult::empty())
                } else {
                    Err(StateTransferError::InitialTransferFailed {
                        service: service.clone(),
                    })
                }
            }
            Err(e) => Err(StateTransferError::Channel {
                service: service.clone(),
                reason: e.to_string(),
            }),
        }
    }

    // -- Channel callbacks --

    /// Write the state of every provider for a member pulling state.
    pub(crate) fn write_state(&self, out: &mut BytesMut) {
        let providers: Vec<(String, Arc<dyn StateProvider>)> = self
            .providers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for (service, provider) in providers {
            let state = match panic::catch_unwind(AssertUnwindSafe(|| provider.current_state())) {
                Ok(state) => state,
                Err(_) => {
                    error!(service = %service, "state provider panicked, skipping");
                    continue;
                }
            };
            let encoded = match self.codec.encode(&state) {
                Ok(encoded) => encoded,
                Err(e) => {
                    error!(service = %service, error = %e, "failed to encode state, skipping");
                    continue;
                }
            };
            if let Err(e) = write_chunk(out, &service, &encoded) {
                error!(service = %service, error = %e, "failed to write state chunk, skipping");
            }
        }
    }

    /// Route a state stream pulled from another member to the waiting tasks.
    pub(crate) fn receive_state(&self, state: Bytes) {
        let mut routed = HashSet::new();
        for chunk in StateChunks::new(state) {
            match chunk {
                Ok((service, bytes)) => {
                    let task = self.tasks.get(&service).map(|entry| entry.value().clone());
                    let len = bytes.len();
                    match task {
                        Some(task) if task.deliver(Delivery::Chunk(bytes)) => {
                            debug!(service = %service, bytes = len, "state chunk received");
                            routed.insert(service);
                        }
                        _ => debug!(service = %service, "no pending transfer for state chunk, skipping"),
                    }
                }
                Err(e) => {
                    error!(error = %e, "corrupt state stream");
                    return;
                }
            }
        }

        let absent: Vec<Arc<StateTransferTask>> = self
            .tasks
            .iter()
            .filter(|entry| entry.value().awaiting() && !routed.contains(entry.key()))
            .map(|entry| entry.value().clone())
            .collect();
        for task in absent {
            task.deliver(Delivery::Absent);
        }
    }
}

// ---------------------------------------------------------------------------
// Stream framing
// ---------------------------------------------------------------------------

/// Errors in the state stream.
#[derive(Debug, thiserror::Error)]
pub(crate) enum StreamError {
    #[error("service name of {0} bytes is too long")]
    NameTooLong(usize),

    #[error("state of {0} bytes is too large")]
    StateTooLarge(usize),

    #[error("stream truncated: needed {needed} bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },

    #[error("service name is not valid utf-8")]
    InvalidName,
}

pub(crate) fn write_chunk(out: &mut BytesMut, service: &str, state: &[u8]) -> Result<(), StreamError> {
    let name_len = u16::try_from(service.len()).map_err(|_| StreamError::NameTooLong(service.len()))?;
    let state_len = u32::try_from(state.len()).map_err(|_| StreamError::StateTooLarge(state.len()))?;
    out.reserve(2 + service.len() + 4 + state.len());
    out.put_u16(name_len);
    out.put_slice(service.as_bytes());
    out.put_u32(state_len);
    out.put_slice(state);
    Ok(())
}

/// Iterates the `(service, state)` chunks of a stream.
///
/// Stops after the first error.
pub(crate) struct StateChunks {
    input: Bytes,
    failed: bool,
}

impl StateChunks {
    pub(crate) fn new(input: Bytes) -> Self {
        Self {
            input,
            failed: false,
        }
    }

    fn take(&mut self, needed: usize) -> Result<Bytes, StreamError> {
        if self.input.remaining() < needed {
            return Err(StreamError::Truncated {
                needed,
                remaining: self.input.remaining(),
            });
        }
        Ok(self.input.split_to(needed))
    }

    fn read_chunk(&mut self) -> Result<(String, Bytes), StreamError> {
        let name_len = self.take(2)?.get_u16() as usize;
        let name = self.take(name_len)?;
        let name = String::from_utf8(name.to_vec()).map_err(|_| StreamError::InvalidName)?;
        let state_len = self.take(4)?.get_u32() as usize;
        let state = self.take(state_len)?;
        Ok((name, state))
    }
}

impl Iterator for StateChunks {
    type Item = Result<(String, Bytes), StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || !self.input.has_remaining() {
            return None;
        }
        let chunk = self.read_chunk();
        self.failed = chunk.is_err();
        Some(chunk)
    }
}
