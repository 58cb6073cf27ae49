//! The group service: one node's view of a group.
//!
//! [`GroupService`] wires the channel callbacks to the view processor, the
//! flush gate, the RPC router and the state-transfer coordinator, and exposes
//! their operations to applications.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use flock_net::{Address, Channel, ChannelReceiver, Codec, PostcardCodec, RawView};
use flock_types::{MembershipView, NodeIdentity, Value};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::config::GroupConfig;
use crate::error::ClusterError;
use crate::executor::Executor;
use crate::gate::FlushGate;
use crate::history::ViewHistory;
use crate::listener::{ListenerRegistry, MembershipListener, ViewNotifier};
use crate::resolver::NodeResolver;
use crate::rpc::{self, RpcCall, RpcHandler, RpcRouter};
use crate::state::{StateFormat, StateProvider, StateTransferCoordinator, StateTransferHandle};
use crate::view::{Membership, ViewProcessor};

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builds a [`GroupService`].
pub struct GroupServiceBuilder {
    channel: Arc<dyn Channel>,
    config: GroupConfig,
    codec: Arc<dyn Codec>,
    runtime: Option<Handle>,
}

impl GroupServiceBuilder {
    /// Replace the configuration.
    pub fn config(mut self, config: GroupConfig) -> Self {
        self.config = config;
        self
    }

    /// Default codec for RPC arguments, results and state.
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Runtime that runs state transfers and local asynchronous calls.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn build(self) -> Result<GroupService, ClusterError> {
        self.config.validate()?;

        let channel = self.channel;
        let config = self.config;
        let executor = Executor::new(self.runtime);

        let membership = Arc::new(Membership::new());
        let resolver = Arc::new(NodeResolver::new(channel.clone()));
        let history = Arc::new(ViewHistory::new(config.max_history_length));
        let listeners = Arc::new(ListenerRegistry::new(config.allow_sync_listeners));
        let notifier = Arc::new(ViewNotifier::new());
        let gate = Arc::new(FlushGate::new());

        let views = ViewProcessor::new(
            membership.clone(),
            resolver.clone(),
            history.clone(),
            listeners.clone(),
            notifier.clone(),
        );
        let router = RpcRouter::new(
            channel.clone(),
            membership.clone(),
            resolver.clone(),
            gate.clone(),
            executor.clone(),
            self.codec.clone(),
            config.method_call_timeout(),
        );
        let state = Arc::new(StateTransferCoordinator::new(
            channel.clone(),
            membership.clone(),
            self.codec,
            executor,
            config.state_transfer_timeout(),
        ));

        Ok(GroupService {
            inner: Arc::new(ServiceInner {
                config,
                channel,
                membership,
                resolver,
                history,
                listeners,
                notifier,
                gate,
                views,
                router,
                state,
                self_connected: AtomicBool::new(false),
                started: AtomicBool::new(false),
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Membership, RPC and state transfer for one node of a group.
///
/// Cheap to clone; clones share the same node.
#[derive(Clone)]
pub struct GroupService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    config: GroupConfig,
    channel: Arc<dyn Channel>,
    membership: Arc<Membership>,
    resolver: Arc<NodeResolver>,
    history: Arc<ViewHistory>,
    listeners: Arc<ListenerRegistry>,
    notifier: Arc<ViewNotifier>,
    gate: Arc<FlushGate>,
    views: ViewProcessor,
    router: RpcRouter,
    state: Arc<StateTransferCoordinator>,
    /// Whether `start` connected the channel (and `stop` must disconnect it).
    self_connected: AtomicBool,
    started: AtomicBool,
}

impl GroupService {
    /// Start building a service on top of `channel`.
    pub fn builder(channel: Arc<dyn Channel>) -> GroupServiceBuilder {
        GroupServiceBuilder {
            channel,
            config: GroupConfig::default(),
            codec: Arc::new(PostcardCodec),
            runtime: None,
        }
    }

    /// A service with the default codec.
    pub fn new(channel: Arc<dyn Channel>, config: GroupConfig) -> Result<Self, ClusterError> {
        Self::builder(channel).config(config).build()
    }

    // -- Lifecycle --

    /// Attach to the channel and wait for the first view.
    ///
    /// Connects the channel if it is not connected yet. Fails if the local
    /// node name is already used by another member.
    pub async fn start(&self) -> Result<(), ClusterError> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.inner.start(Arc::downgrade(&self.inner)).await;
        if result.is_err() {
            self.inner.started.store(false, Ordering::Release);
        }
        result
    }

    /// Detach from the channel, disconnecting it if `start` connected it.
    pub async fn stop(&self) {
        let inner = &self.inner;
        inner.started.store(false, Ordering::Release);

        if inner.self_connected.swap(false, Ordering::AcqRel)
            && let Err(e) = inner.channel.disconnect().await
        {
            warn!(error = %e, "failed to disconnect channel");
        }
        inner.channel.set_receiver(None);
        inner.membership.reset();

        if let Some(worker) = inner.notifier.stop() {
            let joined = tokio::task::spawn_blocking(move || worker.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                warn!("view notifier did not shut down cleanly");
            }
        }
        info!(group = %inner.config.group_name, "group service stopped");
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    // -- Membership --

    pub fn group_name(&self) -> &str {
        &self.inner.config.group_name
    }

    /// The local node, once started.
    pub fn local_node(&self) -> Option<NodeIdentity> {
        self.inner.membership.local().cloned()
    }

    /// Logical name of the local node, once started.
    pub fn node_name(&self) -> Option<String> {
        self.inner.membership.local().map(|n| n.id().to_string())
    }

    pub fn current_view(&self) -> Arc<MembershipView> {
        self.inner.membership.view()
    }

    /// Id of the current view, `-1` before the first view.
    pub fn current_view_id(&self) -> i64 {
        self.inner.membership.view().view_id()
    }

    /// Member names of the current view.
    pub fn current_view_names(&self) -> Vec<String> {
        self.inner.membership.view().member_names()
    }

    pub fn cluster_nodes(&self) -> Vec<NodeIdentity> {
        self.inner.membership.view().members().to_vec()
    }

    pub fn is_coordinator(&self) -> bool {
        self.inner.membership.is_coordinator()
    }

    /// Register a membership listener.
    ///
    /// A synchronous listener runs on the transport thread and holds up the
    /// channel while it runs; it is only honoured when the configuration
    /// allows synchronous listeners, otherwise it is notified asynchronously.
    pub fn register_membership_listener(
        &self,
        listener: Arc<dyn MembershipListener>,
        synchronous: bool,
    ) {
        self.inner.listeners.register(listener, synchronous);
    }

    pub fn unregister_membership_listener(
        &self,
        listener: &Arc<dyn MembershipListener>,
        synchronous: bool,
    ) {
        self.inner.listeners.unregister(listener, synchronous);
    }

    /// The view history, one entry per line.
    pub fn show_history(&self) -> String {
        self.inner.history.show()
    }

    pub fn show_history_as_xml(&self) -> String {
        self.inner.history.show_as_xml()
    }

    pub fn max_history_length(&self) -> usize {
        self.inner.history.max_length()
    }

    pub fn set_max_history_length(&self, max_length: usize) {
        self.inner.history.set_max_length(max_length);
    }

    /// Whether outbound calls are currently held back by a flush.
    pub fn is_flush_blocked(&self) -> bool {
        self.inner.channel.flush_supported() && !self.inner.gate.is_open()
    }

    // -- RPC --

    pub fn method_call_timeout(&self) -> Duration {
        self.inner.config.method_call_timeout()
    }

    pub fn register_rpc_handler(&self, service: &str, handler: Arc<dyn RpcHandler>) {
        self.inner.router.register(service, handler, None);
    }

    /// Register a handler whose arguments and results use `codec`.
    pub fn register_scoped_rpc_handler(
        &self,
        service: &str,
        handler: Arc<dyn RpcHandler>,
        codec: Arc<dyn Codec>,
    ) {
        self.inner.router.register(service, handler, Some(codec));
    }

    pub fn unregister_rpc_handler(&self, service: &str) {
        self.inner.router.unregister(service);
    }

    /// Call every member and collect the successful results.
    pub async fn call_on_cluster(&self, call: RpcCall) -> Result<Vec<Value>, ClusterError> {
        self.inner.router.call_on_cluster(call).await
    }

    pub async fn call_async_on_cluster(&self, call: RpcCall) -> Result<(), ClusterError> {
        self.inner.router.call_async_on_cluster(call).await
    }

    /// Call the coordinator. `None` when it has no handler or the call was
    /// excluded because the local node is the coordinator.
    pub async fn call_on_coordinator(&self, call: RpcCall) -> Result<Option<Value>, ClusterError> {
        self.inner.router.call_on_coordinator(call).await
    }

    pub async fn call_async_on_coordinator(&self, call: RpcCall) -> Result<(), ClusterError> {
        self.inner.router.call_async_on_coordinator(call).await
    }

    /// Call `target`. `None` when it has no handler for the service.
    pub async fn call_on_node(
        &self,
        call: RpcCall,
        target: &NodeIdentity,
    ) -> Result<Option<Value>, ClusterError> {
        self.inner.router.call_on_node(call, target).await
    }

    pub async fn call_async_on_node(
        &self,
        call: RpcCall,
        target: &NodeIdentity,
    ) -> Result<(), ClusterError> {
        self.inner.router.call_async_on_node(call, target).await
    }

    // -- State transfer --

    pub fn state_transfer_timeout(&self) -> Duration {
        self.inner.config.state_transfer_timeout()
    }

    pub fn register_state_provider(&self, service: &str, provider: Arc<dyn StateProvider>) {
        self.inner.state.register_provider(service, provider);
    }

    pub fn unregister_state_provider(&self, service: &str) {
        self.inner.state.unregister_provider(service);
    }

    /// Request the state of `service`, decoded with the default codec.
    pub fn request_service_state(&self, service: &str) -> Result<StateTransferHandle, ClusterError> {
        self.inner.state.request(service, StateFormat::Decoded(None))
    }

    /// Request the state of `service`, decoded with `codec`.
    pub fn request_scoped_service_state(
        &self,
        service: &str,
        codec: Arc<dyn Codec>,
    ) -> Result<StateTransferHandle, ClusterError> {
        self.inner
            .state
            .request(service, StateFormat::Decoded(Some(codec)))
    }

    /// Request the state of `service` as undecoded bytes.
    pub fn request_raw_service_state(&self, service: &str) -> Result<StateTransferHandle, ClusterError> {
        self.inner.state.request(service, StateFormat::Raw)
    }
}

impl ServiceInner {
    async fn start(&self, this: Weak<ServiceInner>) -> Result<(), ClusterError> {
        self.channel
            .set_receiver(Some(Arc::new(ChannelEvents { service: this })));
        self.notifier.start(self.listeners.clone());

        let address = self.channel.local_address();
        if self.channel.is_connected() {
            self.membership
                .set_local(address, self.resolver.resolve(address)?);
            if let Some(view) = self.channel.view() {
                self.views.process(view)?;
            }
            self.gate.open();
        } else {
            self.self_connected.store(true, Ordering::Release);
            self.channel.connect(&self.config.group_name).await?;
            self.membership
                .set_local(address, self.resolver.resolve(address)?);
            self.membership
                .wait_for_view(self.config.view_wait_timeout())
                .await?;
        }

        self.router
            .set_direct_invoke_local(self.channel.discard_own_messages());
        self.membership
            .verify_unique(&self.membership.snapshot())?;

        let view = self.membership.view();
        info!(
            group = %self.config.group_name,
            node = ?self.membership.local().map(NodeIdentity::id),
            view_id = view.view_id(),
            members = view.len(),
            coordinator = self.membership.is_coordinator(),
            "group service started"
        );
        Ok(())
    }

    fn on_suspect(&self, address: Address) {
        let node = match self.resolver.resolve(address) {
            Ok(node) => node.to_string(),
            Err(_) => address.to_string(),
        };
        self.history.record(format!("node suspected: {node}"));
        info!(node = %node, "member suspected");
    }
}

// ---------------------------------------------------------------------------
// Channel callbacks
// ---------------------------------------------------------------------------

/// Receives channel callbacks on behalf of a service.
///
/// Holds the service weakly so a dropped service does not stay alive
/// through its channel.
struct ChannelEvents {
    service: Weak<ServiceInner>,
}

impl ChannelReceiver for ChannelEvents {
    fn view_accepted(&self, view: RawView) {
        let Some(service) = self.service.upgrade() else {
            return;
        };
        let view_id = view.view_id;
        if let Err(e) = service.views.process(view) {
            error!(view_id, error = %e, "failed to accept view");
        }
    }

    fn suspect(&self, address: Address) {
        if let Some(service) = self.service.upgrade() {
            service.on_suspect(address);
        }
    }

    fn block(&self) {
        if let Some(service) = self.service.upgrade() {
            debug!("flush started");
            service.gate.close();
        }
    }

    fn unblock(&self) {
        if let Some(service) = self.service.upgrade() {
            debug!("flush finished");
            service.gate.open();
        }
    }

    fn handle(&self, sender: Address, request: Bytes) -> Bytes {
        match self.service.upgrade() {
            Some(service) => service.router.handle_request(sender, &request),
            None => rpc::no_handler_response(),
        }
    }

    fn get_state(&self, out: &mut BytesMut) {
        if let Some(service) = self.service.upgrade() {
            service.state.write_state(out);
        }
    }

    fn set_state(&self, state: Bytes) {
        if let Some(service) = self.service.upgrade() {
            service.state.receive_state(state);
        }
    }
}
