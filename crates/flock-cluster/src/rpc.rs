//! Request/response routing across the group.
//!
//! Calls are addressed to the whole group, to the coordinator or to a single
//! node, each in a synchronous and a fire-and-forget flavour. When the
//! channel never delivers a node's own messages back to it, calls that
//! include the local node invoke the local handler in-process instead.
//!
//! On the wire a request is a postcard [`RequestFrame`] carrying the service
//! name next to the codec-encoded arguments, so a receiver can pick the
//! service's codec before touching the arguments. Responses are
//! [`ResponseFrame`]s; [`ResponseFrame::NoHandler`] marks nodes without the
//! service and is dropped on the calling side.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use flock_net::{
    Address, Channel, Codec, Destination, Response, ResponseMode, ResponseOutcome, RspFilter,
    SendOptions,
};
use flock_types::{HandlerError, MethodCall, NodeIdentity, Value};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use crate::error::ClusterError;
use crate::executor::Executor;
use crate::gate::FlushGate;
use crate::resolver::NodeResolver;
use crate::view::Membership;

// ---------------------------------------------------------------------------
// Public traits and call description
// ---------------------------------------------------------------------------

/// Server side of a named RPC service.
pub trait RpcHandler: Send + Sync {
    fn invoke(&self, call: &MethodCall) -> Result<Value, HandlerError>;
}

impl<F> RpcHandler for F
where
    F: Fn(&MethodCall) -> Result<Value, HandlerError> + Send + Sync,
{
    fn invoke(&self, call: &MethodCall) -> Result<Value, HandlerError> {
        self(call)
    }
}

/// Decides which responses of a call are kept and when to stop waiting.
///
/// Nodes without the service never reach the filter. Handler failures are
/// shown to [`ResponseFilter::is_acceptable_failure`]; an accepted failure
/// counts as a response but is still left out of the call's results.
pub trait ResponseFilter: Send + Sync {
    fn is_acceptable(&self, response: &Value, sender: &NodeIdentity) -> bool;

    fn is_acceptable_failure(&self, _error: &HandlerError, _sender: &NodeIdentity) -> bool {
        true
    }

    fn need_more_responses(&self) -> bool;
}

/// A method invocation on a named service, plus how to issue it.
#[derive(Clone)]
pub struct RpcCall {
    service: String,
    method: String,
    args: Vec<Value>,
    types: Vec<String>,
    exclude_self: bool,
    timeout: Option<Duration>,
    filter: Option<Arc<dyn ResponseFilter>>,
    unordered: bool,
}

impl RpcCall {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            args: Vec::new(),
            types: Vec::new(),
            exclude_self: false,
            timeout: None,
            filter: None,
            unordered: false,
        }
    }

    /// Append an argument; its type name is appended to the signature.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        let value = value.into();
        self.types.push(value.type_name().to_string());
        self.args.push(value);
        self
    }

    /// Replace the arguments; the signature is derived from them.
    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.types = args.iter().map(|a| a.type_name().to_string()).collect();
        self.args = args;
        self
    }

    /// Override the type signature.
    pub fn types(mut self, types: Vec<String>) -> Self {
        self.types = types;
        self
    }

    /// Skip the local node.
    pub fn exclude_self(mut self, exclude: bool) -> Self {
        self.exclude_self = exclude;
        self
    }

    /// Override the service's default call timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn filter(mut self, filter: Arc<dyn ResponseFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Allow the transport to deliver this call out of order.
    pub fn unordered(mut self, unordered: bool) -> Self {
        self.unordered = unordered;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    fn method_call(&self) -> MethodCall {
        MethodCall {
            method: self.method.clone(),
            args: self.args.clone(),
            types: self.types.clone(),
        }
    }
}

impl fmt::Debug for RpcCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcCall")
            .field("service", &self.service)
            .field("method", &self.method)
            .field("args", &self.args.len())
            .field("exclude_self", &self.exclude_self)
            .field("timeout", &self.timeout)
            .field("filter", &self.filter.is_some())
            .field("unordered", &self.unordered)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Wire frames
// ---------------------------------------------------------------------------

/// A request as sent over the channel.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RequestFrame {
    service: String,
    method: String,
    types: Vec<String>,
    /// Codec-encoded [`Value::List`] of the arguments.
    args: Vec<u8>,
}

/// A response as sent over the channel.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum ResponseFrame {
    /// Codec-encoded return value.
    Return(Vec<u8>),
    /// The handler failed.
    Threw(HandlerError),
    /// The receiving node has no handler for the service.
    NoHandler,
}

impl ResponseFrame {
    fn encode(&self) -> Bytes {
        match postcard::to_allocvec(self) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                error!(error = %e, "failed to encode response frame");
                Bytes::new()
            }
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self, ClusterError> {
        postcard::from_bytes(bytes).map_err(|e| ClusterError::Serialization(e.to_string()))
    }
}

/// The response sent when no service is available to answer.
pub(crate) fn no_handler_response() -> Bytes {
    ResponseFrame::NoHandler.encode()
}

fn encode_request(call: &RpcCall, codec: &dyn Codec) -> Result<Bytes, ClusterError> {
    let frame = RequestFrame {
        service: call.service.clone(),
        method: call.method.clone(),
        types: call.types.clone(),
        args: codec.encode(&Value::List(call.args.clone()))?,
    };
    postcard::to_allocvec(&frame)
        .map(Bytes::from)
        .map_err(|e| ClusterError::Serialization(e.to_string()))
}

// ---------------------------------------------------------------------------
// Handler registry entries
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct HandlerEntry {
    handler: Arc<dyn RpcHandler>,
    codec: Arc<dyn Codec>,
}

/// Run `handler`, turning a panic into a [`HandlerError`].
fn invoke_guarded(handler: &dyn RpcHandler, call: &MethodCall) -> Result<Value, HandlerError> {
    match panic::catch_unwind(AssertUnwindSafe(|| handler.invoke(call))) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            Err(HandlerError::new("panic", message))
        }
    }
}

/// Adapts a [`ResponseFilter`] to the byte-level filter of the channel.
struct FrameFilter {
    inner: Arc<dyn ResponseFilter>,
    codec: Arc<dyn Codec>,
    resolver: Arc<NodeResolver>,
}

impl RspFilter for FrameFilter {
    fn is_acceptable(&self, response: &[u8], sender: Address) -> bool {
        match ResponseFrame::decode(response) {
            Ok(ResponseFrame::Return(body)) => {
                let (Ok(value), Ok(node)) = (self.codec.decode(&body), self.resolver.resolve(sender))
                else {
                    return false;
                };
                self.inner.is_acceptable(&value, &node)
            }
            Ok(ResponseFrame::Threw(error)) => match self.resolver.resolve(sender) {
                Ok(node) => self.inner.is_acceptable_failure(&error, &node),
                Err(_) => false,
            },
            Ok(ResponseFrame::NoHandler) | Err(_) => false,
        }
    }

    fn need_more_responses(&self) -> bool {
        self.inner.need_more_responses()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Issues RPC calls and dispatches inbound requests to local handlers.
pub(crate) struct RpcRouter {
    channel: Arc<dyn Channel>,
    membership: Arc<Membership>,
    resolver: Arc<NodeResolver>,
    gate: Arc<FlushGate>,
    executor: Executor,
    codec: Arc<dyn Codec>,
    handlers: DashMap<String, HandlerEntry>,
    default_timeout: Duration,
    direct_invoke_local: AtomicBool,
}

impl RpcRouter {
    pub(crate) fn new(
        channel: Arc<dyn Channel>,
        membership: Arc<Membership>,
        resolver: Arc<NodeResolver>,
        gate: Arc<FlushGate>,
        executor: Executor,
        codec: Arc<dyn Codec>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            channel,
            membership,
            resolver,
            gate,
            executor,
            codec,
            handlers: DashMap::new(),
            default_timeout,
            direct_invoke_local: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_direct_invoke_local(&self, enabled: bool) {
        self.direct_invoke_local.store(enabled, Ordering::Release);
    }

    fn direct_invoke_local(&self) -> bool {
        self.direct_invoke_local.load(Ordering::Acquire)
    }

    // -- Handler registry --

    pub(crate) fn register(
        &self,
        service: &str,
        handler: Arc<dyn RpcHandler>,
        codec: Option<Arc<dyn Codec>>,
    ) {
        let entry = HandlerEntry {
            handler,
            codec: codec.unwrap_or_else(|| self.codec.clone()),
        };
        if self.handlers.insert(service.to_string(), entry).is_some() {
            debug!(service, "replaced rpc handler");
        } else {
            debug!(service, "registered rpc handler");
        }
    }

    pub(crate) fn unregister(&self, service: &str) {
        if self.handlers.remove(service).is_some() {
            debug!(service, "unregistered rpc handler");
        }
    }

    fn handler(&self, service: &str) -> Option<HandlerEntry> {
        self.handlers.get(service).map(|entry| entry.clone())
    }

    fn codec_for(&self, service: &str) -> Arc<dyn Codec> {
        self.handlers
            .get(service)
            .map(|entry| entry.codec.clone())
            .unwrap_or_else(|| self.codec.clone())
    }

    // -- Shared call plumbing --

    fn local(&self) -> Result<(Address, NodeIdentity), ClusterError> {
        match (self.membership.local_address(), self.membership.local()) {
            (Some(address), Some(node)) => Ok((address, node.clone())),
            _ => Err(ClusterError::NotStarted),
        }
    }

    fn timeout_of(&self, call: &RpcCall) -> Duration {
        call.timeout.unwrap_or(self.default_timeout)
    }

    async fn await_flush(&self, timeout: Duration) -> Result<(), ClusterError> {
        if self.channel.flush_supported() {
            self.gate.wait(timeout).await?;
        }
        Ok(())
    }

    fn options(
        &self,
        call: &RpcCall,
        mode: ResponseMode,
        timeout: Duration,
        codec: &Arc<dyn Codec>,
    ) -> SendOptions {
        let filter = call.filter.as_ref().map(|inner| {
            Arc::new(FrameFilter {
                inner: inner.clone(),
                codec: codec.clone(),
                resolver: self.resolver.clone(),
            }) as Arc<dyn RspFilter>
        });
        SendOptions::new(mode, timeout)
            .unordered(call.unordered)
            .filter(filter)
    }

    /// Invoke the local handler of `service`. `None` when there is none.
    fn invoke_local(&self, service: &str, call: &MethodCall) -> Option<Result<Value, HandlerError>> {
        let entry = self.handler(service)?;
        Some(invoke_guarded(entry.handler.as_ref(), call))
    }

    fn invoke_local_sync(&self, call: &RpcCall) -> Result<Option<Value>, ClusterError> {
        trace!(service = %call.service, method = %call.method, "invoking local handler");
        match self.invoke_local(&call.service, &call.method_call()) {
            None => Ok(None),
            Some(Ok(value)) => Ok(Some(value)),
            Some(Err(e)) => Err(ClusterError::Remote(e)),
        }
    }

    fn spawn_local(&self, call: &RpcCall) {
        let Some(entry) = self.handler(&call.service) else {
            return;
        };
        let method_call = call.method_call();
        let service = call.service.clone();
        self.executor.spawn_blocking("flock-rpc-local", move || {
            if let Err(e) = invoke_guarded(entry.handler.as_ref(), &method_call) {
                warn!(service = %service, method = %method_call.method, error = %e, "local async invocation failed");
            }
        });
    }

    /// Decode the successful values of a broadcast, in arrival order.
    fn collect(&self, service: &str, codec: &dyn Codec, responses: Vec<Response>) -> Vec<Value> {
        let mut values = Vec::with_capacity(responses.len());
        for response in responses {
            let sender = response.sender;
            match response.outcome {
                ResponseOutcome::Received(bytes) => match ResponseFrame::decode(&bytes) {
                    Ok(ResponseFrame::Return(body)) => match codec.decode(&body) {
                        Ok(value) => values.push(value),
                        Err(e) => {
                            warn!(service, %sender, error = %e, "dropping undecodable response")
                        }
                    },
                    Ok(ResponseFrame::Threw(e)) => {
                        debug!(service, %sender, error = %e, "remote handler failed")
                    }
                    Ok(ResponseFrame::NoHandler) => {
                        trace!(service, %sender, "no handler on member")
                    }
                    Err(e) => warn!(service, %sender, error = %e, "dropping malformed response"),
                },
                ResponseOutcome::Suspected => debug!(service, %sender, "member suspected"),
                ResponseOutcome::NotReceived => trace!(service, %sender, "no response"),
                ResponseOutcome::Failed(reason) => {
                    debug!(service, %sender, %reason, "member failed to process request")
                }
            }
        }
        values
    }

    /// Point-to-point synchronous call.
    async fn call_single(
        &self,
        call: &RpcCall,
        address: Address,
        target: &NodeIdentity,
        timeout: Duration,
    ) -> Result<Option<Value>, ClusterError> {
        let codec = self.codec_for(&call.service);
        let payload = encode_request(call, codec.as_ref())?;
        let options = self.options(call, ResponseMode::All, timeout, &codec);

        debug!(service = %call.service, method = %call.method, target = %target, "calling node");
        let responses = self
            .channel
            .send(Destination::Node(address), payload, options)
            .await?;

        let Some(response) = responses.into_iter().next() else {
            return Err(ClusterError::Timeout {
                operation: "rpc response",
                after: timeout,
            });
        };

        match response.outcome {
            ResponseOutcome::Received(bytes) => match ResponseFrame::decode(&bytes)? {
                ResponseFrame::Return(body) => match codec.decode(&body) {
                    Ok(value) => Ok(Some(value)),
                    Err(e) => {
                        warn!(service = %call.service, target = %target, error = %e, "undecodable response");
                        Err(e.into())
                    }
                },
                ResponseFrame::Threw(e) => Err(ClusterError::Remote(e)),
                ResponseFrame::NoHandler => Ok(None),
            },
            ResponseOutcome::NotReceived if call.filter.is_some() => Ok(None),
            ResponseOutcome::NotReceived => Err(ClusterError::Timeout {
                operation: "rpc response",
                after: timeout,
            }),
            ResponseOutcome::Suspected => Err(ClusterError::Suspected(target.clone())),
            ResponseOutcome::Failed(reason) => {
                Err(ClusterError::Remote(HandlerError::new("TransportFailure", reason)))
            }
        }
    }

    fn resolve_target(&self, target: &NodeIdentity) -> Result<Address, ClusterError> {
        self.membership
            .snapshot()
            .address_of(target)
            .or_else(|| self.resolver.address_of(target))
            .ok_or_else(|| ClusterError::NodeNotFound(target.clone()))
    }

    // -- Addressing modes --

    /// Call every member and return the successful results.
    pub(crate) async fn call_on_cluster(&self, call: RpcCall) -> Result<Vec<Value>, ClusterError> {
        let (local_address, me) = self.local()?;
        let timeout = self.timeout_of(&call);
        self.await_flush(timeout).await?;

        let codec = self.codec_for(&call.service);
        let payload = encode_request(&call, codec.as_ref())?;
        let invoke_locally = !call.exclude_self && self.direct_invoke_local();
        let mut options = self.options(&call, ResponseMode::All, timeout, &codec);
        if call.exclude_self || invoke_locally {
            options = options.exclude(local_address);
        }

        debug!(service = %call.service, method = %call.method, invoke_locally, "calling cluster");
        let responses = self.channel.send(Destination::All, payload, options).await?;
        let mut values = self.collect(&call.service, codec.as_ref(), responses);

        if invoke_locally
            && call
                .filter
                .as_ref()
                .is_none_or(|f| f.need_more_responses())
        {
            match self.invoke_local(&call.service, &call.method_call()) {
                Some(Ok(value)) => {
                    if call
                        .filter
                        .as_ref()
                        .is_none_or(|f| f.is_acceptable(&value, &me))
                    {
                        values.push(value);
                    }
                }
                Some(Err(e)) => {
                    if let Some(filter) = &call.filter {
                        filter.is_acceptable_failure(&e, &me);
                    }
                    debug!(service = %call.service, method = %call.method, error = %e, "local handler failed")
                }
                None => trace!(service = %call.service, "no local handler"),
            }
        }

        Ok(values)
    }

    /// Send to every member without waiting for results.
    pub(crate) async fn call_async_on_cluster(&self, call: RpcCall) -> Result<(), ClusterError> {
        let (local_address, _) = self.local()?;
        let timeout = self.timeout_of(&call);
        self.await_flush(timeout).await?;

        let codec = self.codec_for(&call.service);
        let payload = encode_request(&call, codec.as_ref())?;
        let invoke_locally = !call.exclude_self && self.direct_invoke_local();
        let mut options = self.options(&call, ResponseMode::None, timeout, &codec);
        if call.exclude_self || invoke_locally {
            options = options.exclude(local_address);
        }

        debug!(service = %call.service, method = %call.method, invoke_locally, "calling cluster asynchronously");
        self.channel.send(Destination::All, payload, options).await?;
        if invoke_locally {
            self.spawn_local(&call);
        }
        Ok(())
    }

    /// Call the coordinator and return its result.
    pub(crate) async fn call_on_coordinator(&self, call: RpcCall) -> Result<Option<Value>, ClusterError> {
        let (_, me) = self.local()?;
        let timeout = self.timeout_of(&call);
        self.await_flush(timeout).await?;

        let snapshot = self.membership.snapshot();
        let (Some(address), Some(coordinator)) =
            (snapshot.coordinator_address(), snapshot.view.coordinator())
        else {
            return Err(ClusterError::NoView);
        };

        if *coordinator == me {
            if call.exclude_self {
                debug!(service = %call.service, "local node is coordinator, call excluded");
                return Ok(None);
            }
            if self.direct_invoke_local() {
                return self.invoke_local_sync(&call);
            }
        }

        self.call_single(&call, address, coordinator, timeout).await
    }

    /// Send to the coordinator without waiting for the result.
    pub(crate) async fn call_async_on_coordinator(&self, call: RpcCall) -> Result<(), ClusterError> {
        let (_, me) = self.local()?;
        let timeout = self.timeout_of(&call);
        self.await_flush(timeout).await?;

        let snapshot = self.membership.snapshot();
        let (Some(address), Some(coordinator)) =
            (snapshot.coordinator_address(), snapshot.view.coordinator())
        else {
            return Err(ClusterError::NoView);
        };

        if *coordinator == me {
            if call.exclude_self {
                return Ok(());
            }
            if self.direct_invoke_local() {
                self.spawn_local(&call);
                return Ok(());
            }
        }

        let codec = self.codec_for(&call.service);
        let payload = encode_request(&call, codec.as_ref())?;
        let options = self.options(&call, ResponseMode::None, timeout, &codec);
        self.channel
            .send(Destination::Node(address), payload, options)
            .await?;
        Ok(())
    }

    /// Call a single node and return its result.
    pub(crate) async fn call_on_node(
        &self,
        call: RpcCall,
        target: &NodeIdentity,
    ) -> Result<Option<Value>, ClusterError> {
        let (_, me) = self.local()?;
        let timeout = self.timeout_of(&call);
        self.await_flush(timeout).await?;

        if *target == me && self.direct_invoke_local() {
            return self.invoke_local_sync(&call);
        }

        let address = self.resolve_target(target)?;
        self.call_single(&call, address, target, timeout).await
    }

    /// Send to a single node without waiting for the result.
    pub(crate) async fn call_async_on_node(
        &self,
        call: RpcCall,
        target: &NodeIdentity,
    ) -> Result<(), ClusterError> {
        let (_, me) = self.local()?;
        let timeout = self.timeout_of(&call);
        self.await_flush(timeout).await?;

        if *target == me && self.direct_invoke_local() {
            self.spawn_local(&call);
            return Ok(());
        }

        let address = self.resolve_target(target)?;
        let codec = self.codec_for(&call.service);
        let payload = encode_request(&call, codec.as_ref())?;
        let options = self.options(&call, ResponseMode::None, timeout, &codec);
        self.channel
            .send(Destination::Node(address), payload, options)
            .await?;
        Ok(())
    }

    // -- Inbound --

    /// Dispatch a request received from `sender` and encode the response.
    pub(crate) fn handle_request(&self, sender: Address, request: &[u8]) -> Bytes {
        let frame: RequestFrame = match postcard::from_bytes(request) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%sender, error = %e, "malformed request");
                return ResponseFrame::Threw(HandlerError::new("MalformedRequest", e.to_string()))
                    .encode();
            }
        };

        let Some(entry) = self.handler(&frame.service) else {
            trace!(%sender, service = %frame.service, "no handler registered");
            return no_handler_response();
        };

        let args = match entry.codec.decode(&frame.args) {
            Ok(Value::List(args)) => args,
            Ok(other) => vec![other],
            Err(e) => {
                warn!(%sender, service = %frame.service, error = %e, "undecodable arguments");
                return ResponseFrame::Threw(HandlerError::new("MalformedRequest", e.to_string()))
                    .encode();
            }
        };
        let call = MethodCall {
            method: frame.method,
            args,
            types: frame.types,
        };

        let response = match invoke_guarded(entry.handler.as_ref(), &call) {
            Ok(value) => match entry.codec.encode(&value) {
                Ok(body) => ResponseFrame::Return(body),
                Err(e) => ResponseFrame::Threw(HandlerError::new("EncodeError", e.to_string())),
            },
            Err(e) => {
                debug!(%sender, service = %frame.service, method = %call.method, error = %e, "handler failed");
                ResponseFrame::Threw(e)
            }
        };
        response.encode()
    }
}
