//! The RPC channel: correlation, routing, lifecycle, and teardown.
//!
//! A [`Channel`] is a cloneable handle; [`Channel::new`] also returns the
//! *driver*, a future that owns the transport and must be polled for the
//! channel to make progress.  The driver multiplexes three sources with
//! `select!`: inbound frames from the transport, outbound frames queued by
//! handles and handler tasks, and the set of in-flight handler invocations
//! (a `FuturesUnordered`).  Handler tasks therefore interleave only at
//! suspension points of the driver, and the channel's tables sit behind a
//! single mutex so that caller-side handles on other threads can arm and
//! remove pending entries.
//!
//! Within one id, frames are observed in transport order; across ids there
//! is no ordering.  Every request either receives exactly one response,
//! times out locally, or is rejected when the channel is destroyed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::channel::mpsc;
use futures::future::{AbortHandle, Abortable, BoxFuture};
use futures::stream::FuturesUnordered;
use futures::{FutureExt as _, StreamExt as _};
use futures_timer::Delay;
use oneshot_fused_workaround as oneshot;
use tracing::{debug, trace, warn};

use crate::callback::{self, CallbackArg, CallbackOutlet};
use crate::codec::{self, Codec, Decoded, WireFormat};
use crate::err::{ConnectionError, ProtocolViolation, RpcError, ValidationPhase};
use crate::expose::{ExposeTree, Invokable, ValueStream};
use crate::io::{IoCapabilities, IoFrame, RpcIo};
use crate::middleware::{run_chain, Interceptor, InvokeContext, Outcome, Terminal, ValidatorTree};
use crate::msgs::{IdGenerator, Message, MsgBody, RequestId, ResponseBody};
use crate::proxy::RemotePath;
use crate::streams::{RpcStream, StreamEvent};
use crate::transfer::{self, TransferHandle, TransferRegistry, TransferSlot};
use crate::value::Value;

/// Options recognized at channel construction.  Everything has a default;
/// a `ChannelConfig::default()` channel exposes nothing and never times
/// out.
#[derive(Default)]
pub struct ChannelConfig {
    /// The local API tree exposed to the peer.
    expose: ExposeTree,
    /// Interceptors, in onion order.
    interceptors: Vec<Arc<dyn Interceptor>>,
    /// Per-method schemas.
    validators: ValidatorTree,
    /// How long a pending request may wait for its response.
    timeout: Option<Duration>,
    /// The outbound serialization format.
    serialization: Option<WireFormat>,
    /// Transfer handlers owned by this channel.
    transfers: TransferRegistry,
}

impl ChannelConfig {
    /// Start from the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the API tree exposed to the peer.
    pub fn expose(mut self, tree: ExposeTree) -> Self {
        self.expose = tree;
        self
    }

    /// Append an interceptor to the chain.
    pub fn interceptor(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Set the per-method schema tree.
    pub fn validators(mut self, validators: ValidatorTree) -> Self {
        self.validators = validators;
        self
    }

    /// Reject pending requests after `timeout`.  Default: wait forever.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the outbound serialization format.  Default:
    /// [`WireFormat::SuperJson`].
    pub fn serialization(mut self, format: WireFormat) -> Self {
        self.serialization = Some(format);
        self
    }

    /// Register a transfer handler with this channel.
    pub fn transfer_handler(mut self, handler: Arc<dyn crate::transfer::TransferHandler>) -> Self {
        self.transfers.register(handler);
        self
    }
}

/// What a resolved pending entry delivers to its caller.
pub(crate) enum PendingReply {
    /// A unary result.
    Value(Value),
    /// The peer opened a stream on this id.
    Stream(RpcStream),
}

/// One armed pending request.
struct Pending {
    /// Where to deliver the single outcome.
    reply: oneshot::Sender<Result<PendingReply, RpcError>>,
}

/// The lock-protected tables of a channel.
struct State {
    /// Set on destroy; afterwards every operation fails synchronously.
    destroyed: bool,
    /// Generator for request ids.
    req_ids: IdGenerator,
    /// Generator for callback ids.
    cb_ids: IdGenerator,
    /// Requests awaiting their response.
    pending: HashMap<RequestId, Pending>,
    /// Consumer-side open streams, by originating request id.
    consumers: HashMap<RequestId, mpsc::UnboundedSender<StreamEvent>>,
    /// Producer-side active streams, by originating request id.
    producers: HashMap<RequestId, AbortHandle>,
    /// Local callbacks the peer may invoke, by callback id.
    callbacks: HashMap<String, CallbackArg>,
    /// The peer's serialization format, detected from its first frame.
    peer_format: Option<WireFormat>,
    /// Wakes the driver for teardown; taken by the first destroy.
    destroy_tx: Option<oneshot::Sender<()>>,
}

/// The shared body of a channel.
pub(crate) struct Core {
    /// The local API tree.
    expose: ExposeTree,
    /// The interceptor chain.
    chain: Arc<[Arc<dyn Interceptor>]>,
    /// Per-method schemas.
    validators: ValidatorTree,
    /// The request timeout, if any.
    timeout: Option<Duration>,
    /// Transfer handlers owned by this channel.
    transfers: TransferRegistry,
    /// The outbound encoder.
    codec: Codec,
    /// What the transport can do.
    caps: IoCapabilities,
    /// The driver's outbound frame queue.
    outbound: mpsc::UnboundedSender<IoFrame>,
    /// The mutable tables.
    state: Mutex<State>,
}

/// A handle to an RPC channel.
///
/// Handles are cheap to clone and share one underlying channel.  The
/// channel only makes progress while the driver future returned by
/// [`Channel::new`] is being polled.
#[derive(Clone)]
pub struct Channel {
    /// The shared channel body.
    core: Arc<Core>,
}

impl Channel {
    /// Build a channel over `io`.
    ///
    /// Returns the handle and the driver future.  The driver resolves when
    /// the peer closes the transport, the channel is destroyed, or the
    /// transport fails; in every case all inflight state has been rejected
    /// by the time it returns.
    pub fn new(
        io: RpcIo,
        config: ChannelConfig,
    ) -> (Channel, impl std::future::Future<Output = Result<(), ConnectionError>> + Send) {
        let (outbound, outbound_rx) = mpsc::unbounded();
        let (destroy_tx, destroy_rx) = oneshot::channel();
        let caps = io.capabilities;
        let core = Arc::new(Core {
            expose: config.expose,
            chain: config.interceptors.into(),
            validators: config.validators,
            timeout: config.timeout,
            transfers: config.transfers,
            codec: Codec {
                format: config.serialization.unwrap_or_default(),
            },
            caps,
            outbound,
            state: Mutex::new(State {
                destroyed: false,
                req_ids: IdGenerator::new("req"),
                cb_ids: IdGenerator::new("cb"),
                pending: HashMap::new(),
                consumers: HashMap::new(),
                producers: HashMap::new(),
                callbacks: HashMap::new(),
                peer_format: None,
                destroy_tx: Some(destroy_tx),
            }),
        });
        let driver = drive(Arc::clone(&core), io, outbound_rx, destroy_rx);
        (Channel { core }, driver)
    }

    /// Invoke the unary method at a dotted path.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        let call = Call::Request {
            method: method.to_owned(),
            args,
        };
        match self.roundtrip(call).await? {
            PendingReply::Value(v) => Ok(v),
            // Dropping the unexpected stream cancels it.
            PendingReply::Stream(_) => {
                Err(RpcError::Protocol(ProtocolViolation::UnexpectedStream))
            }
        }
    }

    /// Invoke the streaming method at a dotted path.
    pub async fn call_stream(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<RpcStream, RpcError> {
        let call = Call::Request {
            method: method.to_owned(),
            args,
        };
        match self.roundtrip(call).await? {
            PendingReply::Stream(s) => Ok(s),
            PendingReply::Value(_) => {
                Err(RpcError::Protocol(ProtocolViolation::ExpectedStream))
            }
        }
    }

    /// Read the property at a dotted path.
    pub async fn get(&self, path: &str) -> Result<Value, RpcError> {
        let call = Call::Get {
            path: split_path(path),
        };
        match self.roundtrip(call).await? {
            PendingReply::Value(v) => Ok(v),
            PendingReply::Stream(_) => {
                Err(RpcError::Protocol(ProtocolViolation::UnexpectedStream))
            }
        }
    }

    /// Assign the property at a dotted path.
    ///
    /// Not fire-and-forget: the peer produces a response either way, so an
    /// assignment error propagates here.
    pub async fn set(&self, path: &str, value: Value) -> Result<(), RpcError> {
        let call = Call::Set {
            path: split_path(path),
            value,
        };
        self.roundtrip(call).await.map(|_| ())
    }

    /// Invoke the constructor at a dotted path, returning a snapshot of the
    /// constructed value.
    pub async fn construct(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        let call = Call::Construct {
            method: method.to_owned(),
            args,
        };
        match self.roundtrip(call).await? {
            PendingReply::Value(v) => Ok(v),
            PendingReply::Stream(_) => {
                Err(RpcError::Protocol(ProtocolViolation::UnexpectedStream))
            }
        }
    }

    /// A path builder rooted at the peer's expose tree.
    pub fn root(&self) -> RemotePath {
        RemotePath::new(self.clone())
    }

    /// Release local callbacks wrapping the same function as `cb`, without
    /// telling the peer.  (The peer-initiated release is
    /// [`RemoteCallback::free`](crate::RemoteCallback::free).)
    pub fn free_callback(&self, cb: &CallbackArg) {
        let mut state = self.core.state.lock().expect("lock poisoned");
        state.callbacks.retain(|_, c| !c.same_fn(cb));
    }

    /// Tear the channel down.
    ///
    /// Synchronous and idempotent: every pending request, open stream, and
    /// callback is rejected with [`RpcError::ChannelClosed`], no further
    /// frames are emitted, and any subsequent operation fails immediately.
    pub fn destroy(&self) {
        self.core.shutdown();
    }

    /// Return true once the channel has been destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.core.state.lock().expect("lock poisoned").destroyed
    }

    /// The peer's serialization format, as detected from its first frame.
    pub fn peer_format(&self) -> Option<WireFormat> {
        self.core.state.lock().expect("lock poisoned").peer_format
    }

    /// Issue one call and wait for its single outcome, honoring the
    /// configured timeout.
    async fn roundtrip(&self, call: Call) -> Result<PendingReply, RpcError> {
        let label = call.label();
        let (id, mut rx) = self.core.begin(call)?;
        let reply = match self.core.timeout {
            Some(timeout) => {
                let mut delay = Delay::new(timeout).fuse();
                futures::select! {
                    r = rx => r,
                    _ = delay => {
                        // Age the entry out; a late response will be
                        // silently discarded.
                        self.core.forget_pending(&id);
                        return Err(RpcError::Timeout {
                            method: label,
                            timeout,
                        });
                    }
                }
            }
            None => (&mut rx).await,
        };
        // A dropped sender means the channel was torn down under us.
        reply.unwrap_or(Err(RpcError::ChannelClosed))
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

/// Split a dotted path into segments.
fn split_path(path: &str) -> Vec<String> {
    path.split('.').map(str::to_owned).collect()
}

/// One outbound call, before encoding.
enum Call {
    /// A method invocation.
    Request {
        /// The dotted method path.
        method: String,
        /// Positional arguments.
        args: Vec<Value>,
    },
    /// A property read.
    Get {
        /// The path segments.
        path: Vec<String>,
    },
    /// A property write.
    Set {
        /// The path segments.
        path: Vec<String>,
        /// The value to assign.
        value: Value,
    },
    /// A constructor invocation.
    Construct {
        /// The dotted constructor path.
        method: String,
        /// Positional arguments.
        args: Vec<Value>,
    },
}

impl Call {
    /// The label used in timeout errors: the method, or the dotted path.
    fn label(&self) -> String {
        match self {
            Call::Request { method, .. } | Call::Construct { method, .. } => method.clone(),
            Call::Get { path } | Call::Set { path, .. } => path.join("."),
        }
    }
}

impl Core {
    /// Arm a pending entry and emit the frame for `call`.
    fn begin(
        &self,
        call: Call,
    ) -> Result<(RequestId, oneshot::Receiver<Result<PendingReply, RpcError>>), RpcError> {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.destroyed {
            return Err(RpcError::ChannelClosed);
        }
        let id = RequestId::Str(state.req_ids.next_id().into_boxed_str());

        let (body, slots, handles, cb_ids) = match call {
            Call::Request { method, args } => {
                let (args, slots, handles, cb_ids) =
                    self.extract_args(&mut state, args)?;
                (MsgBody::Request { method, args }, slots, handles, cb_ids)
            }
            Call::Construct { method, args } => {
                let (args, slots, handles, cb_ids) =
                    self.extract_args(&mut state, args)?;
                (MsgBody::Construct { method, args }, slots, handles, cb_ids)
            }
            Call::Get { path } => (MsgBody::Get { path }, Vec::new(), Vec::new(), Vec::new()),
            Call::Set { path, value } => {
                let (value, slots, handles, cb_ids) =
                    self.extract_payload(&mut state, value)?;
                (MsgBody::Set { path, value }, slots, handles, cb_ids)
            }
        };

        let (tx, rx) = oneshot::channel();
        state.pending.insert(id.clone(), Pending { reply: tx });

        let mut msg = Message::new(id.clone(), body);
        msg.callback_ids = cb_ids;
        msg.transfer_slots = slots;
        if let Err(e) = self.send_locked(&mut state, msg, handles) {
            state.pending.remove(&id);
            return Err(e);
        }
        Ok((id, rx))
    }

    /// Drop a pending entry without resolving it (timeout path).
    fn forget_pending(&self, id: &RequestId) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.pending.remove(id);
    }

    /// Extract callbacks and transfers from a positional argument list.
    fn extract_args(
        &self,
        state: &mut State,
        args: Vec<Value>,
    ) -> Result<(Vec<Value>, Vec<TransferSlot>, Vec<TransferHandle>, Vec<String>), RpcError> {
        let (value, slots, handles, cb_ids) =
            self.extract_payload(state, Value::Array(args))?;
        match value {
            Value::Array(args) => Ok((args, slots, handles, cb_ids)),
            _ => Err(RpcError::Protocol(ProtocolViolation::Unsendable(
                "argument list",
            ))),
        }
    }

    /// Extract callbacks and transfers from one outbound payload tree,
    /// registering the callbacks in the local table.
    fn extract_payload(
        &self,
        state: &mut State,
        value: Value,
    ) -> Result<(Value, Vec<TransferSlot>, Vec<TransferHandle>, Vec<String>), RpcError> {
        let allow = self.caps.transfer;
        let ext = {
            let cb_gen = &mut state.cb_ids;
            let mut mint = || cb_gen.next_id();
            transfer::extract(value, &self.transfers, allow, &mut mint)?
        };
        for (id, cb) in ext.callbacks {
            state.callbacks.insert(id, cb);
        }
        Ok((ext.value, ext.slots, ext.handles, ext.callback_ids))
    }

    /// Encode and queue one outbound frame.  The state lock is held by the
    /// caller, which is what makes the destroyed check and the queueing
    /// atomic.
    fn send_locked(
        &self,
        state: &mut State,
        msg: Message,
        handles: Vec<TransferHandle>,
    ) -> Result<(), RpcError> {
        if state.destroyed {
            return Err(RpcError::ChannelClosed);
        }
        // Handles are only ever extracted when the transport can move
        // them, so their presence alone selects the structured envelope.
        let structured = !handles.is_empty();
        let frame = self
            .codec
            .encode(msg, handles, structured)
            .map_err(RpcError::Protocol)?;
        self.outbound
            .unbounded_send(frame)
            .map_err(|_| RpcError::ChannelClosed)
    }

    /// As [`send_locked`](Self::send_locked), taking the lock itself.
    fn send_message(&self, msg: Message, handles: Vec<TransferHandle>) -> Result<(), RpcError> {
        let mut state = self.state.lock().expect("lock poisoned");
        self.send_locked(&mut state, msg, handles)
    }

    /// Rebuild one inbound payload tree: transfer slots first, then
    /// callback proxies.
    fn rehydrate_value(
        self: &Arc<Self>,
        value: Value,
        cb_ids: &[String],
        slots: &[TransferSlot],
        handles: Vec<TransferHandle>,
    ) -> Result<Value, RpcError> {
        let value = transfer::restore(value, slots, handles, &self.transfers)?;
        let outlet: Arc<dyn CallbackOutlet> = Arc::clone(self) as _;
        Ok(callback::rehydrate(value, cb_ids, &Arc::downgrade(&outlet)))
    }

    /// As [`rehydrate_value`](Self::rehydrate_value), for argument lists.
    fn rehydrate_args(
        self: &Arc<Self>,
        args: Vec<Value>,
        cb_ids: &[String],
        slots: &[TransferSlot],
        handles: Vec<TransferHandle>,
    ) -> Result<Vec<Value>, RpcError> {
        match self.rehydrate_value(Value::Array(args), cb_ids, slots, handles)? {
            Value::Array(args) => Ok(args),
            _ => Err(RpcError::Protocol(ProtocolViolation::Unsendable(
                "argument list",
            ))),
        }
    }

    /// Route one decoded inbound frame.
    fn dispatch(
        self: &Arc<Self>,
        decoded: Decoded,
        tasks: &mut FuturesUnordered<BoxFuture<'static, ()>>,
    ) {
        let Decoded {
            msg,
            handles,
            format,
        } = decoded;
        {
            let mut state = self.state.lock().expect("lock poisoned");
            if state.peer_format.is_none() {
                state.peer_format = Some(format);
            }
        }
        let Message {
            id,
            body,
            callback_ids,
            transfer_slots,
            ..
        } = msg;
        trace!("inbound {} frame for id {id}", body.type_str());

        match body {
            MsgBody::Request { method, args } => {
                match self.rehydrate_args(args, &callback_ids, &transfer_slots, handles) {
                    Ok(args) => {
                        let core = Arc::clone(self);
                        tasks.push(core.handle_request(id, method, args).boxed());
                    }
                    Err(e) => {
                        let _ = self.send_response(id, Err(e));
                    }
                }
            }
            MsgBody::Construct { method, args } => {
                match self.rehydrate_args(args, &callback_ids, &transfer_slots, handles) {
                    Ok(args) => {
                        let core = Arc::clone(self);
                        tasks.push(core.handle_construct(id, method, args).boxed());
                    }
                    Err(e) => {
                        let _ = self.send_response(id, Err(e));
                    }
                }
            }
            MsgBody::Get { path } => {
                let result = self.expose.get(&path);
                let _ = self.send_response(id, result);
            }
            MsgBody::Set { path, value } => {
                let result = self
                    .rehydrate_value(value, &callback_ids, &transfer_slots, handles)
                    .and_then(|v| self.expose.set(&path, v).map(|()| Value::Null));
                let _ = self.send_response(id, result);
            }
            MsgBody::Response(ResponseBody::Success(v)) => {
                let result = self
                    .rehydrate_value(v, &callback_ids, &transfer_slots, handles)
                    .map(PendingReply::Value);
                self.settle_pending(id, result);
            }
            MsgBody::Response(ResponseBody::Error(record)) => {
                self.settle_pending(id, Err(record.into_rpc_error()));
            }
            MsgBody::Response(ResponseBody::StreamStart) => {
                self.upgrade_pending(id);
            }
            MsgBody::StreamChunk { value } => {
                match self.rehydrate_value(value, &callback_ids, &transfer_slots, handles) {
                    Ok(v) => self.deliver_chunk(id, v),
                    Err(e) => self.finish_consumer(id, Some(e)),
                }
            }
            MsgBody::StreamEnd => self.finish_consumer(id, None),
            MsgBody::StreamError { error } => {
                self.finish_consumer(id, Some(error.into_rpc_error()));
            }
            MsgBody::StreamCancel => self.cancel_producer(&id),
            MsgBody::Callback { args } => {
                match self.rehydrate_args(args, &callback_ids, &transfer_slots, handles) {
                    Ok(args) => self.invoke_callback(&id, args),
                    Err(e) => warn!("could not rehydrate callback arguments: {e}"),
                }
            }
            MsgBody::CallbackFree => {
                let mut state = self.state.lock().expect("lock poisoned");
                for cb_id in &callback_ids {
                    if state.callbacks.remove(cb_id).is_none() {
                        debug!("peer released unknown callback {cb_id}");
                    }
                }
            }
        }
    }

    /// Run one inbound request to completion and respond.
    async fn handle_request(
        self: Arc<Self>,
        id: RequestId,
        method: String,
        args: Vec<Value>,
    ) {
        match self.invoke_pipeline(method, args).await {
            Ok(Outcome::Value(v)) => {
                let _ = self.send_response(id, Ok(v));
            }
            Ok(Outcome::Stream(stream)) => self.run_producer(id, stream).await,
            Err(e) => {
                let _ = self.send_response(id, Err(e));
            }
        }
    }

    /// Validation and the interceptor chain around one handler invocation.
    async fn invoke_pipeline(
        self: &Arc<Self>,
        method: String,
        args: Vec<Value>,
    ) -> Result<Outcome, RpcError> {
        let invokable = self.expose.resolve_invoke(&method)?;

        // Input validation runs before the interceptors see the call.
        let args = match self.validators.lookup(&method).and_then(|m| m.input.clone()) {
            Some(validator) => match validator.validate(&Value::Array(args.clone())) {
                Ok(Value::Array(coerced)) => coerced,
                Ok(_) => args,
                Err(issues) => {
                    return Err(RpcError::Validation {
                        phase: ValidationPhase::Input,
                        method,
                        issues,
                    });
                }
            },
            None => args,
        };

        let terminal: Terminal = Arc::new(move |ctx: InvokeContext| match &invokable {
            Invokable::Unary(h) => {
                let fut = h.invoke(ctx.args);
                async move { fut.await.map(Outcome::Value) }.boxed()
            }
            Invokable::Streaming(h) => {
                let fut = h.open(ctx.args);
                async move { fut.await.map(Outcome::Stream) }.boxed()
            }
        });
        let ctx = InvokeContext::new(method.clone(), args);
        let outcome = run_chain(Arc::clone(&self.chain), terminal, ctx).await?;

        // Output validation: the unary result, or every chunk.
        let output = self.validators.lookup(&method).and_then(|m| m.output.clone());
        match (outcome, output) {
            (outcome, None) => Ok(outcome),
            (Outcome::Value(v), Some(validator)) => match validator.validate(&v) {
                Ok(coerced) => Ok(Outcome::Value(coerced)),
                Err(issues) => Err(RpcError::Validation {
                    phase: ValidationPhase::Output,
                    method,
                    issues,
                }),
            },
            (Outcome::Stream(stream), Some(validator)) => {
                let stream = stream
                    .map(move |item| {
                        item.and_then(|v| {
                            validator.validate(&v).map_err(|issues| RpcError::Validation {
                                phase: ValidationPhase::Output,
                                method: method.clone(),
                                issues,
                            })
                        })
                    })
                    .boxed();
                Ok(Outcome::Stream(stream))
            }
        }
    }

    /// Run one inbound construct and respond.
    async fn handle_construct(
        self: Arc<Self>,
        id: RequestId,
        method: String,
        args: Vec<Value>,
    ) {
        let result = match self.expose.resolve_constructor(&method) {
            Ok(ctor) => ctor.invoke(args).await,
            Err(e) => Err(e),
        };
        let _ = self.send_response(id, result);
    }

    /// Announce and pump one producer stream, emitting exactly one terminal
    /// frame unless the channel is destroyed mid-stream.
    async fn run_producer(self: &Arc<Self>, id: RequestId, stream: ValueStream) {
        // Register before announcing, so that a cancel racing the first
        // chunks can always find the entry.
        let (abort, registration) = AbortHandle::new_pair();
        {
            let mut state = self.state.lock().expect("lock poisoned");
            if state.destroyed {
                return;
            }
            state.producers.insert(id.clone(), abort);
        }
        if self
            .send_message(
                Message::new(id.clone(), MsgBody::Response(ResponseBody::StreamStart)),
                Vec::new(),
            )
            .is_err()
        {
            let mut state = self.state.lock().expect("lock poisoned");
            state.producers.remove(&id);
            return;
        }

        /// How one pump run ended.
        enum Done {
            /// The sequence finished.
            End,
            /// The sequence failed.
            Failed(RpcError),
            /// The channel went away under us; say nothing.
            Silent,
        }

        let core = Arc::clone(self);
        let chunk_id = id.clone();
        let pump = async move {
            let mut stream = stream;
            while let Some(item) = stream.next().await {
                match item {
                    Ok(v) => {
                        if core.send_chunk(&chunk_id, v).is_err() {
                            return Done::Silent;
                        }
                    }
                    Err(e) => return Done::Failed(e),
                }
            }
            Done::End
        };
        let outcome = Abortable::new(pump, registration).await;

        {
            let mut state = self.state.lock().expect("lock poisoned");
            state.producers.remove(&id);
        }

        let terminal = match outcome {
            Ok(Done::End) => Some(MsgBody::StreamEnd),
            Ok(Done::Failed(e)) => Some(MsgBody::StreamError {
                error: e.to_record(),
            }),
            Ok(Done::Silent) => None,
            // A remote cancel still closes the stream cleanly.
            Err(futures::future::Aborted) => Some(MsgBody::StreamEnd),
        };
        if let Some(body) = terminal {
            let _ = self.send_message(Message::new(id, body), Vec::new());
        }
    }

    /// Emit one stream chunk, extracting any callbacks or transfers in it.
    fn send_chunk(&self, id: &RequestId, value: Value) -> Result<(), RpcError> {
        let mut state = self.state.lock().expect("lock poisoned");
        let (value, slots, handles, cb_ids) = self.extract_payload(&mut state, value)?;
        let mut msg = Message::new(id.clone(), MsgBody::StreamChunk { value });
        msg.callback_ids = cb_ids;
        msg.transfer_slots = slots;
        self.send_locked(&mut state, msg, handles)
    }

    /// Emit the single response for an inbound call.
    fn send_response(&self, id: RequestId, result: Result<Value, RpcError>) -> Result<(), RpcError> {
        let mut state = self.state.lock().expect("lock poisoned");
        let (body, slots, handles, cb_ids) = match result {
            Ok(v) => match self.extract_payload(&mut state, v) {
                Ok((v, slots, handles, cb_ids)) => (
                    MsgBody::Response(ResponseBody::Success(v)),
                    slots,
                    handles,
                    cb_ids,
                ),
                // A result we cannot encode still owes the caller a
                // response.
                Err(e) => (
                    MsgBody::Response(ResponseBody::Error(e.to_record())),
                    Vec::new(),
                    Vec::new(),
                    Vec::new(),
                ),
            },
            Err(e) => (
                MsgBody::Response(ResponseBody::Error(e.to_record())),
                Vec::new(),
                Vec::new(),
                Vec::new(),
            ),
        };
        let mut msg = Message::new(id, body);
        msg.callback_ids = cb_ids;
        msg.transfer_slots = slots;
        self.send_locked(&mut state, msg, handles)
    }

    /// Resolve or reject a pending request.
    fn settle_pending(&self, id: RequestId, result: Result<PendingReply, RpcError>) {
        let pending = {
            let mut state = self.state.lock().expect("lock poisoned");
            state.pending.remove(&id)
        };
        match pending {
            Some(p) => {
                let _ = p.reply.send(result);
            }
            // Timed out or cancelled locally; the late outcome is
            // discarded.
            None => trace!("discarding response for unknown request {id}"),
        }
    }

    /// Upgrade a pending request into a consumer stream.
    fn upgrade_pending(self: &Arc<Self>, id: RequestId) {
        let (pending, stream) = {
            let mut state = self.state.lock().expect("lock poisoned");
            match state.pending.remove(&id) {
                Some(p) => {
                    let (tx, rx) = mpsc::unbounded();
                    state.consumers.insert(id.clone(), tx);
                    let stream = RpcStream::new(id.clone(), rx, Arc::downgrade(self));
                    (Some(p), Some(stream))
                }
                None => (None, None),
            }
        };
        match (pending, stream) {
            (Some(p), Some(stream)) => {
                if let Err(_unwanted) = p.reply.send(Ok(PendingReply::Stream(stream))) {
                    // The caller stopped waiting; dropping the unwanted
                    // stream (outside the lock) cancels it.
                }
            }
            _ => {
                // Nobody is waiting for this stream; tell the producer to
                // stop rather than letting it run to nowhere.
                trace!("cancelling unawaited stream {id}");
                let mut state = self.state.lock().expect("lock poisoned");
                let msg = Message::new(id, MsgBody::StreamCancel);
                let _ = self.send_locked(&mut state, msg, Vec::new());
            }
        }
    }

    /// Hand one chunk to its consumer stream, dropping chunks for closed
    /// streams.
    fn deliver_chunk(&self, id: RequestId, value: Value) {
        let state = self.state.lock().expect("lock poisoned");
        match state.consumers.get(&id) {
            Some(tx) => {
                let _ = tx.unbounded_send(StreamEvent::Chunk(value));
            }
            None => trace!("dropping chunk for closed stream {id}"),
        }
    }

    /// Terminate a consumer stream: end-of-stream, or an error.
    fn finish_consumer(&self, id: RequestId, error: Option<RpcError>) {
        let tx = {
            let mut state = self.state.lock().expect("lock poisoned");
            state.consumers.remove(&id)
        };
        match tx {
            Some(tx) => {
                let event = match error {
                    None => StreamEvent::End,
                    Some(e) => StreamEvent::Error(e),
                };
                let _ = tx.unbounded_send(event);
            }
            None => trace!("terminal for unknown stream {id}"),
        }
    }

    /// Consumer-initiated cancel: forget the stream locally and tell the
    /// producer to stop.
    pub(crate) fn cancel_consumer(&self, id: &RequestId) {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.consumers.remove(id).is_none() {
            return;
        }
        let msg = Message::new(id.clone(), MsgBody::StreamCancel);
        let _ = self.send_locked(&mut state, msg, Vec::new());
    }

    /// A `stream-cancel` arrived: flag the producer; its pump observes the
    /// abort at the next suspension point and emits `stream-end`.
    fn cancel_producer(&self, id: &RequestId) {
        let state = self.state.lock().expect("lock poisoned");
        match state.producers.get(id) {
            Some(abort) => abort.abort(),
            None => trace!("cancel for unknown producer stream {id}"),
        }
    }

    /// Invoke a local callback the peer named.  Fire-and-forget: failures
    /// and stale ids are logged, never propagated.
    fn invoke_callback(&self, id: &RequestId, args: Vec<Value>) {
        let Some(cb_id) = id.as_str() else {
            warn!("callback frame with non-string id {id}");
            return;
        };
        let cb = {
            let state = self.state.lock().expect("lock poisoned");
            state.callbacks.get(cb_id).cloned()
        };
        match cb {
            Some(cb) => {
                if let Err(e) = cb.invoke(args) {
                    warn!("callback {cb_id} failed: {e}");
                }
            }
            None => warn!("peer invoked unknown or released callback {cb_id}"),
        }
    }

    /// Reject everything inflight and stop the driver.  Idempotent.
    fn shutdown(&self) {
        let (pending, consumers, producers, destroy_tx) = {
            let mut state = self.state.lock().expect("lock poisoned");
            state.destroyed = true;
            (
                state.pending.drain().collect::<Vec<_>>(),
                state.consumers.drain().collect::<Vec<_>>(),
                state.producers.drain().collect::<Vec<_>>(),
                {
                    state.callbacks.clear();
                    state.destroy_tx.take()
                },
            )
        };
        for (_, p) in pending {
            let _ = p.reply.send(Err(RpcError::ChannelClosed));
        }
        for (_, tx) in consumers {
            let _ = tx.unbounded_send(StreamEvent::Error(RpcError::ChannelClosed));
        }
        for (_, abort) in producers {
            abort.abort();
        }
        if let Some(tx) = destroy_tx {
            let _ = tx.send(());
        }
    }
}

impl CallbackOutlet for Core {
    fn send_callback(&self, id: &str, args: Vec<Value>) -> Result<(), RpcError> {
        let mut state = self.state.lock().expect("lock poisoned");
        let (args, slots, handles, cb_ids) = {
            let (value, slots, handles, cb_ids) =
                self.extract_payload(&mut state, Value::Array(args))?;
            match value {
                Value::Array(args) => (args, slots, handles, cb_ids),
                _ => {
                    return Err(RpcError::Protocol(ProtocolViolation::Unsendable(
                        "argument list",
                    )));
                }
            }
        };
        let mut msg = Message::new(RequestId::Str(id.into()), MsgBody::Callback { args });
        msg.callback_ids = cb_ids;
        msg.transfer_slots = slots;
        self.send_locked(&mut state, msg, handles)
    }

    fn free_callback(&self, id: &str) -> Result<(), RpcError> {
        let mut state = self.state.lock().expect("lock poisoned");
        let mut msg = Message::new(RequestId::Str(id.into()), MsgBody::CallbackFree);
        msg.callback_ids = vec![id.to_owned()];
        self.send_locked(&mut state, msg, Vec::new())
    }
}

/// The driver: owns the transport and multiplexes the channel's traffic
/// until the peer closes, the channel is destroyed, or the transport
/// fails.
async fn drive(
    core: Arc<Core>,
    io: RpcIo,
    mut outbound_rx: mpsc::UnboundedReceiver<IoFrame>,
    mut destroy_rx: oneshot::Receiver<()>,
) -> Result<(), ConnectionError> {
    let RpcIo {
        mut reader,
        mut writer,
        ..
    } = io;
    let mut tasks: FuturesUnordered<BoxFuture<'static, ()>> = FuturesUnordered::new();
    tasks.push(futures::future::pending().boxed());

    let result = loop {
        let mut read_fut = reader.read().fuse();
        futures::select! {
            r = tasks.next() => {
                // A handler task finished; nothing to do but forget it.
                let () = r.expect("future::pending() terminated");
            }

            frame = outbound_rx.next() => {
                if let Some(frame) = frame {
                    if let Err(e) = writer.write(frame).await {
                        break Err(ConnectionError::WriteFailed(Arc::new(e)));
                    }
                }
            }

            _ = &mut destroy_rx => break Ok(()),

            inbound = read_fut => match inbound {
                Err(e) => break Err(ConnectionError::ReadFailed(Arc::new(e))),
                // Orderly close by the peer.
                Ok(None) => break Ok(()),
                Ok(Some(frame)) => match codec::decode(frame) {
                    Err(violation) => break Err(ConnectionError::DecodeFailed(violation)),
                    Ok(decoded) => core.dispatch(decoded, &mut tasks),
                },
            },
        }
    };

    // Dropping the task set silently kills in-flight handlers and
    // producers; shutdown rejects whatever is still waiting.
    drop(tasks);
    core.shutdown();
    writer.destroy();

    match result {
        Err(e) if e.is_connection_close() => Ok(()),
        other => other,
    }
}

#[cfg(test)]
impl Channel {
    /// Number of armed pending requests (test hook).
    pub(crate) fn pending_len(&self) -> usize {
        self.core.state.lock().expect("lock poisoned").pending.len()
    }

    /// Number of open consumer streams (test hook).
    pub(crate) fn consumers_len(&self) -> usize {
        self.core.state.lock().expect("lock poisoned").consumers.len()
    }

    /// Number of active producer streams (test hook).
    pub(crate) fn producers_len(&self) -> usize {
        self.core.state.lock().expect("lock poisoned").producers.len()
    }

    /// Number of live local callbacks (test hook).
    pub(crate) fn callbacks_len(&self) -> usize {
        self.core.state.lock().expect("lock poisoned").callbacks.len()
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::missing_docs_in_private_items)]

    use super::*;
    use assert_matches::assert_matches;
    use bytes::Bytes;
    use futures_await_test::async_test;

    use crate::err::{ErrorRecord, Issue};
    use crate::expose::{handler_fn, stream_fn};
    use crate::io::duplex;
    use crate::middleware::{interceptor_fn, validator_fn, Validate};
    use crate::transfer::Transfer;

    /// Run `f` against a connected pair of channels, driving both until it
    /// finishes, then tear everything down.
    async fn run_pair<F, Fut>(
        cfg_a: ChannelConfig,
        cfg_b: ChannelConfig,
        caps: IoCapabilities,
        f: F,
    ) where
        F: FnOnce(Channel, Channel) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let (io_a, io_b) = duplex(caps);
        let (a, drv_a) = Channel::new(io_a, cfg_a);
        let (b, drv_b) = Channel::new(io_b, cfg_b);
        let logic = async {
            f(a.clone(), b.clone()).await;
            a.destroy();
            b.destroy();
        };
        let (ra, rb, ()) = futures::join!(drv_a, drv_b, logic);
        ra.unwrap();
        rb.unwrap();
    }

    /// Shorthand for a config exposing `tree`.
    fn exposing(tree: ExposeTree) -> ChannelConfig {
        ChannelConfig::new().expose(tree)
    }

    /// The server tree most scenarios run against.
    fn server_tree() -> ExposeTree {
        ExposeTree::new()
            .method(
                "add",
                handler_fn(|args| async move {
                    let a = args[0].as_i64().unwrap_or(0);
                    let b = args[1].as_i64().unwrap_or(0);
                    Ok(Value::Int(a + b))
                }),
            )
            .method(
                "echo",
                handler_fn(|mut args| async move {
                    Ok(args.pop().unwrap_or(Value::Null))
                }),
            )
            .method(
                "math.grade1.add",
                handler_fn(|args| async move {
                    let a = args[0].as_i64().unwrap_or(0);
                    let b = args[1].as_i64().unwrap_or(0);
                    if let Some(cb) = args.get(2).and_then(Value::as_remote_callback) {
                        let _ = cb.invoke(vec![Value::Int(a + b)]);
                    }
                    Ok(Value::Int(a + b))
                }),
            )
            .method(
                "slow",
                handler_fn(|args| async move {
                    let ms = args[0].as_i64().unwrap_or(0) as u64;
                    Delay::new(Duration::from_millis(ms)).await;
                    Ok(Value::from("done"))
                }),
            )
            .method(
                "fail",
                handler_fn(|_| async {
                    let mut rec = ErrorRecord::new("TeapotError", "short and stout");
                    rec.extra.insert("spout".to_owned(), Value::Bool(true));
                    Err(RpcError::Remote(rec))
                }),
            )
            .stream_method(
                "countdown",
                stream_fn(|args| async move {
                    let from = args[0].as_i64().unwrap_or(0);
                    let items: Vec<_> = (0..=from).rev().map(|i| Ok(Value::Int(i))).collect();
                    Ok(futures::stream::iter(items).boxed())
                }),
            )
            .stream_method(
                "infinite",
                stream_fn(|_| async {
                    Ok(futures::stream::unfold(0i64, |n| async move {
                        Delay::new(Duration::from_millis(1)).await;
                        Some((Ok(Value::Int(n)), n + 1))
                    })
                    .boxed())
                }),
            )
            .stream_method(
                "flaky",
                stream_fn(|_| async {
                    Ok(futures::stream::iter(vec![
                        Ok(Value::Int(1)),
                        Err(RpcError::Remote(ErrorRecord::new("Boom", "mid-stream"))),
                    ])
                    .boxed())
                }),
            )
            .constructor(
                "Counter",
                handler_fn(|args| async move {
                    Ok(Value::object([(
                        "start",
                        args.first().cloned().unwrap_or(Value::Null),
                    )]))
                }),
            )
            .value("config.name", Value::from("anon"))
    }

    #[async_test]
    async fn basic_call_and_clean_tables() {
        run_pair(
            exposing(server_tree()),
            ChannelConfig::new(),
            IoCapabilities::default(),
            |a, b| async move {
                let v = b.call("add", vec![2.into(), 3.into()]).await.unwrap();
                assert_eq!(v, Value::Int(5));
                assert_eq!(b.pending_len(), 0);
                assert_eq!(a.pending_len(), 0);

                let err = b.call("no.such.method", vec![]).await.unwrap_err();
                assert_matches!(
                    err,
                    RpcError::MethodNotFound { method } if method == "no.such.method"
                );
                assert_eq!(b.pending_len(), 0);
            },
        )
        .await;
    }

    #[async_test]
    async fn remote_errors_keep_their_properties() {
        run_pair(
            exposing(server_tree()),
            ChannelConfig::new(),
            IoCapabilities::default(),
            |_a, b| async move {
                let err = b.call("fail", vec![]).await.unwrap_err();
                let RpcError::Remote(rec) = err else {
                    panic!("expected a remote error");
                };
                assert_eq!(rec.name, "TeapotError");
                assert_eq!(rec.message, "short and stout");
                assert_eq!(rec.extra.get("spout"), Some(&Value::Bool(true)));
            },
        )
        .await;
    }

    #[async_test]
    async fn nested_path_with_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        run_pair(
            exposing(server_tree()),
            ChannelConfig::new(),
            IoCapabilities::default(),
            move |_a, b| async move {
                let cb = Value::callback(move |args| {
                    seen_cb
                        .lock()
                        .expect("lock poisoned")
                        .push(args[0].as_i64().unwrap());
                    Ok(())
                });
                let v = b
                    .call("math.grade1.add", vec![2.into(), 3.into(), cb])
                    .await
                    .unwrap();
                assert_eq!(v, Value::Int(5));
            },
        )
        .await;
        // The callback frame precedes the response on the wire, so it has
        // fired by the time the call resolves.
        assert_eq!(*seen.lock().unwrap(), vec![5]);
    }

    #[async_test]
    async fn countdown_stream_in_order() {
        run_pair(
            exposing(server_tree()),
            ChannelConfig::new(),
            IoCapabilities::default(),
            |_a, b| async move {
                let mut s = b.call_stream("countdown", vec![3.into()]).await.unwrap();
                let mut got = Vec::new();
                while let Some(item) = s.next().await {
                    got.push(item.unwrap().as_i64().unwrap());
                }
                assert_eq!(got, vec![3, 2, 1, 0]);
                assert_eq!(b.consumers_len(), 0);

                // The channel is still healthy for ordinary calls.
                let v = b.call("echo", vec!["ok".into()]).await.unwrap();
                assert_eq!(v, Value::from("ok"));
            },
        )
        .await;
    }

    #[async_test]
    async fn stream_error_surfaces_then_ends() {
        run_pair(
            exposing(server_tree()),
            ChannelConfig::new(),
            IoCapabilities::default(),
            |_a, b| async move {
                let mut s = b.call_stream("flaky", vec![]).await.unwrap();
                assert_eq!(s.next().await.unwrap().unwrap(), Value::Int(1));
                let err = s.next().await.unwrap().unwrap_err();
                assert_matches!(err, RpcError::Remote(rec) if rec.name == "Boom");
                assert!(s.next().await.is_none());
            },
        )
        .await;
    }

    #[async_test]
    async fn consumer_cancel_stops_the_producer() {
        run_pair(
            exposing(server_tree()),
            ChannelConfig::new(),
            IoCapabilities::default(),
            |a, b| async move {
                let mut s = b.call_stream("infinite", vec![]).await.unwrap();
                for want in 0..5 {
                    let got = s.next().await.unwrap().unwrap();
                    assert_eq!(got, Value::Int(want));
                }
                drop(s);

                // The cancel frame precedes this request, so the producer
                // has been flagged; the call proves the channel still
                // works.
                let v = b.call("echo", vec!["ok".into()]).await.unwrap();
                assert_eq!(v, Value::from("ok"));

                // The producer observes the abort at its next yield and
                // deregisters within bounded time.
                for _ in 0..100 {
                    if a.producers_len() == 0 {
                        break;
                    }
                    Delay::new(Duration::from_millis(5)).await;
                }
                assert_eq!(a.producers_len(), 0);
                assert_eq!(b.consumers_len(), 0);
            },
        )
        .await;
    }

    /// A validator accepting a tuple of numbers.
    fn numbers_only() -> impl Validate {
        validator_fn(|v| {
            let Some(args) = v.as_array() else {
                return Err(vec![Issue {
                    path: String::new(),
                    message: "expected an argument tuple".to_owned(),
                }]);
            };
            let issues: Vec<Issue> = args
                .iter()
                .enumerate()
                .filter(|(_, a)| a.as_f64().is_none())
                .map(|(i, a)| Issue {
                    path: i.to_string(),
                    message: format!("expected a number, got {}", a.type_name()),
                })
                .collect();
            if issues.is_empty() {
                Ok(v.clone())
            } else {
                Err(issues)
            }
        })
    }

    #[async_test]
    async fn input_validation_failure() {
        let cfg = exposing(server_tree())
            .validators(ValidatorTree::new().input("add", numbers_only()));
        run_pair(cfg, ChannelConfig::new(), IoCapabilities::default(), |_a, b| async move {
            let err = b
                .call("add", vec!["x".into(), "y".into()])
                .await
                .unwrap_err();
            match err {
                RpcError::Validation {
                    phase,
                    method,
                    issues,
                } => {
                    assert_eq!(phase, ValidationPhase::Input);
                    assert_eq!(method, "add");
                    assert_eq!(issues.len(), 2);
                    assert_eq!(issues[0].path, "0");
                }
                other => panic!("unexpected {other:?}"),
            }
            // Valid arguments still pass.
            let v = b.call("add", vec![2.into(), 3.into()]).await.unwrap();
            assert_eq!(v, Value::Int(5));
        })
        .await;
    }

    #[async_test]
    async fn output_validation_applies_per_chunk() {
        let double = validator_fn(|v| match v {
            Value::Int(n) => Ok(Value::Int(n * 2)),
            _ => Err(vec![Issue {
                path: String::new(),
                message: "expected an int chunk".to_owned(),
            }]),
        });
        let cfg = exposing(server_tree())
            .validators(ValidatorTree::new().output("countdown", double));
        run_pair(cfg, ChannelConfig::new(), IoCapabilities::default(), |_a, b| async move {
            let mut s = b.call_stream("countdown", vec![2.into()]).await.unwrap();
            let mut got = Vec::new();
            while let Some(item) = s.next().await {
                got.push(item.unwrap().as_i64().unwrap());
            }
            assert_eq!(got, vec![4, 2, 0]);
        })
        .await;
    }

    #[async_test]
    async fn timeout_rejects_and_late_response_is_discarded() {
        let cfg_b = ChannelConfig::new().timeout(Duration::from_millis(50));
        run_pair(exposing(server_tree()), cfg_b, IoCapabilities::default(), |_a, b| async move {
            let err = b.call("slow", vec![200.into()]).await.unwrap_err();
            assert_matches!(
                err,
                RpcError::Timeout { method, timeout }
                    if method == "slow" && timeout == Duration::from_millis(50)
            );
            assert_eq!(b.pending_len(), 0);

            // Let the peer's late response arrive; it is silently dropped
            // and the channel keeps working.
            Delay::new(Duration::from_millis(250)).await;
            let v = b.call("echo", vec!["ok".into()]).await.unwrap();
            assert_eq!(v, Value::from("ok"));
        })
        .await;
    }

    /// The tree for transfer tests: reports buffer lengths and the first
    /// buffer's backing address.
    fn lens_tree() -> ExposeTree {
        ExposeTree::new().method(
            "lens",
            handler_fn(|args| async move {
                let obj = args[0].as_object().expect("expected an object");
                let first = obj.get("first").and_then(Value::as_bytes).expect("first");
                let second = obj.get("second").and_then(Value::as_bytes).expect("second");
                Ok(Value::Array(vec![
                    Value::Int(first.len() as i64),
                    Value::Int(second.len() as i64),
                    Value::Int(first.as_ptr() as usize as i64),
                ]))
            }),
        )
    }

    #[async_test]
    async fn transfer_moves_buffers_zero_copy() {
        run_pair(
            exposing(lens_tree()),
            ChannelConfig::new(),
            IoCapabilities::transferable(),
            |_a, b| async move {
                let first = Bytes::from(vec![1u8; 100]);
                let second = Bytes::from(vec![2u8; 200]);
                let marked = Transfer::new(
                    Value::object([
                        ("first", Value::Bytes(first.clone())),
                        ("second", Value::Bytes(second.clone())),
                    ]),
                    vec![
                        TransferHandle::Bytes(first.clone()),
                        TransferHandle::Bytes(second),
                    ],
                );
                let v = b.call("lens", vec![marked.into()]).await.unwrap();
                let arr = v.as_array().unwrap();
                assert_eq!(arr[0], Value::Int(100));
                assert_eq!(arr[1], Value::Int(200));
                // The handler saw the very same backing storage.
                assert_eq!(arr[2], Value::Int(first.as_ptr() as usize as i64));
            },
        )
        .await;
    }

    #[async_test]
    async fn transfer_copies_on_text_transports() {
        run_pair(
            exposing(lens_tree()),
            ChannelConfig::new(),
            IoCapabilities::default(),
            |_a, b| async move {
                let first = Bytes::from(vec![1u8; 100]);
                let second = Bytes::from(vec![2u8; 200]);
                let marked = Transfer::new(
                    Value::object([
                        ("first", Value::Bytes(first.clone())),
                        ("second", Value::Bytes(second.clone())),
                    ]),
                    vec![
                        TransferHandle::Bytes(first.clone()),
                        TransferHandle::Bytes(second),
                    ],
                );
                let v = b.call("lens", vec![marked.into()]).await.unwrap();
                let arr = v.as_array().unwrap();
                // Same lengths, different storage: the buffers were copied
                // inline, and the sender's copies are intact.
                assert_eq!(arr[0], Value::Int(100));
                assert_eq!(arr[1], Value::Int(200));
                assert_ne!(arr[2], Value::Int(first.as_ptr() as usize as i64));
                assert_eq!(first.len(), 100);
            },
        )
        .await;
    }

    #[async_test]
    async fn destroy_rejects_inflight_and_later_calls() {
        run_pair(
            exposing(server_tree()),
            ChannelConfig::new(),
            IoCapabilities::default(),
            |_a, b| async move {
                let call = b.call("slow", vec![2000.into()]);
                let destroyer = async {
                    Delay::new(Duration::from_millis(20)).await;
                    b.destroy();
                };
                let (r, ()) = futures::join!(call, destroyer);
                assert_matches!(r.unwrap_err(), RpcError::ChannelClosed);
                assert_eq!(b.pending_len(), 0);

                // After destroy, calls fail synchronously.
                assert!(b.is_destroyed());
                let err = b.call("echo", vec![]).await.unwrap_err();
                assert_matches!(err, RpcError::ChannelClosed);
            },
        )
        .await;
    }

    #[async_test]
    async fn get_set_construct() {
        run_pair(
            exposing(server_tree()),
            ChannelConfig::new(),
            IoCapabilities::default(),
            |_a, b| async move {
                assert_eq!(b.get("config.name").await.unwrap(), Value::from("anon"));
                b.set("config.name", Value::from("kk")).await.unwrap();
                assert_eq!(b.get("config.name").await.unwrap(), Value::from("kk"));

                assert_matches!(
                    b.get("config.missing").await.unwrap_err(),
                    RpcError::MethodNotFound { .. }
                );
                assert_matches!(
                    b.set("add", Value::Null).await.unwrap_err(),
                    RpcError::MethodNotFound { .. }
                );

                let counter = b.construct("Counter", vec![7.into()]).await.unwrap();
                assert_eq!(counter, Value::object([("start", Value::Int(7))]));
                assert_matches!(
                    b.construct("add", vec![]).await.unwrap_err(),
                    RpcError::MethodNotFound { .. }
                );
            },
        )
        .await;
    }

    #[async_test]
    async fn path_builder_reaches_nested_entries() {
        run_pair(
            exposing(server_tree()),
            ChannelConfig::new(),
            IoCapabilities::default(),
            |_a, b| async move {
                let grade1 = b.root().sub("math").sub("grade1");
                let v = grade1.call("add", vec![2.into(), 3.into()]).await.unwrap();
                assert_eq!(v, Value::Int(5));

                let name = b.root().sub("config.name");
                assert_eq!(name.get().await.unwrap(), Value::from("anon"));
                name.set(Value::from("via-path")).await.unwrap();
                assert_eq!(name.get().await.unwrap(), Value::from("via-path"));
            },
        )
        .await;
    }

    #[async_test]
    async fn interceptors_wrap_requests_only() {
        let hits = Arc::new(Mutex::new(0u32));
        let hits_i = Arc::clone(&hits);
        let cfg = exposing(server_tree()).interceptor(interceptor_fn(move |ctx, next| {
            let hits = Arc::clone(&hits_i);
            async move {
                *hits.lock().expect("lock poisoned") += 1;
                match next.run(ctx).await? {
                    Outcome::Value(Value::Int(n)) => Ok(Outcome::Value(Value::Int(n * 10))),
                    other => Ok(other),
                }
            }
        }));
        run_pair(cfg, ChannelConfig::new(), IoCapabilities::default(), |_a, b| async move {
            let v = b.call("add", vec![2.into(), 3.into()]).await.unwrap();
            assert_eq!(v, Value::Int(50));

            // Property access does not run the chain.
            let _ = b.get("config.name").await.unwrap();
        })
        .await;
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[async_test]
    async fn callback_free_releases_the_owner_entry() {
        let tree = ExposeTree::new().method(
            "use_cb",
            handler_fn(|args| async move {
                let cb = args[0].as_remote_callback().expect("callback").clone();
                let _ = cb.invoke(vec![Value::Int(1)]);
                let _ = cb.free();
                // Stale invocation after the free: the owner logs and
                // ignores it.
                let _ = cb.invoke(vec![Value::Int(2)]);
                Ok(Value::Null)
            }),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        run_pair(
            exposing(tree),
            ChannelConfig::new(),
            IoCapabilities::default(),
            move |_a, b| async move {
                let cb = Value::callback(move |args| {
                    seen_cb
                        .lock()
                        .expect("lock poisoned")
                        .push(args[0].as_i64().unwrap());
                    Ok(())
                });
                b.call("use_cb", vec![cb]).await.unwrap();
                assert_eq!(b.callbacks_len(), 0);
                // Channel is unscathed by the stale invocation.
                let v = b.call("use_cb", vec![Value::callback(|_| Ok(()))]).await;
                assert!(v.is_ok());
            },
        )
        .await;
        // Exactly one delivery: the invocation before the free.
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[async_test]
    async fn local_free_callback_clears_the_table() {
        run_pair(
            exposing(server_tree()),
            ChannelConfig::new(),
            IoCapabilities::default(),
            |_a, b| async move {
                let cb = CallbackArg::new(|_| Ok(()));
                let v = b
                    .call(
                        "math.grade1.add",
                        vec![1.into(), 2.into(), Value::Callback(cb.clone())],
                    )
                    .await
                    .unwrap();
                assert_eq!(v, Value::Int(3));
                assert_eq!(b.callbacks_len(), 1);
                b.free_callback(&cb);
                assert_eq!(b.callbacks_len(), 0);
            },
        )
        .await;
    }

    #[async_test]
    async fn mixed_formats_interoperate() {
        let cfg_a = exposing(server_tree()).serialization(WireFormat::Json);
        let cfg_b = ChannelConfig::new().serialization(WireFormat::SuperJson);
        run_pair(cfg_a, cfg_b, IoCapabilities::default(), |a, b| async move {
            // Plain values cross both directions untouched.
            let v = b.call("echo", vec!["ok".into()]).await.unwrap();
            assert_eq!(v, Value::from("ok"));

            // b sends superjson, so its bytes reach the handler intact;
            // a answers in plain json, so they come back downgraded.
            let v = b
                .call("echo", vec![Value::Bytes(Bytes::from_static(b"raw"))])
                .await
                .unwrap();
            assert_matches!(v, Value::String(_));

            // Each side cached what the peer speaks.
            assert_eq!(a.peer_format(), Some(WireFormat::SuperJson));
            assert_eq!(b.peer_format(), Some(WireFormat::Json));
        })
        .await;
    }
}
