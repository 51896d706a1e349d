//! First-class callback arguments.
//!
//! When a [`Value::Callback`](crate::Value::Callback) crosses the channel,
//! the originating side keeps the function alive in its local callback
//! table and sends a placeholder string carrying a fresh callback id.  The
//! receiving side rehydrates the placeholder into a [`RemoteCallback`]
//! proxy; invoking the proxy emits a `callback` frame back to the owner.
//! Callback invocations are fire-and-forget: no response is expected, and
//! errors are logged on the owning side rather than propagated.

use std::sync::{Arc, Weak};

use crate::err::RpcError;
use crate::value::Value;

/// Prefix of the placeholder string a callback argument becomes on the wire.
pub(crate) const CALLBACK_PLACEHOLDER_PREFIX: &str = "__kkrpc_callback_";

/// The function type held in the local callback table.
type CallbackFn = dyn Fn(Vec<Value>) -> Result<(), RpcError> + Send + Sync;

/// A local function being passed to the peer as an argument.
///
/// Cloning shares the underlying function.  The function stays invocable by
/// the peer until it is released with
/// [`Channel::free_callback`](crate::Channel::free_callback) or the channel
/// is destroyed.
#[derive(Clone)]
pub struct CallbackArg {
    /// The function to run when the peer invokes this callback.
    func: Arc<CallbackFn>,
}

impl CallbackArg {
    /// Wrap a function as a callback argument.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<(), RpcError> + Send + Sync + 'static,
    {
        CallbackArg { func: Arc::new(f) }
    }

    /// Invoke the underlying function.
    pub(crate) fn invoke(&self, args: Vec<Value>) -> Result<(), RpcError> {
        (self.func)(args)
    }

    /// Return true if `other` wraps the same underlying function.
    pub(crate) fn same_fn(&self, other: &CallbackArg) -> bool {
        Arc::ptr_eq(&self.func, &other.func)
    }
}

impl std::fmt::Debug for CallbackArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CallbackArg(..)")
    }
}

impl PartialEq for CallbackArg {
    fn eq(&self, other: &Self) -> bool {
        self.same_fn(other)
    }
}

/// The channel-side sink a [`RemoteCallback`] emits its frames into.
///
/// Implemented by the channel core; held weakly so that proxies retained by
/// user code do not keep a destroyed channel alive.
pub(crate) trait CallbackOutlet: Send + Sync {
    /// Emit a `callback` frame for `id` with the given arguments.
    fn send_callback(&self, id: &str, args: Vec<Value>) -> Result<(), RpcError>;

    /// Emit a `callback-free` frame releasing `id` from the owner's table.
    fn free_callback(&self, id: &str) -> Result<(), RpcError>;
}

/// An invocable proxy for a function the peer passed as an argument.
///
/// Handlers receive these inside their rehydrated arguments.  Invoking one
/// enqueues a `callback` frame; it does not wait for the peer to run the
/// function.
#[derive(Clone)]
pub struct RemoteCallback {
    /// The peer-assigned callback id.
    id: String,
    /// The channel to emit invocations through.
    outlet: Weak<dyn CallbackOutlet>,
}

impl RemoteCallback {
    /// Construct a proxy bound to the given channel outlet.
    pub(crate) fn new(id: String, outlet: Weak<dyn CallbackOutlet>) -> Self {
        RemoteCallback { id, outlet }
    }

    /// The callback id this proxy refers to.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Invoke the remote function with the given arguments.
    ///
    /// Returns as soon as the frame is queued.  Fails only if the channel
    /// has been destroyed or an argument could not be encoded.
    pub fn invoke(&self, args: Vec<Value>) -> Result<(), RpcError> {
        let outlet = self.outlet.upgrade().ok_or(RpcError::ChannelClosed)?;
        outlet.send_callback(&self.id, args)
    }

    /// Release the callback on the owning side.
    ///
    /// After the peer processes the `callback-free` frame this emits, any
    /// further invocation of the same id is logged there and ignored.
    pub fn free(&self) -> Result<(), RpcError> {
        let outlet = self.outlet.upgrade().ok_or(RpcError::ChannelClosed)?;
        outlet.free_callback(&self.id)
    }
}

impl std::fmt::Debug for RemoteCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RemoteCallback").field(&self.id).finish()
    }
}

impl PartialEq for RemoteCallback {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// Build the placeholder string for a callback id.
pub(crate) fn placeholder(id: &str) -> String {
    format!("{CALLBACK_PLACEHOLDER_PREFIX}{id}")
}

/// Replace callback placeholders in a decoded tree with live proxies.
///
/// Only placeholders whose id appears in the message's `callbackIds` list
/// are rehydrated; any other string is user data and passes through.
pub(crate) fn rehydrate(
    value: Value,
    ids: &[String],
    outlet: &Weak<dyn CallbackOutlet>,
) -> Value {
    match value {
        Value::String(s) => {
            if let Some(id) = s.strip_prefix(CALLBACK_PLACEHOLDER_PREFIX) {
                if ids.iter().any(|known| known == id) {
                    return Value::RemoteCallback(RemoteCallback::new(
                        id.to_owned(),
                        Weak::clone(outlet),
                    ));
                }
            }
            Value::String(s)
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| rehydrate(v, ids, outlet))
                .collect(),
        ),
        Value::Object(entries) => Value::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k, rehydrate(v, ids, outlet)))
                .collect(),
        ),
        other => other,
    }
}
