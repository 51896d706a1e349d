//! Zero-copy transfer of owned resources.
//!
//! A caller marks a subtree for transfer by wrapping it in a [`Transfer`]
//! together with the handles (byte buffers, or handler-defined resources)
//! that should move rather than copy.  During encode the subtree is replaced
//! in the argument tree by a slot placeholder `"__kkrpc_transfer_<i>"`; the
//! slot descriptor carries the subtree (with each moved buffer replaced by
//! a handle placeholder) and the handles travel out-of-band on the IO
//! layer's structured path.
//!
//! Slot descriptors align 1:1 with transferred values.  One slot may
//! consume several handles (a value containing two buffers is one slot with
//! two handles), so the frame's handle array may be longer than its slot
//! array.  On decode, every slot is consumed exactly once; a repeated or
//! out-of-range slot index is a protocol violation.
//!
//! Custom resource kinds are supported through [`TransferHandler`]s held in
//! a [`TransferRegistry`] owned by the channel.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::callback::{self, CallbackArg};
use crate::err::{ProtocolViolation, RpcError};
use crate::value::Value;

/// Prefix of the in-tree placeholder that stands for a transfer slot.
pub(crate) const TRANSFER_PLACEHOLDER_PREFIX: &str = "__kkrpc_transfer_";

/// Prefix of the in-slot placeholder that stands for one of the slot's
/// handles.
pub(crate) const HANDLE_PLACEHOLDER_PREFIX: &str = "__kkrpc_handle_";

/// A subtree marked for transfer, together with its owned handles.
///
/// Constructing a `Transfer` takes ownership of the handles: after the
/// value is sent on a transfer-capable transport, the backing resources
/// have moved to the peer.  On transports without transfer capability the
/// subtree is sent inline instead (buffers are copied).
#[derive(Clone, Debug, PartialEq)]
#[allow(clippy::exhaustive_structs)]
pub struct Transfer {
    /// The value to deliver to the peer.
    pub value: Value,
    /// The owned resources inside `value` that should move, not copy.
    pub handles: Vec<TransferHandle>,
}

impl Transfer {
    /// Mark `value` for transfer with the given handles.
    pub fn new(value: Value, handles: Vec<TransferHandle>) -> Self {
        Transfer { value, handles }
    }

    /// Mark a single byte buffer for transfer.
    pub fn bytes(buf: Bytes) -> Self {
        Transfer {
            value: Value::Bytes(buf.clone()),
            handles: vec![TransferHandle::Bytes(buf)],
        }
    }
}

impl From<Transfer> for Value {
    fn from(t: Transfer) -> Value {
        Value::Transfer(Box::new(t))
    }
}

/// An owned resource accompanying a frame on the structured IO path.
#[derive(Clone)]
#[non_exhaustive]
pub enum TransferHandle {
    /// A byte buffer, moved without copying its backing storage.
    Bytes(Bytes),
    /// A handler-defined resource; only meaningful to the
    /// [`TransferHandler`] whose slot carries it.
    Custom(Arc<dyn Any + Send + Sync>),
}

impl std::fmt::Debug for TransferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferHandle::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            TransferHandle::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl PartialEq for TransferHandle {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TransferHandle::Bytes(a), TransferHandle::Bytes(b)) => a == b,
            (TransferHandle::Custom(a), TransferHandle::Custom(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// A codec extension for transferring values the built-in walk does not
/// understand.
///
/// Handlers are registered per-channel in a [`TransferRegistry`]; there is
/// no process-wide registry.  A handler's `serialize` turns an accepted
/// value into a substitute tree plus handles; `deserialize` rebuilds the
/// value on the receiving side from the substitute (with any byte-buffer
/// placeholders already spliced back in) and the slot's handles.
pub trait TransferHandler: Send + Sync {
    /// The name this handler's slots carry on the wire.
    fn name(&self) -> &'static str;

    /// Return true if this handler wants to transfer `value`.
    fn accepts(&self, value: &Value) -> bool;

    /// Split an accepted value into a substitute tree and handles.
    fn serialize(&self, value: Value) -> Result<Transfer, RpcError>;

    /// Rebuild a value from a substitute tree and the slot's handles.
    fn deserialize(
        &self,
        substitute: Value,
        handles: Vec<TransferHandle>,
    ) -> Result<Value, RpcError>;
}

/// The set of transfer handlers owned by a channel.
#[derive(Clone, Default)]
pub struct TransferRegistry {
    /// Registered handlers, probed in registration order.
    handlers: Vec<Arc<dyn TransferHandler>>,
}

impl TransferRegistry {
    /// Return an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler.  Handlers are probed in registration order.
    pub fn register(&mut self, handler: Arc<dyn TransferHandler>) {
        self.handlers.push(handler);
    }

    /// Find the handler registered under `name`, if any.
    fn by_name(&self, name: &str) -> Option<&Arc<dyn TransferHandler>> {
        self.handlers.iter().find(|h| h.name() == name)
    }

    /// Find the first handler that accepts `value`, if any.
    fn matching(&self, value: &Value) -> Option<&Arc<dyn TransferHandler>> {
        self.handlers.iter().find(|h| h.accepts(value))
    }
}

impl std::fmt::Debug for TransferRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferRegistry")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// What kind of reconstruction a slot calls for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum SlotKind {
    /// The slot's value is the transferred value itself.
    Raw,
    /// The slot's value is a substitute to pass to the named handler.
    Handler(String),
}

/// One wire slot descriptor: how to rebuild one transferred value.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct TransferSlot {
    /// How to reconstruct the value.
    pub(crate) kind: SlotKind,
    /// The transferred subtree (raw) or handler substitute, with moved
    /// buffers replaced by handle placeholders.
    pub(crate) value: Value,
    /// How many handles of the frame's handle array this slot consumes.
    pub(crate) handles: usize,
}

impl TransferSlot {
    /// Encode this slot as a payload tree.
    pub(crate) fn to_value(&self) -> Value {
        let mut obj = BTreeMap::new();
        match &self.kind {
            SlotKind::Raw => {
                obj.insert("kind".to_owned(), Value::String("raw".to_owned()));
            }
            SlotKind::Handler(name) => {
                obj.insert("kind".to_owned(), Value::String("handler".to_owned()));
                obj.insert("handlerName".to_owned(), Value::String(name.clone()));
            }
        }
        obj.insert("value".to_owned(), self.value.clone());
        obj.insert("handles".to_owned(), Value::Int(self.handles as i64));
        Value::Object(obj)
    }

    /// Decode a slot from a payload tree.
    pub(crate) fn from_value(value: &Value) -> Result<TransferSlot, ProtocolViolation> {
        let bad = |field: &'static str| ProtocolViolation::BadField {
            msg_type: "transferSlots",
            field,
        };
        let obj = value.as_object().ok_or_else(|| bad("slot"))?;
        let kind = match obj.get("kind").and_then(Value::as_str) {
            Some("raw") => SlotKind::Raw,
            Some("handler") => {
                let name = obj
                    .get("handlerName")
                    .and_then(Value::as_str)
                    .ok_or_else(|| bad("handlerName"))?;
                SlotKind::Handler(name.to_owned())
            }
            _ => return Err(bad("kind")),
        };
        let slot_value = obj.get("value").cloned().ok_or_else(|| bad("value"))?;
        let handles = match obj.get("handles") {
            Some(Value::Int(n)) if *n >= 0 => *n as usize,
            _ => return Err(bad("handles")),
        };
        Ok(TransferSlot {
            kind,
            value: slot_value,
            handles,
        })
    }
}

/// Everything pulled out of an outbound payload tree by [`extract`].
pub(crate) struct Extraction {
    /// The tree with live values replaced by placeholders.
    pub(crate) value: Value,
    /// Slot descriptors, aligned 1:1 with transferred values.
    pub(crate) slots: Vec<TransferSlot>,
    /// The handles accompanying the frame, spanned by the slots in order.
    pub(crate) handles: Vec<TransferHandle>,
    /// Callback ids, in walk order, for the message's `callbackIds` field.
    pub(crate) callback_ids: Vec<String>,
    /// The callbacks to register in the local table, keyed by their ids.
    pub(crate) callbacks: Vec<(String, CallbackArg)>,
}

/// Walk an outbound payload tree, extracting callbacks and transfers.
///
/// With `allow_transfers` unset (the transport cannot move handles),
/// transfer-marked subtrees are sent inline instead and no slots are
/// produced.  Callback extraction happens either way.
pub(crate) fn extract(
    value: Value,
    registry: &TransferRegistry,
    allow_transfers: bool,
    mint_callback_id: &mut dyn FnMut() -> String,
) -> Result<Extraction, RpcError> {
    let mut walk = Walk {
        registry,
        allow_transfers,
        mint_callback_id,
        slots: Vec::new(),
        handles: Vec::new(),
        callback_ids: Vec::new(),
        callbacks: Vec::new(),
    };
    let value = walk.walk(value)?;
    Ok(Extraction {
        value,
        slots: walk.slots,
        handles: walk.handles,
        callback_ids: walk.callback_ids,
        callbacks: walk.callbacks,
    })
}

/// Working state for one [`extract`] pass.
struct Walk<'a> {
    /// The channel's transfer handlers.
    registry: &'a TransferRegistry,
    /// Whether the transport can carry handles out-of-band.
    allow_transfers: bool,
    /// Source of fresh callback ids.
    mint_callback_id: &'a mut dyn FnMut() -> String,
    /// Accumulated slot descriptors.
    slots: Vec<TransferSlot>,
    /// Accumulated handles.
    handles: Vec<TransferHandle>,
    /// Accumulated callback ids, in walk order.
    callback_ids: Vec<String>,
    /// Accumulated callbacks to register.
    callbacks: Vec<(String, CallbackArg)>,
}

impl Walk<'_> {
    /// Process one node.
    fn walk(&mut self, value: Value) -> Result<Value, RpcError> {
        match value {
            Value::Callback(cb) => {
                let id = (self.mint_callback_id)();
                let ph = callback::placeholder(&id);
                self.callback_ids.push(id.clone());
                self.callbacks.push((id, cb));
                Ok(Value::String(ph))
            }
            Value::RemoteCallback(_) => Err(RpcError::Protocol(ProtocolViolation::Unsendable(
                "remote callback",
            ))),
            Value::Transfer(t) => {
                if self.allow_transfers {
                    let Transfer { value, handles } = *t;
                    self.push_slot(SlotKind::Raw, value, handles)
                } else {
                    // No transfer capability: deliver the subtree inline.
                    // The handles are duplicates of buffers inside the tree,
                    // so dropping them here just means the bytes get copied.
                    self.walk_inline(t.value)
                }
            }
            other => {
                if self.allow_transfers {
                    if let Some(handler) = self.registry.matching(&other) {
                        let handler = Arc::clone(handler);
                        let Transfer { value, handles } = handler.serialize(other)?;
                        return self.push_slot(
                            SlotKind::Handler(handler.name().to_owned()),
                            value,
                            handles,
                        );
                    }
                }
                self.walk_structure(other)
            }
        }
    }

    /// Recurse into aggregates; leave leaves alone.
    fn walk_structure(&mut self, value: Value) -> Result<Value, RpcError> {
        match value {
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.walk(item)?);
                }
                Ok(Value::Array(out))
            }
            Value::Object(entries) => {
                let mut out = BTreeMap::new();
                for (k, v) in entries {
                    out.insert(k, self.walk(v)?);
                }
                Ok(Value::Object(out))
            }
            leaf => Ok(leaf),
        }
    }

    /// Process a degraded transfer subtree: callbacks inside it are still
    /// extracted, but nested transfer marks are flattened away.
    fn walk_inline(&mut self, value: Value) -> Result<Value, RpcError> {
        match value {
            Value::Transfer(t) => self.walk_inline(t.value),
            other => self.walk(other),
        }
    }

    /// Record one slot: substitute the slot's own handles into its subtree,
    /// append the handles to the frame, and return the slot placeholder.
    fn push_slot(
        &mut self,
        kind: SlotKind,
        value: Value,
        handles: Vec<TransferHandle>,
    ) -> Result<Value, RpcError> {
        let value = substitute_handles(value, &handles)?;
        let index = self.slots.len();
        self.slots.push(TransferSlot {
            kind,
            value,
            handles: handles.len(),
        });
        self.handles.extend(handles);
        Ok(Value::String(format!("{TRANSFER_PLACEHOLDER_PREFIX}{index}")))
    }
}

/// Identity of a byte buffer: backing pointer plus length.
fn bytes_ident(b: &Bytes) -> (usize, usize) {
    (b.as_ptr() as usize, b.len())
}

/// Replace the first in-tree occurrence of each byte-buffer handle with a
/// handle placeholder (indices local to the slot).
///
/// Buffers that are not handles stay inline and serialize by value.  Live
/// values may not appear inside a transfer subtree.
fn substitute_handles(
    value: Value,
    handles: &[TransferHandle],
) -> Result<Value, RpcError> {
    let mut pending: Vec<Option<(usize, usize)>> = handles
        .iter()
        .map(|h| match h {
            TransferHandle::Bytes(b) => Some(bytes_ident(b)),
            TransferHandle::Custom(_) => None,
        })
        .collect();
    substitute_inner(value, &mut pending)
}

/// Recursive worker for [`substitute_handles`].
fn substitute_inner(
    value: Value,
    pending: &mut Vec<Option<(usize, usize)>>,
) -> Result<Value, RpcError> {
    match value {
        Value::Bytes(b) => {
            let ident = bytes_ident(&b);
            for (k, slot) in pending.iter_mut().enumerate() {
                if *slot == Some(ident) {
                    *slot = None;
                    return Ok(Value::String(format!("{HANDLE_PLACEHOLDER_PREFIX}{k}")));
                }
            }
            Ok(Value::Bytes(b))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(substitute_inner(item, pending)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(entries) => {
            let mut out = BTreeMap::new();
            for (k, v) in entries {
                out.insert(k, substitute_inner(v, pending)?);
            }
            Ok(Value::Object(out))
        }
        live @ (Value::Callback(_) | Value::RemoteCallback(_) | Value::Transfer(_)) => Err(
            RpcError::Protocol(ProtocolViolation::Unsendable(live.type_name())),
        ),
        leaf => Ok(leaf),
    }
}

/// Rebuild an inbound payload tree: reconstruct every slot from its span of
/// the frame's handles, then splice each reconstruction into the tree where
/// its placeholder appears.
pub(crate) fn restore(
    value: Value,
    slots: &[TransferSlot],
    handles: Vec<TransferHandle>,
    registry: &TransferRegistry,
) -> Result<Value, RpcError> {
    // Reconstruct each slot's value from its sequential span of handles.
    let mut resolved: Vec<Option<Value>> = Vec::with_capacity(slots.len());
    let mut cursor = 0usize;
    for slot in slots {
        let end = cursor + slot.handles;
        if end > handles.len() {
            return Err(RpcError::Protocol(ProtocolViolation::BadField {
                msg_type: "transferSlots",
                field: "handles",
            }));
        }
        let span = &handles[cursor..end];
        cursor = end;
        let spliced = splice_handles(slot.value.clone(), span)?;
        let rebuilt = match &slot.kind {
            SlotKind::Raw => spliced,
            SlotKind::Handler(name) => {
                let handler = registry.by_name(name).ok_or_else(|| {
                    RpcError::Protocol(ProtocolViolation::UnknownTransferHandler(name.clone()))
                })?;
                handler.deserialize(spliced, span.to_vec())?
            }
        };
        resolved.push(Some(rebuilt));
    }
    restore_inner(value, &mut resolved)
}

/// Replace handle placeholders in a slot subtree with the span's buffers.
fn splice_handles(value: Value, span: &[TransferHandle]) -> Result<Value, RpcError> {
    match value {
        Value::String(s) => {
            if let Some(rest) = s.strip_prefix(HANDLE_PLACEHOLDER_PREFIX) {
                if let Ok(k) = rest.parse::<usize>() {
                    let handle = span.get(k).ok_or(RpcError::Protocol(
                        ProtocolViolation::HandleIndexOutOfRange(k),
                    ))?;
                    return match handle {
                        TransferHandle::Bytes(b) => Ok(Value::Bytes(b.clone())),
                        TransferHandle::Custom(_) => {
                            Err(RpcError::Protocol(ProtocolViolation::HandleType))
                        }
                    };
                }
            }
            Ok(Value::String(s))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(splice_handles(item, span)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(entries) => {
            let mut out = BTreeMap::new();
            for (k, v) in entries {
                out.insert(k, splice_handles(v, span)?);
            }
            Ok(Value::Object(out))
        }
        leaf => Ok(leaf),
    }
}

/// Replace slot placeholders in the payload tree, consuming each slot
/// exactly once.
fn restore_inner(
    value: Value,
    resolved: &mut Vec<Option<Value>>,
) -> Result<Value, RpcError> {
    match value {
        Value::String(s) => {
            if let Some(rest) = s.strip_prefix(TRANSFER_PLACEHOLDER_PREFIX) {
                if let Ok(i) = rest.parse::<usize>() {
                    let slot = resolved.get_mut(i).ok_or(RpcError::Protocol(
                        ProtocolViolation::SlotIndexOutOfRange(i),
                    ))?;
                    return slot
                        .take()
                        .ok_or(RpcError::Protocol(ProtocolViolation::SlotConsumedTwice(i)));
                }
            }
            Ok(Value::String(s))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(restore_inner(item, resolved)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(entries) => {
            let mut out = BTreeMap::new();
            for (k, v) in entries {
                out.insert(k, restore_inner(v, resolved)?);
            }
            Ok(Value::Object(out))
        }
        leaf => Ok(leaf),
    }
}
