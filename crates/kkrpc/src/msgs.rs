//! Message types used in the channel's wire protocol.
//!
//! Every frame decodes to a [`Message`]: a correlation id, a body (one
//! variant per wire `type`), and the optional `callbackIds`,
//! `transferSlots`, and `version` fields.  The tree conversions here sit
//! between the codec's format layer and the channel's routing logic.

use std::collections::BTreeMap;

use crate::codec::WireFormat;
use crate::err::{ErrorRecord, ProtocolViolation};
use crate::transfer::TransferSlot;
use crate::value::Value;

/// An identifier correlating a request with its responses.
///
/// Ids generated by this crate are always strings; integer ids are accepted
/// from peers for interoperability.
#[derive(Debug, Eq, PartialEq, Hash, Clone, derive_more::From)]
#[allow(clippy::exhaustive_enums)]
pub enum RequestId {
    /// A string id.
    //
    // (Box<str> saves a word here; ids are never mutated.)
    Str(Box<str>),
    /// An integer id, as some peers prefer.
    Int(i64),
}

impl RequestId {
    /// Encode this id as a payload node.
    pub(crate) fn to_value(&self) -> Value {
        match self {
            RequestId::Str(s) => Value::String(s.to_string()),
            RequestId::Int(i) => Value::Int(*i),
        }
    }

    /// Decode an id from a payload node.
    pub(crate) fn from_value(v: &Value) -> Result<RequestId, ProtocolViolation> {
        match v {
            Value::String(s) => Ok(RequestId::Str(s.clone().into_boxed_str())),
            Value::Int(i) => Ok(RequestId::Int(*i)),
            _ => Err(ProtocolViolation::BadField {
                msg_type: "message",
                field: "id",
            }),
        }
    }

    /// Return the string form of this id, if it is a string.
    ///
    /// `callback` frames carry a callback id here, and callback ids are
    /// always strings.
    pub(crate) fn as_str(&self) -> Option<&str> {
        match self {
            RequestId::Str(s) => Some(s),
            RequestId::Int(_) => None,
        }
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Str(s) => f.write_str(s),
            RequestId::Int(i) => write!(f, "{i}"),
        }
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::Str(s.into())
    }
}

/// A helper to return channel-unique identifiers.
///
/// All identifiers carry a reserved prefix; peers that avoid the prefix in
/// their own ids cannot collide with ours.
#[derive(Debug)]
pub(crate) struct IdGenerator {
    /// The reserved marker distinguishing this generator's ids.
    prefix: &'static str,
    /// The next counter value.
    next_id: u64,
}

impl IdGenerator {
    /// Return a generator whose ids carry `prefix`.
    pub(crate) fn new(prefix: &'static str) -> Self {
        IdGenerator { prefix, next_id: 0 }
    }

    /// Return a previously unyielded identifier.
    pub(crate) fn next_id(&mut self) -> String {
        let id = self.next_id;
        self.next_id += 1;
        format!("!{}!--{id}", self.prefix)
    }
}

/// A single protocol message.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Message {
    /// The correlation id.  For `callback` frames this is the callback id.
    pub(crate) id: RequestId,
    /// The typed body.
    pub(crate) body: MsgBody,
    /// Ids of callback placeholders embedded in the payload, in walk
    /// order.  For `callback-free` frames, the ids being released.
    pub(crate) callback_ids: Vec<String>,
    /// Transfer slot descriptors, aligned with the frame's handles.
    pub(crate) transfer_slots: Vec<TransferSlot>,
    /// The serialization format the sender used, when declared.
    pub(crate) version: Option<WireFormat>,
}

impl Message {
    /// Construct a message with no callbacks, slots, or version marker.
    pub(crate) fn new(id: RequestId, body: MsgBody) -> Message {
        Message {
            id,
            body,
            callback_ids: Vec::new(),
            transfer_slots: Vec::new(),
            version: None,
        }
    }
}

/// The body of a message, one variant per wire `type`.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum MsgBody {
    /// Invoke the method at a dotted path.
    Request {
        /// The dotted path of the method.
        method: String,
        /// Positional arguments.
        args: Vec<Value>,
    },
    /// The single reply to a `request`, `get`, `set`, or `construct`.
    Response(ResponseBody),
    /// Invoke a callback the peer previously passed to us.  No response is
    /// expected.
    Callback {
        /// Positional arguments.
        args: Vec<Value>,
    },
    /// Release callbacks from the peer's table.  The ids travel in
    /// `callbackIds`.
    CallbackFree,
    /// Read the property at a path.
    Get {
        /// The path segments.
        path: Vec<String>,
    },
    /// Assign the property at a path.
    Set {
        /// The path segments.
        path: Vec<String>,
        /// The value to assign.
        value: Value,
    },
    /// Invoke the constructor at a dotted path.
    Construct {
        /// The dotted path of the constructor.
        method: String,
        /// Positional arguments.
        args: Vec<Value>,
    },
    /// One value produced by an open stream.
    StreamChunk {
        /// The produced value.
        value: Value,
    },
    /// The stream completed normally.  Terminal.
    StreamEnd,
    /// The stream failed.  Terminal.
    StreamError {
        /// The production error.
        error: ErrorRecord,
    },
    /// The consumer stopped iterating; the producer should wind down.
    StreamCancel,
}

impl MsgBody {
    /// The wire spelling of this body's `type` field.
    pub(crate) fn type_str(&self) -> &'static str {
        match self {
            MsgBody::Request { .. } => "request",
            MsgBody::Response(_) => "response",
            MsgBody::Callback { .. } => "callback",
            MsgBody::CallbackFree => "callback-free",
            MsgBody::Get { .. } => "get",
            MsgBody::Set { .. } => "set",
            MsgBody::Construct { .. } => "construct",
            MsgBody::StreamChunk { .. } => "stream-chunk",
            MsgBody::StreamEnd => "stream-end",
            MsgBody::StreamError { .. } => "stream-error",
            MsgBody::StreamCancel => "stream-cancel",
        }
    }
}

/// The three legal payload shapes of a `response`.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ResponseBody {
    /// The request succeeded with a value.
    Success(Value),
    /// The request failed.
    Error(ErrorRecord),
    /// The request succeeded and a stream of chunks follows on this id.
    StreamStart,
}

impl Message {
    /// Encode this message as a payload tree.
    pub(crate) fn to_tree(&self) -> Value {
        let mut obj = BTreeMap::new();
        obj.insert("id".to_owned(), self.id.to_value());
        obj.insert(
            "type".to_owned(),
            Value::String(self.body.type_str().to_owned()),
        );
        match &self.body {
            MsgBody::Request { method, args } | MsgBody::Construct { method, args } => {
                obj.insert("method".to_owned(), Value::String(method.clone()));
                obj.insert("args".to_owned(), Value::Array(args.clone()));
            }
            MsgBody::Response(body) => {
                let mut args = BTreeMap::new();
                match body {
                    ResponseBody::Success(v) => {
                        args.insert("result".to_owned(), v.clone());
                    }
                    ResponseBody::Error(rec) => {
                        args.insert("error".to_owned(), rec.to_value());
                    }
                    ResponseBody::StreamStart => {
                        args.insert("result".to_owned(), Value::Null);
                        args.insert("stream".to_owned(), Value::Bool(true));
                    }
                }
                obj.insert("args".to_owned(), Value::Object(args));
            }
            MsgBody::Callback { args } => {
                obj.insert("args".to_owned(), Value::Array(args.clone()));
            }
            MsgBody::CallbackFree => {}
            MsgBody::Get { path } => {
                obj.insert("path".to_owned(), path_to_value(path));
            }
            MsgBody::Set { path, value } => {
                obj.insert("path".to_owned(), path_to_value(path));
                obj.insert("value".to_owned(), value.clone());
            }
            MsgBody::StreamChunk { value } => {
                obj.insert(
                    "args".to_owned(),
                    Value::object([("value", value.clone())]),
                );
            }
            MsgBody::StreamEnd | MsgBody::StreamCancel => {
                obj.insert("args".to_owned(), Value::Object(BTreeMap::new()));
            }
            MsgBody::StreamError { error } => {
                obj.insert(
                    "args".to_owned(),
                    Value::object([("error", error.to_value())]),
                );
            }
        }
        if !self.callback_ids.is_empty() {
            obj.insert(
                "callbackIds".to_owned(),
                Value::Array(
                    self.callback_ids
                        .iter()
                        .map(|s| Value::String(s.clone()))
                        .collect(),
                ),
            );
        }
        if !self.transfer_slots.is_empty() {
            obj.insert(
                "transferSlots".to_owned(),
                Value::Array(self.transfer_slots.iter().map(TransferSlot::to_value).collect()),
            );
        }
        if let Some(version) = self.version {
            obj.insert(
                "version".to_owned(),
                Value::String(version.as_str().to_owned()),
            );
        }
        Value::Object(obj)
    }

    /// Decode a message from a payload tree.
    pub(crate) fn from_tree(tree: Value) -> Result<Message, ProtocolViolation> {
        let Value::Object(mut obj) = tree else {
            return Err(ProtocolViolation::NotAnObject);
        };
        let missing = |msg_type: &'static str, field: &'static str| {
            ProtocolViolation::MissingField { msg_type, field }
        };
        let bad = |msg_type: &'static str, field: &'static str| {
            ProtocolViolation::BadField { msg_type, field }
        };

        let type_str = match obj.get("type") {
            Some(Value::String(s)) => s.clone(),
            Some(_) => return Err(bad("message", "type")),
            None => return Err(missing("message", "type")),
        };
        let id = RequestId::from_value(
            obj.get("id").ok_or_else(|| missing("message", "id"))?,
        )?;

        let body = match type_str.as_str() {
            "request" | "construct" => {
                let method = match obj.remove("method") {
                    Some(Value::String(s)) => s,
                    Some(_) => return Err(bad(leak_type(&type_str), "method")),
                    None => return Err(missing(leak_type(&type_str), "method")),
                };
                let args = take_arg_list(&mut obj, leak_type(&type_str))?;
                if type_str == "request" {
                    MsgBody::Request { method, args }
                } else {
                    MsgBody::Construct { method, args }
                }
            }
            "response" => {
                let Some(Value::Object(mut args)) = obj.remove("args") else {
                    return Err(bad("response", "args"));
                };
                if let Some(error) = args.remove("error") {
                    MsgBody::Response(ResponseBody::Error(ErrorRecord::from_value(&error)))
                } else if args.get("stream") == Some(&Value::Bool(true)) {
                    MsgBody::Response(ResponseBody::StreamStart)
                } else if let Some(result) = args.remove("result") {
                    MsgBody::Response(ResponseBody::Success(result))
                } else {
                    return Err(ProtocolViolation::BadResponseShape);
                }
            }
            "callback" => MsgBody::Callback {
                args: take_arg_list(&mut obj, "callback")?,
            },
            "callback-free" => MsgBody::CallbackFree,
            "get" => MsgBody::Get {
                path: take_path(&mut obj, "get")?,
            },
            "set" => {
                let path = take_path(&mut obj, "set")?;
                let value = obj.remove("value").ok_or_else(|| missing("set", "value"))?;
                MsgBody::Set { path, value }
            }
            "stream-chunk" => {
                let Some(Value::Object(mut args)) = obj.remove("args") else {
                    return Err(bad("stream-chunk", "args"));
                };
                let value = args
                    .remove("value")
                    .ok_or_else(|| missing("stream-chunk", "value"))?;
                MsgBody::StreamChunk { value }
            }
            "stream-end" => MsgBody::StreamEnd,
            "stream-error" => {
                let Some(Value::Object(mut args)) = obj.remove("args") else {
                    return Err(bad("stream-error", "args"));
                };
                let error = args
                    .remove("error")
                    .ok_or_else(|| missing("stream-error", "error"))?;
                MsgBody::StreamError {
                    error: ErrorRecord::from_value(&error),
                }
            }
            "stream-cancel" => MsgBody::StreamCancel,
            other => return Err(ProtocolViolation::UnknownType(other.to_owned())),
        };

        let callback_ids = match obj.remove("callbackIds") {
            None => Vec::new(),
            Some(Value::Array(items)) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::String(s) => out.push(s),
                        _ => return Err(bad("message", "callbackIds")),
                    }
                }
                out
            }
            Some(_) => return Err(bad("message", "callbackIds")),
        };
        let transfer_slots = match obj.remove("transferSlots") {
            None => Vec::new(),
            Some(Value::Array(items)) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(TransferSlot::from_value(&item)?);
                }
                out
            }
            Some(_) => return Err(bad("message", "transferSlots")),
        };
        let version = match obj.get("version") {
            Some(Value::String(s)) => WireFormat::from_name(s),
            _ => None,
        };

        Ok(Message {
            id,
            body,
            callback_ids,
            transfer_slots,
            version,
        })
    }
}

/// Encode a path as an array of segment strings.
fn path_to_value(path: &[String]) -> Value {
    Value::Array(path.iter().map(|s| Value::String(s.clone())).collect())
}

/// Remove and decode a positional argument list.
fn take_arg_list(
    obj: &mut BTreeMap<String, Value>,
    msg_type: &'static str,
) -> Result<Vec<Value>, ProtocolViolation> {
    match obj.remove("args") {
        Some(Value::Array(args)) => Ok(args),
        Some(_) => Err(ProtocolViolation::BadField {
            msg_type,
            field: "args",
        }),
        None => Err(ProtocolViolation::MissingField {
            msg_type,
            field: "args",
        }),
    }
}

/// Remove and decode a property path.
fn take_path(
    obj: &mut BTreeMap<String, Value>,
    msg_type: &'static str,
) -> Result<Vec<String>, ProtocolViolation> {
    match obj.remove("path") {
        Some(Value::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => out.push(s),
                    _ => {
                        return Err(ProtocolViolation::BadField {
                            msg_type,
                            field: "path",
                        });
                    }
                }
            }
            Ok(out)
        }
        Some(_) => Err(ProtocolViolation::BadField {
            msg_type,
            field: "path",
        }),
        None => Err(ProtocolViolation::MissingField {
            msg_type,
            field: "path",
        }),
    }
}

/// Map a decoded type string to its static spelling for error reporting.
fn leak_type(s: &str) -> &'static str {
    match s {
        "request" => "request",
        "construct" => "construct",
        _ => "message",
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::missing_docs_in_private_items)]

    use super::*;
    use assert_matches::assert_matches;

    /// Round-trip a message through its tree form.
    fn round_trip(msg: Message) {
        let decoded = Message::from_tree(msg.to_tree()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn round_trips() {
        round_trip(Message::new(
            "r1".into(),
            MsgBody::Request {
                method: "math.grade1.add".to_owned(),
                args: vec![Value::Int(2), Value::Int(3)],
            },
        ));
        round_trip(Message::new(
            RequestId::Int(7),
            MsgBody::Response(ResponseBody::Success(Value::from("ok"))),
        ));
        round_trip(Message::new(
            "r2".into(),
            MsgBody::Response(ResponseBody::Error(ErrorRecord::new("Oops", "broke"))),
        ));
        round_trip(Message::new(
            "r3".into(),
            MsgBody::Response(ResponseBody::StreamStart),
        ));
        round_trip(Message::new(
            "r4".into(),
            MsgBody::Get {
                path: vec!["config".to_owned(), "name".to_owned()],
            },
        ));
        round_trip(Message::new(
            "r5".into(),
            MsgBody::Set {
                path: vec!["config".to_owned(), "name".to_owned()],
                value: Value::from("new"),
            },
        ));
        round_trip(Message::new(
            "r6".into(),
            MsgBody::Construct {
                method: "Thing".to_owned(),
                args: vec![Value::Int(1)],
            },
        ));
        round_trip(Message::new(
            "r7".into(),
            MsgBody::StreamChunk {
                value: Value::Int(3),
            },
        ));
        round_trip(Message::new("r7".into(), MsgBody::StreamEnd));
        round_trip(Message::new(
            "r7".into(),
            MsgBody::StreamError {
                error: ErrorRecord::new("Boom", "mid-stream"),
            },
        ));
        round_trip(Message::new("r7".into(), MsgBody::StreamCancel));
        round_trip(Message::new(
            "cb1".into(),
            MsgBody::Callback {
                args: vec![Value::Int(5)],
            },
        ));
        let mut free = Message::new("r8".into(), MsgBody::CallbackFree);
        free.callback_ids = vec!["cb1".to_owned(), "cb2".to_owned()];
        round_trip(free);
    }

    #[test]
    fn version_marker_round_trips() {
        let mut msg = Message::new("r1".into(), MsgBody::StreamEnd);
        msg.version = Some(WireFormat::SuperJson);
        round_trip(msg);
    }

    #[test]
    fn invalid_messages() {
        fn parse(tree: Value) -> ProtocolViolation {
            Message::from_tree(tree).unwrap_err()
        }

        // Not an object at all.
        assert_matches!(parse(Value::Int(3)), ProtocolViolation::NotAnObject);
        // Missing type.
        assert_matches!(
            parse(Value::object([("id", Value::from("x"))])),
            ProtocolViolation::MissingField { field: "type", .. }
        );
        // Missing id.
        assert_matches!(
            parse(Value::object([("type", Value::from("stream-end"))])),
            ProtocolViolation::MissingField { field: "id", .. }
        );
        // Bad id type.
        assert_matches!(
            parse(Value::object([
                ("type", Value::from("stream-end")),
                ("id", Value::Bool(true)),
            ])),
            ProtocolViolation::BadField { field: "id", .. }
        );
        // Unknown type string.
        assert_matches!(
            parse(Value::object([
                ("type", Value::from("flupdate")),
                ("id", Value::from("x")),
            ])),
            ProtocolViolation::UnknownType(_)
        );
        // Request without args.
        assert_matches!(
            parse(Value::object([
                ("type", Value::from("request")),
                ("id", Value::from("x")),
                ("method", Value::from("add")),
            ])),
            ProtocolViolation::MissingField { field: "args", .. }
        );
        // Response with none of the three legal shapes.
        assert_matches!(
            parse(Value::object([
                ("type", Value::from("response")),
                ("id", Value::from("x")),
                ("args", Value::object([("stream", Value::Bool(false))])),
            ])),
            ProtocolViolation::BadResponseShape
        );
        // Get with a non-string path segment.
        assert_matches!(
            parse(Value::object([
                ("type", Value::from("get")),
                ("id", Value::from("x")),
                ("path", Value::Array(vec![Value::Int(3)])),
            ])),
            ProtocolViolation::BadField { field: "path", .. }
        );
    }

    #[test]
    fn id_generator_is_sequential() {
        let mut g = IdGenerator::new("req");
        assert_eq!(g.next_id(), "!req!--0");
        assert_eq!(g.next_id(), "!req!--1");
    }
}
