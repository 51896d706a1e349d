//! Error types used throughout the kkrpc channel.
//!
//! There are three layers here:
//!
//! - [`RpcError`] is what callers of a channel observe: every failed call,
//!   property access, construction, or stream resolves to one of its
//!   variants.
//! - [`ErrorRecord`] is the wire form of an error: a name, a message, an
//!   optional stack and cause chain, and any custom properties the original
//!   error carried.  Records round-trip through either serialization format.
//! - [`ConnectionError`] describes a failure that takes down the whole
//!   channel driver, as opposed to a single request.

use std::collections::BTreeMap;
use std::io::Error as IoError;
use std::sync::Arc;
use std::time::Duration;

use crate::value::Value;

/// An error observed by the caller of a channel operation.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RpcError {
    /// The dotted path did not resolve to anything suitable on the peer's
    /// expose tree.
    #[error("no method or property at {method:?}")]
    MethodNotFound {
        /// The path that failed to resolve.
        method: String,
    },

    /// A per-method schema rejected the input arguments or the output value.
    #[error("{phase} validation failed for {method:?}")]
    Validation {
        /// Which side of the handler the failure occurred on.
        phase: ValidationPhase,
        /// The method whose schema rejected the value.
        method: String,
        /// The individual problems the validator reported.
        issues: Vec<Issue>,
    },

    /// A pending request aged out before the peer responded.
    #[error("request {method:?} timed out after {timeout:?}")]
    Timeout {
        /// The method (or dotted property path) that was pending.
        method: String,
        /// The configured timeout that elapsed.
        timeout: Duration,
    },

    /// The channel was destroyed, either explicitly or because its
    /// transport failed.
    #[error("channel destroyed")]
    ChannelClosed,

    /// The peer's handler failed; the record preserves whatever the remote
    /// error carried.
    #[error("peer reported an error: {0}")]
    Remote(ErrorRecord),

    /// The peer (or a local misuse of the API) violated the wire protocol.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),
}

/// Which side of a handler invocation a validation failure occurred on.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[allow(clippy::exhaustive_enums)]
pub enum ValidationPhase {
    /// The positional argument tuple was rejected before the handler ran.
    Input,
    /// The handler's result (or one stream chunk) was rejected.
    Output,
}

impl ValidationPhase {
    /// Return the wire spelling of this phase.
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationPhase::Input => "input",
            ValidationPhase::Output => "output",
        }
    }

    /// Parse a wire spelling back into a phase.
    fn from_name(s: &str) -> Option<Self> {
        match s {
            "input" => Some(ValidationPhase::Input),
            "output" => Some(ValidationPhase::Output),
            _ => None,
        }
    }
}

impl std::fmt::Display for ValidationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single problem reported by a validator.
#[derive(Clone, Debug, Eq, PartialEq)]
#[allow(clippy::exhaustive_structs)]
pub struct Issue {
    /// Where in the validated value the problem is, as a dotted path.
    /// Empty when the problem applies to the value as a whole.
    pub path: String,
    /// A human-readable description of the problem.
    pub message: String,
}

impl std::fmt::Display for Issue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "at {}: {}", self.path, self.message)
        }
    }
}

/// The wire representation of an error value.
///
/// Deserialized back into a live error on the caller's side, preserving
/// `name`, `message`, `stack`, the recursive `cause` chain, and every
/// custom property.
#[derive(Clone, Debug, PartialEq)]
#[allow(clippy::exhaustive_structs)]
pub struct ErrorRecord {
    /// The error's name (its type, loosely).
    pub name: String,
    /// The error's message.
    pub message: String,
    /// A stack trace, if the originating side had one.
    pub stack: Option<String>,
    /// The error that caused this one, if any.
    pub cause: Option<Box<ErrorRecord>>,
    /// Any additional enumerable properties the error carried.
    pub extra: BTreeMap<String, Value>,
}

/// Keys of [`ErrorRecord`] that custom properties may not shadow.
const RESERVED_RECORD_KEYS: &[&str] = &["name", "message", "stack", "cause"];

impl ErrorRecord {
    /// Construct a record with just a name and a message.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        ErrorRecord {
            name: name.into(),
            message: message.into(),
            stack: None,
            cause: None,
            extra: BTreeMap::new(),
        }
    }

    /// Encode this record as a payload tree.
    pub(crate) fn to_value(&self) -> Value {
        let mut obj = BTreeMap::new();
        obj.insert("name".to_owned(), Value::String(self.name.clone()));
        obj.insert("message".to_owned(), Value::String(self.message.clone()));
        if let Some(stack) = &self.stack {
            obj.insert("stack".to_owned(), Value::String(stack.clone()));
        }
        if let Some(cause) = &self.cause {
            obj.insert("cause".to_owned(), cause.to_value());
        }
        for (k, v) in &self.extra {
            if !RESERVED_RECORD_KEYS.contains(&k.as_str()) {
                obj.insert(k.clone(), v.clone());
            }
        }
        Value::Object(obj)
    }

    /// Decode a record from a payload tree.
    ///
    /// Decoding is lenient: a missing name or message becomes an empty
    /// placeholder rather than a protocol error, since error paths should
    /// degrade rather than fail.
    pub(crate) fn from_value(value: &Value) -> ErrorRecord {
        let Value::Object(obj) = value else {
            return ErrorRecord::new("Error", "malformed error record");
        };
        let name = match obj.get("name") {
            Some(Value::String(s)) => s.clone(),
            _ => "Error".to_owned(),
        };
        let message = match obj.get("message") {
            Some(Value::String(s)) => s.clone(),
            _ => String::new(),
        };
        let stack = match obj.get("stack") {
            Some(Value::String(s)) => Some(s.clone()),
            _ => None,
        };
        let cause = obj
            .get("cause")
            .map(|c| Box::new(ErrorRecord::from_value(c)));
        let extra = obj
            .iter()
            .filter(|(k, _)| !RESERVED_RECORD_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        ErrorRecord {
            name,
            message,
            stack,
            cause,
            extra,
        }
    }

    /// Turn this record back into the typed error the caller should see.
    ///
    /// Records whose names match the channel's own taxonomy decode into the
    /// corresponding [`RpcError`] variant; anything else is a
    /// [`RpcError::Remote`].
    pub(crate) fn into_rpc_error(self) -> RpcError {
        match self.name.as_str() {
            "MethodNotFound" => match self.extra.get("method") {
                Some(Value::String(method)) => RpcError::MethodNotFound {
                    method: method.clone(),
                },
                _ => RpcError::Remote(self),
            },
            "RPCValidationError" => match self.decode_validation() {
                Some(err) => err,
                None => RpcError::Remote(self),
            },
            "RPCTimeoutError" => match (self.extra.get("method"), self.extra.get("timeoutMs")) {
                (Some(Value::String(method)), Some(Value::Int(ms))) if *ms >= 0 => {
                    RpcError::Timeout {
                        method: method.clone(),
                        timeout: Duration::from_millis(*ms as u64),
                    }
                }
                _ => RpcError::Remote(self),
            },
            "RPCDestroyed" => RpcError::ChannelClosed,
            _ => RpcError::Remote(self),
        }
    }

    /// Helper for [`into_rpc_error`](Self::into_rpc_error): decode the
    /// structured fields of a validation error, if they are all present.
    fn decode_validation(&self) -> Option<RpcError> {
        let Some(Value::String(phase)) = self.extra.get("phase") else {
            return None;
        };
        let phase = ValidationPhase::from_name(phase)?;
        let Some(Value::String(method)) = self.extra.get("method") else {
            return None;
        };
        let Some(Value::Array(raw)) = self.extra.get("issues") else {
            return None;
        };
        let mut issues = Vec::with_capacity(raw.len());
        for item in raw {
            let Value::Object(obj) = item else {
                return None;
            };
            let path = match obj.get("path") {
                Some(Value::String(s)) => s.clone(),
                _ => String::new(),
            };
            let message = match obj.get("message") {
                Some(Value::String(s)) => s.clone(),
                _ => String::new(),
            };
            issues.push(Issue { path, message });
        }
        Some(RpcError::Validation {
            phase,
            method: method.clone(),
            issues,
        })
    }
}

impl std::fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for ErrorRecord {}

impl RpcError {
    /// Encode this error as the record its response will carry.
    pub(crate) fn to_record(&self) -> ErrorRecord {
        match self {
            RpcError::MethodNotFound { method } => {
                let mut rec = ErrorRecord::new("MethodNotFound", self.to_string());
                rec.extra
                    .insert("method".to_owned(), Value::String(method.clone()));
                rec
            }
            RpcError::Validation {
                phase,
                method,
                issues,
            } => {
                let mut rec = ErrorRecord::new("RPCValidationError", self.to_string());
                rec.extra
                    .insert("phase".to_owned(), Value::String(phase.as_str().to_owned()));
                rec.extra
                    .insert("method".to_owned(), Value::String(method.clone()));
                let issues = issues
                    .iter()
                    .map(|i| {
                        let mut obj = BTreeMap::new();
                        obj.insert("path".to_owned(), Value::String(i.path.clone()));
                        obj.insert("message".to_owned(), Value::String(i.message.clone()));
                        Value::Object(obj)
                    })
                    .collect();
                rec.extra.insert("issues".to_owned(), Value::Array(issues));
                rec
            }
            RpcError::Timeout { method, timeout } => {
                let mut rec = ErrorRecord::new("RPCTimeoutError", self.to_string());
                rec.extra
                    .insert("method".to_owned(), Value::String(method.clone()));
                rec.extra.insert(
                    "timeoutMs".to_owned(),
                    Value::Int(timeout.as_millis() as i64),
                );
                rec
            }
            RpcError::ChannelClosed => ErrorRecord::new("RPCDestroyed", self.to_string()),
            RpcError::Remote(rec) => rec.clone(),
            RpcError::Protocol(v) => ErrorRecord::new("ProtocolError", v.to_string()),
        }
    }
}

/// A way in which a frame or message failed to conform to the protocol.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProtocolViolation {
    /// The frame was not valid json at all.
    #[error("frame was not valid json")]
    BadJson(#[source] Arc<serde_json::Error>),

    /// The frame decoded as json, but not as a json object.
    #[error("frame was not a json object")]
    NotAnObject,

    /// The message's `type` field named no known message kind.
    #[error("message had an unrecognized `type` field: {0:?}")]
    UnknownType(String),

    /// A required field was absent.
    #[error("{msg_type} message was missing its `{field}` field")]
    MissingField {
        /// The message kind being decoded.
        msg_type: &'static str,
        /// The absent field.
        field: &'static str,
    },

    /// A field was present but had the wrong shape.
    #[error("{msg_type} message had a malformed `{field}` field")]
    BadField {
        /// The message kind being decoded.
        msg_type: &'static str,
        /// The malformed field.
        field: &'static str,
    },

    /// A response carried none of the three legal payload shapes.
    #[error("response carried none of result, error, or stream")]
    BadResponseShape,

    /// A structured (v2) envelope was missing its payload.
    #[error("structured envelope was malformed")]
    BadEnvelope,

    /// A transfer placeholder referenced a slot that does not exist.
    #[error("transfer slot index {0} is out of range")]
    SlotIndexOutOfRange(usize),

    /// Two placeholders in one frame referenced the same slot.
    #[error("transfer slot {0} was consumed more than once")]
    SlotConsumedTwice(usize),

    /// A handle placeholder referenced a handle outside its slot's span.
    #[error("transfer handle index {0} is out of range for its slot")]
    HandleIndexOutOfRange(usize),

    /// A live value (callback, transfer, or remote proxy) survived to
    /// serialization instead of being extracted.
    #[error("a {0} value cannot cross the channel")]
    Unsendable(&'static str),

    /// A handler-kind slot named a handler the receiving registry lacks.
    #[error("no transfer handler is registered under {0:?}")]
    UnknownTransferHandler(String),

    /// A raw slot's handle was not a byte buffer.
    #[error("a raw transfer slot may only carry byte-buffer handles")]
    HandleType,

    /// A unary call received a stream-start response.
    #[error("expected a unary reply but the peer opened a stream")]
    UnexpectedStream,

    /// A streaming call received a plain value response.
    #[error("expected a stream but the peer sent a unary reply")]
    ExpectedStream,

    /// A rich-format meta tag pointed at a node it cannot upgrade.
    #[error("serialization meta tag {tag:?} does not apply at {path:?}")]
    BadMetaTag {
        /// The tag that failed to apply.
        tag: String,
        /// The path the tag pointed at.
        path: String,
    },
}

impl From<serde_json::Error> for ProtocolViolation {
    fn from(e: serde_json::Error) -> Self {
        ProtocolViolation::BadJson(Arc::new(e))
    }
}

/// A failure that takes down a channel driver.
///
/// When the driver exits with one of these, every inflight request, stream,
/// and callback has already been rejected with
/// [`RpcError::ChannelClosed`].
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConnectionError {
    /// Unable to write to the transport.
    #[error("could not write to the transport")]
    WriteFailed(#[source] Arc<IoError>),

    /// Unable to read from the transport.
    #[error("problem reading from the transport")]
    ReadFailed(#[source] Arc<IoError>),

    /// Read something that could not be decoded as a frame.
    #[error("unable to decode an inbound frame")]
    DecodeFailed(#[source] ProtocolViolation),
}

impl ConnectionError {
    /// Return true if this error is (or might be) due to the peer closing
    /// the connection.
    ///
    /// Such errors are tolerated without complaint; the channel treats them
    /// like an orderly close.
    pub fn is_connection_close(&self) -> bool {
        use std::io::ErrorKind as IK;
        match self {
            Self::ReadFailed(e) | Self::WriteFailed(e) => matches!(
                e.kind(),
                IK::UnexpectedEof | IK::ConnectionAborted | IK::BrokenPipe
            ),
            Self::DecodeFailed(ProtocolViolation::BadJson(e)) => {
                e.classify() == serde_json::error::Category::Eof
            }
            Self::DecodeFailed(_) => false,
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::missing_docs_in_private_items)]

    use super::*;

    /// Build a record with a two-deep cause chain and custom properties.
    fn fancy_record() -> ErrorRecord {
        let mut inner = ErrorRecord::new("IoError", "disk on fire");
        inner.stack = Some("at read_sector".to_owned());
        let mut outer = ErrorRecord::new("WrappedError", "could not load index");
        outer.stack = Some("at load_index\nat main".to_owned());
        outer.cause = Some(Box::new(inner));
        outer
            .extra
            .insert("sector".to_owned(), Value::Int(8192));
        outer
            .extra
            .insert("retryable".to_owned(), Value::Bool(false));
        outer
    }

    #[test]
    fn record_round_trip() {
        let rec = fancy_record();
        let decoded = ErrorRecord::from_value(&rec.to_value());
        assert_eq!(decoded, rec);
        // The cause chain survives recursively.
        assert_eq!(decoded.cause.as_ref().unwrap().name, "IoError");
        assert_eq!(
            decoded.cause.as_ref().unwrap().stack.as_deref(),
            Some("at read_sector")
        );
        // Custom properties survive.
        assert_eq!(decoded.extra.get("sector"), Some(&Value::Int(8192)));
    }

    #[test]
    fn reserved_keys_do_not_leak_into_extra() {
        let rec = ErrorRecord::from_value(&fancy_record().to_value());
        for k in RESERVED_RECORD_KEYS {
            assert!(!rec.extra.contains_key(*k));
        }
    }

    #[test]
    fn known_names_decode_into_typed_errors() {
        let e = RpcError::MethodNotFound {
            method: "math.add".to_owned(),
        };
        assert!(matches!(
            e.to_record().into_rpc_error(),
            RpcError::MethodNotFound { method } if method == "math.add"
        ));

        let e = RpcError::Timeout {
            method: "slow".to_owned(),
            timeout: Duration::from_millis(50),
        };
        assert!(matches!(
            e.to_record().into_rpc_error(),
            RpcError::Timeout { method, timeout }
                if method == "slow" && timeout == Duration::from_millis(50)
        ));

        let e = RpcError::Validation {
            phase: ValidationPhase::Input,
            method: "add".to_owned(),
            issues: vec![Issue {
                path: "0".to_owned(),
                message: "expected a number".to_owned(),
            }],
        };
        match e.to_record().into_rpc_error() {
            RpcError::Validation {
                phase,
                method,
                issues,
            } => {
                assert_eq!(phase, ValidationPhase::Input);
                assert_eq!(method, "add");
                assert_eq!(issues.len(), 1);
                assert_eq!(issues[0].path, "0");
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(
            RpcError::ChannelClosed.to_record().into_rpc_error(),
            RpcError::ChannelClosed
        ));
    }

    #[test]
    fn unknown_names_stay_remote() {
        let rec = ErrorRecord::new("SomethingElse", "??");
        assert!(matches!(
            rec.clone().into_rpc_error(),
            RpcError::Remote(r) if r == rec
        ));
    }

    #[test]
    fn connection_close_classification() {
        let eof = ConnectionError::ReadFailed(Arc::new(IoError::new(
            std::io::ErrorKind::UnexpectedEof,
            "eof",
        )));
        assert!(eof.is_connection_close());
        let other = ConnectionError::WriteFailed(Arc::new(IoError::other("boom")));
        assert!(!other.is_connection_close());
    }
}
