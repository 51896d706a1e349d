//! Encoding and decoding of messages onto IO frames.
//!
//! Two independent axes meet here.  The *format* (`json` or `superjson`)
//! controls how a message tree becomes text: plain json downgrades rich
//! values, while `superjson` wraps the plain tree as `{"json": .., "meta": ..}`
//! so the rich values can be restored.  The *envelope* (v1 string or v2
//! structured) controls how that text reaches the transport: v2 adds an
//! outer `{"version": 2, "payload": .., "encoding": "object"}` wrapper and
//! rides the IO layer's structured path alongside the frame's transferable
//! handles.
//!
//! Receivers accept every combination regardless of their own
//! configuration, detecting the shape of each inbound frame; senders use
//! their configured format, and the v2 envelope only when the frame
//! actually carries handles.

use serde::{Deserialize, Serialize};

use crate::err::ProtocolViolation;
use crate::io::IoFrame;
use crate::msgs::Message;
use crate::transfer::TransferHandle;
use crate::value::{MetaTag, Value};

/// A serialization format for message payloads.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[allow(clippy::exhaustive_enums)]
pub enum WireFormat {
    /// Plain textual json.  Rich values (bytes, dates, big integers)
    /// downgrade to their nearest plain form.
    Json,
    /// The rich format: plain json plus a meta table that restores bytes,
    /// dates, and big integers on decode.
    SuperJson,
}

impl WireFormat {
    /// The wire spelling of this format.
    pub fn as_str(&self) -> &'static str {
        match self {
            WireFormat::Json => "json",
            WireFormat::SuperJson => "superjson",
        }
    }

    /// Parse a wire spelling.
    pub(crate) fn from_name(s: &str) -> Option<WireFormat> {
        match s {
            "json" => Some(WireFormat::Json),
            "superjson" => Some(WireFormat::SuperJson),
            _ => None,
        }
    }
}

impl Default for WireFormat {
    fn default() -> Self {
        WireFormat::SuperJson
    }
}

/// The v2 structured envelope.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    /// The envelope revision; always 2.
    version: u32,
    /// The format-encoded message.
    payload: serde_json::Value,
    /// How the payload is carried; always "object".
    encoding: String,
}

/// A decoded inbound frame.
pub(crate) struct Decoded {
    /// The message itself.
    pub(crate) msg: Message,
    /// The handles that accompanied the frame, if it was structured.
    pub(crate) handles: Vec<TransferHandle>,
    /// The format the sender used, as detected from the frame's shape.
    pub(crate) format: WireFormat,
}

/// The encoding half of a channel: holds the configured outbound format.
#[derive(Clone, Debug)]
pub(crate) struct Codec {
    /// The format used for every outbound frame.
    pub(crate) format: WireFormat,
}

impl Codec {
    /// Encode `msg` for the transport.
    ///
    /// `handles` are the transfer handles extracted from the payload; when
    /// present the caller must have checked the transport's transfer
    /// capability and passes `structured = true`, which selects the v2
    /// envelope.
    pub(crate) fn encode(
        &self,
        mut msg: Message,
        handles: Vec<TransferHandle>,
        structured: bool,
    ) -> Result<IoFrame, ProtocolViolation> {
        msg.version = Some(self.format);
        let payload = self.encode_payload(&msg)?;
        if structured {
            let envelope = Envelope {
                version: 2,
                payload,
                encoding: "object".to_owned(),
            };
            Ok(IoFrame::Structured {
                payload: serde_json::to_string(&envelope)?,
                transfers: handles,
            })
        } else {
            debug_assert!(handles.is_empty());
            Ok(IoFrame::Text(serde_json::to_string(&payload)?))
        }
    }

    /// Render a message under the configured format.
    fn encode_payload(&self, msg: &Message) -> Result<serde_json::Value, ProtocolViolation> {
        let tree = msg.to_tree();
        match self.format {
            WireFormat::Json => tree.to_plain(),
            WireFormat::SuperJson => {
                let (plain, meta) = tree.to_plain_with_meta()?;
                let meta: serde_json::Map<String, serde_json::Value> = meta
                    .into_iter()
                    .map(|(path, tag)| (path, serde_json::Value::from(tag.as_str())))
                    .collect();
                Ok(serde_json::json!({ "json": plain, "meta": meta }))
            }
        }
    }
}

/// Decode an inbound frame, accepting either envelope and either format.
pub(crate) fn decode(frame: IoFrame) -> Result<Decoded, ProtocolViolation> {
    let (text, handles) = match frame {
        IoFrame::Text(s) => (s, Vec::new()),
        IoFrame::Structured { payload, transfers } => (payload, transfers),
    };
    let outer: serde_json::Value = serde_json::from_str(&text)?;

    // Peel a v2 envelope if one is present; otherwise the whole frame is
    // the payload.
    let is_envelope = outer
        .as_object()
        .is_some_and(|o| o.get("version").and_then(serde_json::Value::as_u64) == Some(2));
    let payload = if is_envelope {
        let envelope: Envelope =
            serde_json::from_value(outer).map_err(|_| ProtocolViolation::BadEnvelope)?;
        envelope.payload
    } else {
        outer
    };

    let (tree, format) = decode_payload(payload)?;
    let msg = Message::from_tree(tree)?;
    Ok(Decoded {
        msg,
        handles,
        format,
    })
}

/// Detect the format of a payload by shape and lift it to a value tree.
fn decode_payload(
    payload: serde_json::Value,
) -> Result<(Value, WireFormat), ProtocolViolation> {
    match payload {
        serde_json::Value::Object(mut obj)
            if obj.contains_key("json") && obj.contains_key("meta") =>
        {
            let plain = obj
                .remove("json")
                .unwrap_or(serde_json::Value::Null);
            let serde_json::Value::Object(meta) =
                obj.remove("meta").unwrap_or(serde_json::Value::Null)
            else {
                return Err(ProtocolViolation::BadEnvelope);
            };
            let mut tree = Value::from_plain(plain);
            for (path, tag) in meta {
                let tag_str = tag.as_str().unwrap_or_default();
                let tag = MetaTag::from_name(tag_str).ok_or_else(|| {
                    ProtocolViolation::BadMetaTag {
                        tag: tag_str.to_owned(),
                        path: path.clone(),
                    }
                })?;
                tree.apply_meta(&path, tag)?;
            }
            Ok((tree, WireFormat::SuperJson))
        }
        other => Ok((Value::from_plain(other), WireFormat::Json)),
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::missing_docs_in_private_items)]

    use std::time::{Duration, UNIX_EPOCH};

    use bytes::Bytes;

    use super::*;
    use crate::msgs::{MsgBody, ResponseBody};

    /// A request message with rich values in its arguments.
    fn rich_request() -> Message {
        Message::new(
            "r1".into(),
            MsgBody::Request {
                method: "store.put".to_owned(),
                args: vec![
                    Value::Bytes(Bytes::from_static(b"\x00\x01\x02")),
                    Value::Date(UNIX_EPOCH + Duration::from_millis(123_456)),
                    Value::BigInt(i128::from(u64::MAX) + 1),
                ],
            },
        )
    }

    #[test]
    fn superjson_preserves_rich_values() {
        let codec = Codec {
            format: WireFormat::SuperJson,
        };
        let frame = codec.encode(rich_request(), vec![], false).unwrap();
        let decoded = decode(frame).unwrap();
        assert_eq!(decoded.format, WireFormat::SuperJson);
        let MsgBody::Request { args, .. } = &decoded.msg.body else {
            panic!("wrong body");
        };
        assert_eq!(args[0], Value::Bytes(Bytes::from_static(b"\x00\x01\x02")));
        assert_eq!(
            args[1],
            Value::Date(UNIX_EPOCH + Duration::from_millis(123_456))
        );
        assert_eq!(args[2], Value::BigInt(i128::from(u64::MAX) + 1));
    }

    #[test]
    fn json_downgrades_rich_values() {
        let codec = Codec {
            format: WireFormat::Json,
        };
        let frame = codec.encode(rich_request(), vec![], false).unwrap();
        let decoded = decode(frame).unwrap();
        assert_eq!(decoded.format, WireFormat::Json);
        let MsgBody::Request { args, .. } = &decoded.msg.body else {
            panic!("wrong body");
        };
        // Bytes arrive as base64 text, dates as epoch millis, and the
        // oversized integer as a decimal string.
        assert!(matches!(&args[0], Value::String(_)));
        assert_eq!(args[1], Value::Int(123_456));
        assert_eq!(
            args[2],
            Value::String((i128::from(u64::MAX) + 1).to_string())
        );
    }

    #[test]
    fn formats_interoperate() {
        // A frame encoded under either format decodes by shape alone, so a
        // receiver configured for the other format still understands it.
        for format in [WireFormat::Json, WireFormat::SuperJson] {
            let codec = Codec { format };
            let msg = Message::new(
                "interop".into(),
                MsgBody::Response(ResponseBody::Success(Value::from("ok"))),
            );
            let frame = codec.encode(msg, vec![], false).unwrap();
            let decoded = decode(frame).unwrap();
            assert_eq!(decoded.format, format);
            assert_eq!(
                decoded.msg.body,
                MsgBody::Response(ResponseBody::Success(Value::from("ok")))
            );
        }
    }

    #[test]
    fn v2_envelope_round_trip() {
        let codec = Codec {
            format: WireFormat::SuperJson,
        };
        let msg = Message::new("r9".into(), MsgBody::StreamEnd);
        let handles = vec![TransferHandle::Bytes(Bytes::from_static(b"zzz"))];
        let frame = codec.encode(msg.clone(), handles, true).unwrap();
        let IoFrame::Structured { payload, transfers } = &frame else {
            panic!("expected a structured frame");
        };
        assert!(payload.contains("\"version\":2"));
        assert_eq!(transfers.len(), 1);

        let decoded = decode(frame).unwrap();
        assert_eq!(decoded.msg.body, msg.body);
        assert_eq!(decoded.handles.len(), 1);
    }

    #[test]
    fn undecodable_frames_are_rejected() {
        assert!(decode(IoFrame::Text("{{{{".to_owned())).is_err());
        assert!(decode(IoFrame::Text("[1,2,3]".to_owned())).is_err());
    }
}
