//! The dynamic payload tree carried by every message.
//!
//! [`Value`] is the type-agnostic argument and result model of the channel.
//! Most variants mirror plain json; the rich variants ([`Value::Bytes`],
//! [`Value::Date`], [`Value::BigInt`]) survive the `superjson` wire format
//! and downgrade under plain `json`.  The three *live* variants
//! ([`Value::Callback`], [`Value::RemoteCallback`], [`Value::Transfer`])
//! never reach the wire directly: the codec extracts them into placeholders
//! during encode, and a live value that survives to serialization is a
//! protocol violation.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64ct::{Base64, Encoding as _};
use bytes::Bytes;

use crate::callback::{CallbackArg, RemoteCallback};
use crate::err::ProtocolViolation;
use crate::transfer::Transfer;

/// A dynamically-typed payload value.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Value {
    /// The absent value.
    Null,
    /// A boolean.
    Bool(bool),
    /// A signed integer.
    Int(i64),
    /// A floating-point number.
    Float(f64),
    /// An integer too large for `i64`.
    BigInt(i128),
    /// A UTF-8 string.
    String(String),
    /// A byte buffer.
    Bytes(Bytes),
    /// A point in time.
    Date(SystemTime),
    /// An ordered sequence of values.
    Array(Vec<Value>),
    /// A string-keyed mapping.
    Object(BTreeMap<String, Value>),
    /// A local function being passed to the peer.  Extracted into a
    /// placeholder during encode; never serialized.
    Callback(CallbackArg),
    /// An invocable proxy for a function the peer passed to us.
    RemoteCallback(RemoteCallback),
    /// A subtree marked for zero-copy transfer, with its owned handles.
    /// Extracted into a slot placeholder during encode; never serialized.
    Transfer(Box<Transfer>),
}

impl Value {
    /// Build an object value from key/value pairs.
    pub fn object<K, I>(entries: I) -> Value
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v))
                .collect(),
        )
    }

    /// Wrap a local function so it can be passed as an argument.
    pub fn callback<F>(f: F) -> Value
    where
        F: Fn(Vec<Value>) -> Result<(), crate::err::RpcError> + Send + Sync + 'static,
    {
        Value::Callback(CallbackArg::new(f))
    }

    /// Return true if this is [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Return the boolean in this value, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Return the integer in this value, if it is one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Return this value as a float, widening an integer if necessary.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Return the string in this value, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Return the byte buffer in this value, if it is one.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Return the elements of this value, if it is an array.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Return the entries of this value, if it is an object.
    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Return the callback proxy in this value, if it is one.
    pub fn as_remote_callback(&self) -> Option<&RemoteCallback> {
        match self {
            Value::RemoteCallback(c) => Some(c),
            _ => None,
        }
    }

    /// A short name for this value's kind, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::BigInt(_) => "bigint",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Date(_) => "date",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Callback(_) => "callback",
            Value::RemoteCallback(_) => "remote callback",
            Value::Transfer(_) => "transfer",
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}
impl From<i32> for Value {
    fn from(i: i32) -> Value {
        Value::Int(i64::from(i))
    }
}
impl From<i64> for Value {
    fn from(i: i64) -> Value {
        Value::Int(i)
    }
}
impl From<f64> for Value {
    fn from(f: f64) -> Value {
        Value::Float(f)
    }
}
impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::String(s.to_owned())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::String(s)
    }
}
impl From<Bytes> for Value {
    fn from(b: Bytes) -> Value {
        Value::Bytes(b)
    }
}
impl From<Vec<Value>> for Value {
    fn from(a: Vec<Value>) -> Value {
        Value::Array(a)
    }
}

/// A rich-type marker recorded in the `superjson` meta table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum MetaTag {
    /// The node is a byte buffer, downgraded to base64.
    Bytes,
    /// The node is a date, downgraded to epoch milliseconds.
    Date,
    /// The node is a big integer, downgraded to a number or decimal string.
    BigInt,
}

impl MetaTag {
    /// The wire spelling of this tag.
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            MetaTag::Bytes => "bytes",
            MetaTag::Date => "date",
            MetaTag::BigInt => "bigint",
        }
    }

    /// Parse a wire spelling.
    pub(crate) fn from_name(s: &str) -> Option<MetaTag> {
        match s {
            "bytes" => Some(MetaTag::Bytes),
            "date" => Some(MetaTag::Date),
            "bigint" => Some(MetaTag::BigInt),
            _ => None,
        }
    }
}

/// A table from dotted path to rich-type tag, describing which nodes of a
/// plain tree must be upgraded on decode.
pub(crate) type MetaMap = BTreeMap<String, MetaTag>;

/// Convert a date to signed milliseconds since the epoch.
pub(crate) fn date_to_millis(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

/// Convert signed epoch milliseconds back to a date.
pub(crate) fn millis_to_date(ms: i64) -> SystemTime {
    if ms >= 0 {
        UNIX_EPOCH + Duration::from_millis(ms as u64)
    } else {
        UNIX_EPOCH - Duration::from_millis(ms.unsigned_abs())
    }
}

impl Value {
    /// Downgrade this tree to plain json, discarding rich-type information.
    ///
    /// This is the `json` wire format's view of a value.
    pub(crate) fn to_plain(&self) -> Result<serde_json::Value, ProtocolViolation> {
        let mut meta = None;
        to_plain_inner(self, &mut String::new(), &mut meta)
    }

    /// Downgrade this tree to plain json, recording where rich types were,
    /// so that decode can restore them.
    ///
    /// This is the `superjson` wire format's view of a value.
    pub(crate) fn to_plain_with_meta(
        &self,
    ) -> Result<(serde_json::Value, MetaMap), ProtocolViolation> {
        let mut meta = Some(MetaMap::new());
        let plain = to_plain_inner(self, &mut String::new(), &mut meta)?;
        Ok((plain, meta.unwrap_or_default()))
    }

    /// Lift plain json into a value tree.
    ///
    /// Numbers become [`Value::Int`] when they fit in `i64`,
    /// [`Value::BigInt`] when they only fit in `u64`, and [`Value::Float`]
    /// otherwise.  No other upgrades happen here; rich types are restored
    /// separately from the meta table.
    pub(crate) fn from_plain(v: serde_json::Value) -> Value {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Value::BigInt(i128::from(u))
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(a) => {
                Value::Array(a.into_iter().map(Value::from_plain).collect())
            }
            serde_json::Value::Object(o) => Value::Object(
                o.into_iter()
                    .map(|(k, v)| (k, Value::from_plain(v)))
                    .collect(),
            ),
        }
    }

    /// Upgrade the node at `path` in this tree according to `tag`.
    pub(crate) fn apply_meta(
        &mut self,
        path: &str,
        tag: MetaTag,
    ) -> Result<(), ProtocolViolation> {
        let bad = || ProtocolViolation::BadMetaTag {
            tag: tag.as_str().to_owned(),
            path: path.to_owned(),
        };
        let mut node = self;
        if !path.is_empty() {
            for seg in path.split('.') {
                node = match node {
                    Value::Object(o) => o.get_mut(seg).ok_or_else(bad)?,
                    Value::Array(a) => {
                        let idx: usize = seg.parse().map_err(|_| bad())?;
                        a.get_mut(idx).ok_or_else(bad)?
                    }
                    _ => return Err(bad()),
                };
            }
        }
        *node = match (tag, &*node) {
            (MetaTag::Bytes, Value::String(s)) => {
                let raw = Base64::decode_vec(s).map_err(|_| bad())?;
                Value::Bytes(Bytes::from(raw))
            }
            (MetaTag::Date, Value::Int(ms)) => Value::Date(millis_to_date(*ms)),
            (MetaTag::BigInt, Value::Int(i)) => Value::BigInt(i128::from(*i)),
            (MetaTag::BigInt, Value::String(s)) => {
                Value::BigInt(s.parse::<i128>().map_err(|_| bad())?)
            }
            _ => return Err(bad()),
        };
        Ok(())
    }
}

/// Recursive worker for the plain-json downgrade.
///
/// `path` is the dotted location of the current node; `meta`, when present,
/// collects rich-type tags as they are downgraded.
fn to_plain_inner(
    value: &Value,
    path: &mut String,
    meta: &mut Option<MetaMap>,
) -> Result<serde_json::Value, ProtocolViolation> {
    /// Record a tag for the current path, if we are collecting meta.
    fn tag(meta: &mut Option<MetaMap>, path: &str, t: MetaTag) {
        if let Some(m) = meta.as_mut() {
            m.insert(path.to_owned(), t);
        }
    }

    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::BigInt(i) => {
            tag(meta, path, MetaTag::BigInt);
            match i64::try_from(*i) {
                Ok(small) => serde_json::Value::from(small),
                Err(_) => serde_json::Value::String(i.to_string()),
            }
        }
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(b) => {
            tag(meta, path, MetaTag::Bytes);
            serde_json::Value::String(Base64::encode_string(b))
        }
        Value::Date(t) => {
            tag(meta, path, MetaTag::Date);
            serde_json::Value::from(date_to_millis(*t))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                let prev = path.len();
                if !path.is_empty() {
                    path.push('.');
                }
                path.push_str(&i.to_string());
                let plain = to_plain_inner(item, path, meta);
                path.truncate(prev);
                out.push(plain?);
            }
            serde_json::Value::Array(out)
        }
        Value::Object(entries) => {
            let mut out = serde_json::Map::with_capacity(entries.len());
            for (k, v) in entries {
                let prev = path.len();
                if !path.is_empty() {
                    path.push('.');
                }
                path.push_str(k);
                let plain = to_plain_inner(v, path, meta);
                path.truncate(prev);
                out.insert(k.clone(), plain?);
            }
            serde_json::Value::Object(out)
        }
        Value::Callback(_) => return Err(ProtocolViolation::Unsendable("callback")),
        Value::RemoteCallback(_) => {
            return Err(ProtocolViolation::Unsendable("remote callback"));
        }
        Value::Transfer(_) => return Err(ProtocolViolation::Unsendable("transfer")),
    })
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::missing_docs_in_private_items)]

    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn plain_downgrade() {
        let v = Value::object([
            ("n", Value::Int(5)),
            ("b", Value::Bytes(Bytes::from_static(b"hi"))),
            ("big", Value::BigInt(i128::from(u64::MAX))),
            ("when", Value::Date(UNIX_EPOCH + Duration::from_millis(1500))),
        ]);
        let plain = v.to_plain().unwrap();
        assert_eq!(plain["n"], serde_json::json!(5));
        assert_eq!(plain["b"], serde_json::json!(Base64::encode_string(b"hi")));
        assert_eq!(plain["big"], serde_json::json!(u64::MAX.to_string()));
        assert_eq!(plain["when"], serde_json::json!(1500));
    }

    #[test]
    fn meta_round_trip() {
        let v = Value::Array(vec![
            Value::Int(1),
            Value::object([
                ("buf", Value::Bytes(Bytes::from_static(b"abc"))),
                ("big", Value::BigInt(1 + i128::from(i64::MAX))),
            ]),
            Value::Date(UNIX_EPOCH + Duration::from_secs(7)),
        ]);
        let (plain, meta) = v.to_plain_with_meta().unwrap();
        assert_eq!(meta.len(), 3);
        assert_eq!(meta.get("1.buf"), Some(&MetaTag::Bytes));
        assert_eq!(meta.get("1.big"), Some(&MetaTag::BigInt));
        assert_eq!(meta.get("2"), Some(&MetaTag::Date));

        let mut restored = Value::from_plain(plain);
        for (path, tag) in &meta {
            restored.apply_meta(path, *tag).unwrap();
        }
        assert_eq!(restored, v);
    }

    #[test]
    fn from_plain_number_mapping() {
        assert_eq!(
            Value::from_plain(serde_json::json!(12)),
            Value::Int(12)
        );
        assert_eq!(
            Value::from_plain(serde_json::json!(u64::MAX)),
            Value::BigInt(i128::from(u64::MAX))
        );
        assert_eq!(
            Value::from_plain(serde_json::json!(1.5)),
            Value::Float(1.5)
        );
    }

    #[test]
    fn live_values_do_not_serialize() {
        let v = Value::callback(|_| Ok(()));
        assert_matches!(
            v.to_plain(),
            Err(ProtocolViolation::Unsendable("callback"))
        );
    }

    #[test]
    fn bad_meta_is_rejected() {
        let mut v = Value::object([("x", Value::Bool(true))]);
        assert_matches!(
            v.apply_meta("x", MetaTag::Bytes),
            Err(ProtocolViolation::BadMetaTag { .. })
        );
        assert_matches!(
            v.apply_meta("missing", MetaTag::Date),
            Err(ProtocolViolation::BadMetaTag { .. })
        );
    }

    #[test]
    fn negative_dates() {
        let before_epoch = UNIX_EPOCH - Duration::from_millis(250);
        assert_eq!(date_to_millis(before_epoch), -250);
        assert_eq!(millis_to_date(-250), before_epoch);
    }
}
