//! Attribute values: the decoded [`Value`] tree and the write-side [`Attr`] / [`AttrValue`] inputs.
//!
//! [`Value`] is what travels on the wire and what the reader hands back. [`AttrValue`] is what a
//! producer attaches to a handler or a log call; it may still hold lazily-computed values
//! ([`LogValue`]) and arbitrary serializable payloads ([`OpaqueValue`]) that the handler resolves
//! and converts into a [`Value`] when the record is built.

use chrono::{DateTime, TimeDelta, Utc};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A nested attribute mapping. Key order is irrelevant.
pub type Group = HashMap<String, Value>;

/// Maximum number of [`LogValue`] hops followed when resolving a lazy attribute.
pub const MAX_RESOLVE_DEPTH: usize = 100;

/// A single decoded attribute value.
///
/// `Empty` is the "no variant set" state: it is distinct from `false`, `0` and `""` and
/// round-trips as `Empty`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Empty,
    Bool(bool),
    Float(f64),
    Int(i64),
    Uint(u64),
    String(String),
    Time(DateTime<Utc>),
    Duration(TimeDelta),
    Group(Group),
    /// Payload of a value the producer only knew as "some serializable thing".
    Opaque { type_tag: String, bytes: Vec<u8> },
}

impl Value {
    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(x) => Some(*x),
            Value::Uint(x) => i64::try_from(*x).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Uint(x) => Some(*x),
            Value::Int(x) => u64::try_from(*x).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Time(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_duration(&self) -> Option<TimeDelta> {
        match self {
            Value::Duration(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_group(&self) -> Option<&Group> {
        match self {
            Value::Group(g) => Some(g),
            _ => None,
        }
    }

    /// Short name of the active variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Empty => "empty",
            Value::Bool(_) => "bool",
            Value::Float(_) => "float",
            Value::Int(_) => "int",
            Value::Uint(_) => "uint",
            Value::String(_) => "string",
            Value::Time(_) => "time",
            Value::Duration(_) => "duration",
            Value::Group(_) => "group",
            Value::Opaque { .. } => "opaque",
        }
    }
}

/// Render a duration as decimal seconds, e.g. `1.5s`, `-0.000001s`, `0s`.
pub fn format_duration(d: TimeDelta) -> String {
    let secs = d.num_seconds();
    let nanos = d.subsec_nanos();
    let negative = secs < 0 || nanos < 0;
    let secs = secs.unsigned_abs();
    let nanos = nanos.unsigned_abs();
    let sign = if negative { "-" } else { "" };
    if nanos == 0 {
        return format!("{}{}s", sign, secs);
    }
    let frac = format!("{:09}", nanos);
    format!("{}{}.{}s", sign, secs, frac.trim_end_matches('0'))
}

/// JSON rendering: time as RFC 3339, duration as seconds string, opaque as
/// `{"type": .., "value": ..}` (the payload is re-parsed as JSON when possible).
impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Empty => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Float(x) => serializer.serialize_f64(*x),
            Value::Int(x) => serializer.serialize_i64(*x),
            Value::Uint(x) => serializer.serialize_u64(*x),
            Value::String(s) => serializer.serialize_str(s),
            Value::Time(t) => serializer.serialize_str(&t.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true)),
            Value::Duration(d) => serializer.serialize_str(&format_duration(*d)),
            Value::Group(g) => {
                let mut map = serializer.serialize_map(Some(g.len()))?;
                for (k, v) in g {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            Value::Opaque { type_tag, bytes } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", type_tag)?;
                match serde_json::from_slice::<serde_json::Value>(bytes) {
                    Ok(json) => map.serialize_entry("value", &json)?,
                    Err(_) => map.serialize_entry("value", bytes)?,
                }
                map.end()
            }
        }
    }
}

/// A key/value pair attached to a handler or passed with a log call.
#[derive(Debug, Clone)]
pub struct Attr {
    pub key: String,
    pub value: AttrValue,
}

impl Attr {
    pub fn new(key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        Attr { key: key.into(), value: value.into() }
    }

    pub fn string(key: impl Into<String>, value: impl Into<String>) -> Self {
        Attr::new(key, AttrValue::String(value.into()))
    }

    pub fn int(key: impl Into<String>, value: i64) -> Self {
        Attr::new(key, AttrValue::Int(value))
    }

    pub fn uint(key: impl Into<String>, value: u64) -> Self {
        Attr::new(key, AttrValue::Uint(value))
    }

    pub fn float(key: impl Into<String>, value: f64) -> Self {
        Attr::new(key, AttrValue::Float(value))
    }

    pub fn bool(key: impl Into<String>, value: bool) -> Self {
        Attr::new(key, AttrValue::Bool(value))
    }

    pub fn time(key: impl Into<String>, value: DateTime<Utc>) -> Self {
        Attr::new(key, AttrValue::Time(value))
    }

    pub fn duration(key: impl Into<String>, value: TimeDelta) -> Self {
        Attr::new(key, AttrValue::Duration(value))
    }

    /// A group of attributes. An empty `key` inlines the children into the enclosing mapping.
    pub fn group(key: impl Into<String>, attrs: impl IntoIterator<Item = Attr>) -> Self {
        Attr::new(key, AttrValue::Group(attrs.into_iter().collect()))
    }

    /// Any serializable value; written as an opaque JSON payload tagged with its Rust type name.
    pub fn any<T>(key: impl Into<String>, value: T) -> Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        Attr::new(key, AttrValue::Any(Arc::new(Json(value))))
    }

    /// A value computed when the record is built rather than when the attribute is attached.
    pub fn lazy(key: impl Into<String>, value: impl LogValue + 'static) -> Self {
        Attr::new(key, AttrValue::Lazy(Arc::new(value)))
    }
}

/// Write-side attribute value.
#[derive(Clone)]
pub enum AttrValue {
    Empty,
    Bool(bool),
    Float(f64),
    Int(i64),
    Uint(u64),
    String(String),
    Time(DateTime<Utc>),
    Duration(TimeDelta),
    Group(Vec<Attr>),
    Any(Arc<dyn OpaqueValue>),
    Lazy(Arc<dyn LogValue>),
}

impl AttrValue {
    /// Follow `Lazy` values until a concrete kind is reached.
    ///
    /// Returns `None` when the chain does not terminate within [`MAX_RESOLVE_DEPTH`] hops.
    pub fn resolve(&self) -> Option<Cow<'_, AttrValue>> {
        let AttrValue::Lazy(first) = self else {
            return Some(Cow::Borrowed(self));
        };
        let mut current = first.log_value();
        for _ in 1..MAX_RESOLVE_DEPTH {
            match current {
                AttrValue::Lazy(next) => current = next.log_value(),
                concrete => return Some(Cow::Owned(concrete)),
            }
        }
        None
    }
}

impl fmt::Debug for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Empty => f.write_str("Empty"),
            AttrValue::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            AttrValue::Float(x) => f.debug_tuple("Float").field(x).finish(),
            AttrValue::Int(x) => f.debug_tuple("Int").field(x).finish(),
            AttrValue::Uint(x) => f.debug_tuple("Uint").field(x).finish(),
            AttrValue::String(s) => f.debug_tuple("String").field(s).finish(),
            AttrValue::Time(t) => f.debug_tuple("Time").field(t).finish(),
            AttrValue::Duration(d) => f.debug_tuple("Duration").field(d).finish(),
            AttrValue::Group(g) => f.debug_tuple("Group").field(g).finish(),
            AttrValue::Any(o) => f.debug_tuple("Any").field(&o.type_tag()).finish(),
            AttrValue::Lazy(_) => f.write_str("Lazy(..)"),
        }
    }
}

/// A value that defers to another value, resolved when a record is built.
pub trait LogValue: Send + Sync {
    fn log_value(&self) -> AttrValue;
}

impl<F> LogValue for F
where
    F: Fn() -> AttrValue + Send + Sync,
{
    fn log_value(&self) -> AttrValue {
        self()
    }
}

/// A value carried as an opaque tagged payload.
pub trait OpaqueValue: Send + Sync {
    fn type_tag(&self) -> String;
    fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error>;
}

/// JSON-encoded [`OpaqueValue`] for any `Serialize` type.
pub struct Json<T>(pub T);

impl<T> OpaqueValue for Json<T>
where
    T: Serialize + Send + Sync + 'static,
{
    fn type_tag(&self) -> String {
        format!("rust/{}", std::any::type_name::<T>())
    }

    fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.0)
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<i32> for AttrValue {
    fn from(v: i32) -> Self {
        AttrValue::Int(v as i64)
    }
}

impl From<u64> for AttrValue {
    fn from(v: u64) -> Self {
        AttrValue::Uint(v)
    }
}

impl From<u32> for AttrValue {
    fn from(v: u32) -> Self {
        AttrValue::Uint(v as u64)
    }
}

impl From<usize> for AttrValue {
    fn from(v: usize) -> Self {
        AttrValue::Uint(v as u64)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::String(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::String(v)
    }
}

impl From<DateTime<Utc>> for AttrValue {
    fn from(v: DateTime<Utc>) -> Self {
        AttrValue::Time(v)
    }
}

impl From<TimeDelta> for AttrValue {
    fn from(v: TimeDelta) -> Self {
        AttrValue::Duration(v)
    }
}

impl From<Vec<Attr>> for AttrValue {
    fn from(v: Vec<Attr>) -> Self {
        AttrValue::Group(v)
    }
}

impl<T: Into<AttrValue>> From<Option<T>> for AttrValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(AttrValue::Empty)
    }
}
