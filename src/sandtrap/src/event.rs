//! The event model: what the guest reports and the report store keeps.
//!
//! Wire format (shared with the in-guest instrumentation and with report
//! consumers): events are JSON objects tagged by `type`, values are either
//! `{"ref": n}` for observed objects or `{"literal": v}` for primitives.
//! JSON cannot express `undefined`, so a literal `undefined` serialises as
//! the empty object and deserialises back to [`Literal::Undefined`]. The
//! in-memory model keeps `undefined` and `null` distinct.

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A primitive carried by value in an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// A string value.
    String(String),
    /// A finite number.
    Number(f64),
    /// A boolean.
    Bool(bool),
    /// The JavaScript `null`.
    Null,
    /// The JavaScript `undefined`, distinct from `null`.
    Undefined,
}

impl Literal {
    fn from_json(v: &serde_json::Value) -> Option<Literal> {
        match v {
            serde_json::Value::Null => Some(Literal::Null),
            serde_json::Value::Bool(b) => Some(Literal::Bool(*b)),
            serde_json::Value::Number(n) => n.as_f64().map(Literal::Number),
            serde_json::Value::String(s) => Some(Literal::String(s.clone())),
            _ => None,
        }
    }

    fn to_json(&self) -> Option<serde_json::Value> {
        match self {
            Literal::String(s) => Some(serde_json::Value::String(s.clone())),
            Literal::Number(n) => serde_json::Number::from_f64(*n).map(serde_json::Value::Number),
            Literal::Bool(b) => Some(serde_json::Value::Bool(*b)),
            Literal::Null => Some(serde_json::Value::Null),
            Literal::Undefined => None,
        }
    }
}

impl From<&str> for Literal {
    fn from(s: &str) -> Self {
        Literal::String(s.to_string())
    }
}

impl From<String> for Literal {
    fn from(s: String) -> Self {
        Literal::String(s)
    }
}

impl From<f64> for Literal {
    fn from(n: f64) -> Self {
        Literal::Number(n)
    }
}

impl From<i32> for Literal {
    fn from(n: i32) -> Self {
        Literal::Number(n.into())
    }
}

impl From<bool> for Literal {
    fn from(b: bool) -> Self {
        Literal::Bool(b)
    }
}

/// Names whatever was read, written, passed, or returned.
///
/// Exactly one variant: an integer reference for non-primitive guest
/// objects (stable per object within one sandbox lifetime) or a literal
/// copy of a primitive.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Identity reference to an observed guest object.
    Ref(u64),
    /// Primitive carried by copy.
    Literal(Literal),
}

impl Value {
    /// Reference to the observed object with the given id.
    pub fn reference(id: u64) -> Self {
        Value::Ref(id)
    }

    /// Literal value.
    pub fn literal(v: impl Into<Literal>) -> Self {
        Value::Literal(v.into())
    }

    /// A literal `undefined`.
    pub fn undefined() -> Self {
        Value::Literal(Literal::Undefined)
    }

    /// A literal `null`.
    pub fn null() -> Self {
        Value::Literal(Literal::Null)
    }

    /// The reference id, when this is a [`Value::Ref`].
    pub fn as_ref_id(&self) -> Option<u64> {
        match self {
            Value::Ref(id) => Some(*id),
            Value::Literal(_) => None,
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Ref(id) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("ref", id)?;
                map.end()
            }
            Value::Literal(literal) => match literal.to_json() {
                Some(v) => {
                    let mut map = serializer.serialize_map(Some(1))?;
                    map.serialize_entry("literal", &v)?;
                    map.end()
                }
                None => serializer.serialize_map(Some(0))?.end(),
            },
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = serde_json::Map::deserialize(deserializer)?;
        match (map.get("ref"), map.get("literal")) {
            (Some(_), Some(_)) => Err(D::Error::custom("value has both 'ref' and 'literal'")),
            (Some(r), None) => r
                .as_u64()
                .filter(|id| *id > 0)
                .map(Value::Ref)
                .ok_or_else(|| D::Error::custom("'ref' must be a positive integer")),
            (None, Some(l)) => Literal::from_json(l)
                .map(Value::Literal)
                .ok_or_else(|| D::Error::custom("'literal' must be a JSON primitive")),
            // The guest writes `{literal: undefined}`, which JSON flattens
            // to an empty object.
            (None, None) => Ok(Value::Literal(Literal::Undefined)),
        }
    }
}

/// Source position of the closest user frame when an event was emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Absolute URL the originating source was compiled under, or
    /// `<unknown>` when no user frame was found.
    pub filename: String,
    /// 1-based line.
    pub line: u32,
    /// 1-based column.
    pub column: u32,
}

impl Location {
    /// Location of the given position.
    pub fn new(filename: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            filename: filename.into(),
            line,
            column,
        }
    }
}

/// Discriminant of an [`Event`], usable in queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A property read.
    Get,
    /// A property write.
    Set,
    /// A function or constructor invocation.
    Call,
}

/// One recorded guest interaction. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    /// A property read.
    GetEvent {
        /// Accessor chain of the read site.
        path: String,
        /// What the read produced.
        value: Value,
        /// Closest user frame.
        location: Location,
    },
    /// A property write.
    SetEvent {
        /// Accessor chain of the write site.
        path: String,
        /// What was written.
        value: Value,
        /// Closest user frame.
        location: Location,
    },
    /// A function or constructor invocation.
    CallEvent {
        /// Accessor chain of the call site.
        path: String,
        /// The arguments, in call order.
        arguments: Vec<Value>,
        /// What the call produced.
        returns: Value,
        /// Whether this was a `new` invocation.
        #[serde(rename = "isConstructor")]
        is_constructor: bool,
        /// Closest user frame.
        location: Location,
    },
}

impl Event {
    /// Discriminant of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::GetEvent { .. } => EventKind::Get,
            Event::SetEvent { .. } => EventKind::Set,
            Event::CallEvent { .. } => EventKind::Call,
        }
    }

    /// Accessor chain of the event site.
    pub fn path(&self) -> &str {
        match self {
            Event::GetEvent { path, .. }
            | Event::SetEvent { path, .. }
            | Event::CallEvent { path, .. } => path,
        }
    }

    /// Closest user frame when the event was emitted.
    pub fn location(&self) -> &Location {
        match self {
            Event::GetEvent { location, .. }
            | Event::SetEvent { location, .. }
            | Event::CallEvent { location, .. } => location,
        }
    }

    /// The read or written value, for get and set events.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Event::GetEvent { value, .. } | Event::SetEvent { value, .. } => Some(value),
            Event::CallEvent { .. } => None,
        }
    }

    /// The call arguments, for call events.
    pub fn arguments(&self) -> Option<&[Value]> {
        match self {
            Event::CallEvent { arguments, .. } => Some(arguments),
            _ => None,
        }
    }

    /// The call result, for call events.
    pub fn returns(&self) -> Option<&Value> {
        match self {
            Event::CallEvent { returns, .. } => Some(returns),
            _ => None,
        }
    }

    /// Whether this was a `new` invocation, for call events.
    pub fn is_constructor(&self) -> Option<bool> {
        match self {
            Event::CallEvent { is_constructor, .. } => Some(*is_constructor),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_wire_format() {
        let v: Value = serde_json::from_str(r#"{"ref": 3}"#).unwrap();
        assert_eq!(v, Value::Ref(3));
        assert_eq!(serde_json::to_string(&v).unwrap(), r#"{"ref":3}"#);

        let v: Value = serde_json::from_str(r#"{"literal": "hi"}"#).unwrap();
        assert_eq!(v, Value::literal("hi"));
        assert_eq!(serde_json::to_string(&v).unwrap(), r#"{"literal":"hi"}"#);
    }

    #[test]
    fn undefined_round_trips_as_empty_object() {
        let v: Value = serde_json::from_str("{}").unwrap();
        assert_eq!(v, Value::undefined());
        assert_eq!(serde_json::to_string(&v).unwrap(), "{}");
    }

    #[test]
    fn undefined_is_not_null() {
        let undef: Value = serde_json::from_str("{}").unwrap();
        let null: Value = serde_json::from_str(r#"{"literal": null}"#).unwrap();
        assert_ne!(undef, null);
        assert_eq!(null, Value::null());
    }

    #[test]
    fn both_variants_populated_is_rejected() {
        let res = serde_json::from_str::<Value>(r#"{"ref": 1, "literal": 2}"#);
        assert!(res.is_err());
    }

    #[test]
    fn zero_ref_is_rejected() {
        assert!(serde_json::from_str::<Value>(r#"{"ref": 0}"#).is_err());
    }

    #[test]
    fn event_tagged_by_type() {
        let json = r#"{
            "type": "CallEvent",
            "path": "alert",
            "arguments": [{"literal": "hello"}],
            "returns": {"ref": 2},
            "isConstructor": false,
            "location": {"filename": "file:///index.js", "line": 1, "column": 1}
        }"#;
        let ev: Event = serde_json::from_str(json).unwrap();
        assert_eq!(ev.kind(), EventKind::Call);
        assert_eq!(ev.path(), "alert");
        assert_eq!(ev.arguments().unwrap(), &[Value::literal("hello")]);
        assert_eq!(ev.returns(), Some(&Value::Ref(2)));
        assert_eq!(ev.is_constructor(), Some(false));
        assert_eq!(ev.location(), &Location::new("file:///index.js", 1, 1));

        let round = serde_json::to_string(&ev).unwrap();
        let back: Event = serde_json::from_str(&round).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn get_event_from_guest_json() {
        let json = r#"{
            "type": "GetEvent",
            "path": "navigator.userAgent",
            "value": {},
            "location": {"filename": "<unknown>", "line": 1, "column": 1}
        }"#;
        let ev: Event = serde_json::from_str(json).unwrap();
        assert_eq!(ev.kind(), EventKind::Get);
        assert_eq!(ev.value(), Some(&Value::undefined()));
    }
}
