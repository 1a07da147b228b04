//! Append-only event log with a structural query matcher.
//!
//! Queries are partial event records: every supplied field is a
//! conjunctive filter, anything left unset matches everything. There is no
//! indexing; matching is a linear scan in insertion order, which is the
//! right trade-off for research-sized reports.

use std::sync::Mutex;

use crate::event::{Event, EventKind, Value};

/// The recorded interactions of one sandbox, in emission order.
///
/// The store is append-only: clients can [`clear`](Report::clear) it but
/// never mutate individual events. Shared between the sandbox (writer) and
/// its clients (readers) behind an `Arc`.
#[derive(Debug, Default)]
pub struct Report {
    events: Mutex<Vec<Event>>,
}

impl Report {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, event: Event) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }

    /// Number of recorded events.
    pub fn size(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether nothing has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Snapshot of all events, in insertion order.
    pub fn get_all(&self) -> Vec<Event> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Drop all recorded events. Does not reset value identity; ids keep
    /// growing until the sandbox is fully disposed.
    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// All events matching `query`, in insertion order.
    pub fn find_all(&self, query: &Query) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|ev| query.matches(ev))
            .cloned()
            .collect()
    }

    /// The first event matching `query`.
    pub fn find(&self, query: &Query) -> Option<Event> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|ev| query.matches(ev))
            .cloned()
    }

    /// Whether any event matches `query`.
    pub fn has(&self, query: &Query) -> bool {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|ev| query.matches(ev))
    }
}

/// A partial event record used as a filter.
///
/// ```
/// use sandtrap::{Query, Value};
///
/// let q = Query::new()
///     .path("alert")
///     .argument(Value::literal("hello"));
/// ```
#[derive(Debug, Default, Clone)]
pub struct Query {
    kind: Option<EventKind>,
    path: Option<String>,
    filename: Option<String>,
    line: Option<u32>,
    column: Option<u32>,
    value: Option<Value>,
    arguments: Option<Vec<Value>>,
    returns: Option<Value>,
    is_constructor: Option<bool>,
}

impl Query {
    /// An empty query, matching every event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require the event kind.
    pub fn kind(mut self, kind: EventKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Require an exact access path.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Require the location's filename.
    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// Require the location's line.
    pub fn line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    /// Require the location's column.
    pub fn column(mut self, column: u32) -> Self {
        self.column = Some(column);
        self
    }

    /// Require a get/set event whose value matches.
    pub fn value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    /// Add one queried argument. See [`Query::arguments`] for the matching
    /// rule.
    pub fn argument(mut self, value: Value) -> Self {
        self.arguments.get_or_insert_with(Vec::new).push(value);
        self
    }

    /// Require a call event whose arguments match the queried list.
    ///
    /// Matching is set-containment, not positional: each queried argument
    /// must match *some* argument of the event, regardless of order or of
    /// the event's arity. Two queried arguments may even be satisfied by
    /// the same event argument. The one exception is the empty list, which
    /// matches only events with no arguments at all.
    pub fn arguments(mut self, values: Vec<Value>) -> Self {
        self.arguments = Some(values);
        self
    }

    /// Require a call event whose return value matches.
    pub fn returns(mut self, value: Value) -> Self {
        self.returns = Some(value);
        self
    }

    /// Require a call event's constructor flag.
    pub fn constructor(mut self, is_constructor: bool) -> Self {
        self.is_constructor = Some(is_constructor);
        self
    }

    /// Whether `event` satisfies every supplied filter.
    pub fn matches(&self, event: &Event) -> bool {
        if self.kind.is_some_and(|k| k != event.kind()) {
            return false;
        }
        if self.path.as_deref().is_some_and(|p| p != event.path()) {
            return false;
        }

        let location = event.location();
        if self
            .filename
            .as_deref()
            .is_some_and(|f| f != location.filename)
        {
            return false;
        }
        if self.line.is_some_and(|l| l != location.line) {
            return false;
        }
        if self.column.is_some_and(|c| c != location.column) {
            return false;
        }

        if let Some(q) = &self.value {
            let Some(value) = event.value() else {
                return false;
            };
            if !matches_value(q, value) {
                return false;
            }
        }

        if let Some(queried) = &self.arguments {
            let Some(arguments) = event.arguments() else {
                return false;
            };
            if queried.is_empty() {
                if !arguments.is_empty() {
                    return false;
                }
            } else if !queried
                .iter()
                .all(|q| arguments.iter().any(|a| matches_value(q, a)))
            {
                return false;
            }
        }

        if let Some(q) = &self.returns {
            let Some(returns) = event.returns() else {
                return false;
            };
            if !matches_value(q, returns) {
                return false;
            }
        }

        if let Some(q) = self.is_constructor {
            if event.is_constructor() != Some(q) {
                return false;
            }
        }

        true
    }
}

/// A ref query requires an equal ref; a literal query requires the event
/// value to be a literal strictly equal to it (`undefined` and `null` are
/// distinct literals).
fn matches_value(query: &Value, value: &Value) -> bool {
    match (query, value) {
        (Value::Ref(q), Value::Ref(v)) => q == v,
        (Value::Literal(q), Value::Literal(v)) => q == v,
        _ => false,
    }
}
