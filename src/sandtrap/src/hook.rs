//! Host-declared overrides installed into the guest before user code runs.
//!
//! A hook is keyed by an accessor path and carries exactly one of three
//! variants: a copied value (deposited into the guest by deep copy), a
//! host callable (round-tripped over the boundary as JSON), or an alias
//! (reads and calls behave as if they happened at the target path).

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// An alias target: `hook("window", Reference::new("globalThis"))` makes
/// every read of `window` behave as a read of `globalThis`, with events
/// recorded under the target path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// The path the alias forwards to.
    pub path: String,
}

impl Reference {
    /// Alias target at `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// A host function callable from guest code.
///
/// Mirrors the way host functions cross the JSON boundary: the guest's
/// arguments arrive as one JSON array string, the return value goes back
/// as a JSON string, and an `Err` becomes a guest exception.
///
/// The blanket impl makes any closure over serde-typed argument tuples a
/// `HookFunction`, working around the lack of variadic generics.
pub trait HookFunction<Output: Serialize, Args: DeserializeOwned> {
    /// Apply the function to an argument tuple.
    fn call(&self, args: Args) -> Output;
}

impl<Output, Args, F> HookFunction<Output, Args> for F
where
    Output: Serialize,
    Args: DeserializeOwned,
    F: fn_traits::Fn<Args, Output = Output>,
{
    fn call(&self, args: Args) -> Output {
        fn_traits::Fn::call(self, args)
    }
}

pub(crate) type BoxCallable = Box<dyn Fn(String) -> std::result::Result<String, String> + Send + Sync>;

fn type_erased<Output: Serialize, Args: DeserializeOwned>(
    func: impl HookFunction<Output, Args> + Send + Sync + 'static,
) -> BoxCallable {
    Box::new(move |args: String| {
        // Zero-parameter functions have `Args = ()`, which serde reads
        // from `null` rather than from the guest's empty argument array.
        let args: Args = serde_json::from_str(&args)
            .or_else(|e| {
                if args.trim() == "[]" {
                    serde_json::from_str("null").map_err(|_| e)
                } else {
                    Err(e)
                }
            })
            .map_err(|e| format!("hook arguments did not deserialize: {e}"))?;
        let output = func.call(args);
        serde_json::to_string(&output).map_err(|e| format!("hook result did not serialize: {e}"))
    })
}

pub(crate) enum HookKind {
    /// Deep-copied value; `None` is an explicit `undefined`.
    Copy(Option<serde_json::Value>),
    Callable(Arc<BoxCallable>),
    Alias(String),
}

impl fmt::Debug for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookKind::Copy(v) => f.debug_tuple("Copy").field(v).finish(),
            HookKind::Callable(_) => f.debug_tuple("Callable").finish(),
            HookKind::Alias(target) => f.debug_tuple("Alias").field(target).finish(),
        }
    }
}

/// The value side of a hook declaration, classified into one of the three
/// variants. Usually built through a `From` conversion:
///
/// ```
/// use sandtrap::{HookValue, Reference};
///
/// let _copy: HookValue = serde_json::json!({"ready": true}).into();
/// let _string: HookValue = "Mozilla/5.0".into();
/// let _alias: HookValue = Reference::new("browser").into();
/// let _undef = HookValue::undefined();
/// let _callable = HookValue::callable(|a: f64, b: f64| a + b);
/// ```
pub struct HookValue(pub(crate) HookKind);

impl HookValue {
    /// An explicit `undefined`, e.g. to neutralise feature detection.
    pub fn undefined() -> Self {
        HookValue(HookKind::Copy(None))
    }

    /// A structured-cloneable value, deposited into the guest by copy.
    pub fn copied(value: serde_json::Value) -> Self {
        HookValue(HookKind::Copy(Some(value)))
    }

    /// An alias to another path.
    pub fn alias(path: impl Into<String>) -> Self {
        HookValue(HookKind::Alias(path.into()))
    }

    /// A host callable. Arguments and result cross the boundary as JSON;
    /// anything serde can handle works as a signature.
    pub fn callable<Output, Args>(
        func: impl HookFunction<Output, Args> + Send + Sync + 'static,
    ) -> Self
    where
        Output: Serialize,
        Args: DeserializeOwned,
    {
        HookValue(HookKind::Callable(Arc::new(type_erased(func))))
    }
}

impl From<serde_json::Value> for HookValue {
    fn from(value: serde_json::Value) -> Self {
        HookValue::copied(value)
    }
}

impl From<Reference> for HookValue {
    fn from(reference: Reference) -> Self {
        HookValue::alias(reference.path)
    }
}

impl From<&str> for HookValue {
    fn from(value: &str) -> Self {
        HookValue::copied(serde_json::Value::String(value.to_string()))
    }
}

impl From<String> for HookValue {
    fn from(value: String) -> Self {
        HookValue::copied(serde_json::Value::String(value))
    }
}

impl From<bool> for HookValue {
    fn from(value: bool) -> Self {
        HookValue::copied(serde_json::Value::Bool(value))
    }
}

impl From<f64> for HookValue {
    fn from(value: f64) -> Self {
        serde_json::Number::from_f64(value)
            .map(|n| HookValue::copied(serde_json::Value::Number(n)))
            .unwrap_or_else(HookValue::undefined)
    }
}

impl From<i64> for HookValue {
    fn from(value: i64) -> Self {
        HookValue::copied(serde_json::Value::Number(value.into()))
    }
}

#[derive(Debug)]
pub(crate) struct HookEntry {
    pub(crate) path: String,
    pub(crate) writable: bool,
    pub(crate) kind: HookKind,
}

/// Ordered hook table. Declaration order is preserved so later hooks (the
/// user's) can override earlier ones (the defaults) inside the guest, and
/// re-declaring a path replaces the previous entry in place.
#[derive(Debug, Default)]
pub(crate) struct HookRegistry {
    entries: Vec<HookEntry>,
}

impl HookRegistry {
    pub(crate) fn insert(&mut self, path: &str, writable: bool, kind: HookKind) {
        let entry = HookEntry {
            path: path.to_string(),
            writable,
            kind,
        };
        match self.entries.iter_mut().find(|e| e.path == path) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub(crate) fn remove(&mut self, path: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.path != path);
        self.entries.len() != before
    }

    /// Serialise the table for the guest and collect the callables in
    /// index order.
    pub(crate) fn for_guest(&self) -> Result<(String, Vec<Arc<BoxCallable>>)> {
        let mut callables = Vec::new();
        let mut table = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let mut obj = serde_json::Map::new();
            obj.insert("path".into(), entry.path.clone().into());
            obj.insert("writable".into(), entry.writable.into());
            match &entry.kind {
                HookKind::Copy(Some(value)) => {
                    obj.insert("kind".into(), "copy".into());
                    obj.insert("value".into(), value.clone());
                }
                HookKind::Copy(None) => {
                    // No "value" key: the guest reads this as undefined.
                    obj.insert("kind".into(), "copy".into());
                }
                HookKind::Callable(func) => {
                    obj.insert("kind".into(), "callable".into());
                    obj.insert("index".into(), (callables.len() as u64).into());
                    callables.push(func.clone());
                }
                HookKind::Alias(target) => {
                    obj.insert("kind".into(), "alias".into());
                    obj.insert("target".into(), target.clone().into());
                }
            }
            table.push(serde_json::Value::Object(obj));
        }
        let json = serde_json::to_string(&table)
            .map_err(|e| Error::InvalidValue(format!("hook table did not serialize: {e}")))?;
        Ok((json, callables))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_replaces_in_place() {
        let mut registry = HookRegistry::default();
        registry.insert("a", true, HookKind::Copy(Some(1.into())));
        registry.insert("b", true, HookKind::Copy(Some(2.into())));
        registry.insert("a", false, HookKind::Copy(Some(3.into())));

        let (json, _) = registry.for_guest().unwrap();
        let table: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(table[0]["path"], "a");
        assert_eq!(table[0]["value"], 3);
        assert_eq!(table[0]["writable"], false);
        assert_eq!(table[1]["path"], "b");
    }

    #[test]
    fn remove_reports_presence() {
        let mut registry = HookRegistry::default();
        registry.insert("a", true, HookKind::Copy(None));
        assert!(registry.remove("a"));
        assert!(!registry.remove("a"));
    }

    #[test]
    fn undefined_copy_has_no_value_key() {
        let mut registry = HookRegistry::default();
        registry.insert("define", true, HookKind::Copy(None));
        let (json, _) = registry.for_guest().unwrap();
        let table: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(table[0]["kind"], "copy");
        assert!(table[0].as_object().unwrap().get("value").is_none());
    }

    #[test]
    fn callables_are_indexed_in_declaration_order() {
        let mut registry = HookRegistry::default();
        registry.insert("first", true, HookKind::Callable(Arc::new(type_erased(|| 1))));
        registry.insert("mid", true, HookKind::Alias("globalThis".into()));
        registry.insert(
            "second",
            true,
            HookKind::Callable(Arc::new(type_erased(|| 2))),
        );

        let (json, callables) = registry.for_guest().unwrap();
        assert_eq!(callables.len(), 2);
        let table: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(table[0]["index"], 0);
        assert_eq!(table[2]["index"], 1);
        assert_eq!(callables[0]("[]".into()).unwrap(), "1");
        assert_eq!(callables[1]("[]".into()).unwrap(), "2");
    }

    #[test]
    fn type_erased_round_trips_serde_arguments() {
        let add = type_erased(|a: f64, b: f64| a + b);
        assert_eq!(add("[2, 3]".into()).unwrap(), "5.0");

        let greet = type_erased(|name: String| format!("hi {name}"));
        assert_eq!(greet(r#"["ada"]"#.into()).unwrap(), r#""hi ada""#);

        let err = add("[1]".into()).unwrap_err();
        assert!(err.contains("deserialize"));
    }
}
