//! Shareable values
//!
//! A [`Shareable`] is the unit of transfer between execution contexts. It is
//! engine-independent, immutable once built and reference-counted, so it can be
//! held by any number of threads at once. Materializing it into a context always
//! creates a fresh native value owned by that context; capturing a native value
//! always creates a fresh shareable.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::context::Scope;
use crate::error::Result;
use crate::proxy::RuntimeProxy;

/// Maximum nesting depth accepted when capturing native values (guards against cycles)
pub const MAX_CAPTURE_DEPTH: usize = 64;

/// Kind tag of a shareable value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShareableKind {
    Primitive,
    Object,
    Array,
    ArrayBuffer,
    Worklet,
    WorkletRuntime,
    HostObject,
    HostFunction,
}

/// Payload of a shareable value
pub enum ShareableValue {
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
    Array(Vec<Shareable>),
    /// Plain object, own enumerable properties in insertion order
    Object(Vec<(String, Shareable)>),
    ArrayBuffer(Vec<u8>),
    Worklet(ShareableWorklet),
    WorkletRuntime(RuntimeProxy),
    HostObject(Arc<dyn HostObject>),
    HostFunction(HostFunction),
}

/// Immutable, reference-counted, engine-independent transfer unit
#[derive(Clone)]
pub struct Shareable(Arc<ShareableValue>);

impl Shareable {
    pub fn new(value: ShareableValue) -> Self {
        Shareable(Arc::new(value))
    }

    pub fn undefined() -> Self {
        Self::new(ShareableValue::Undefined)
    }

    pub fn null() -> Self {
        Self::new(ShareableValue::Null)
    }

    pub fn boolean(value: bool) -> Self {
        Self::new(ShareableValue::Boolean(value))
    }

    pub fn number(value: f64) -> Self {
        Self::new(ShareableValue::Number(value))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::new(ShareableValue::String(value.into()))
    }

    pub fn array(items: impl IntoIterator<Item = Shareable>) -> Self {
        Self::new(ShareableValue::Array(items.into_iter().collect()))
    }

    pub fn object<K: Into<String>>(entries: impl IntoIterator<Item = (K, Shareable)>) -> Self {
        Self::new(ShareableValue::Object(
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    pub fn array_buffer(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(ShareableValue::ArrayBuffer(bytes.into()))
    }

    pub fn worklet(worklet: ShareableWorklet) -> Self {
        Self::new(ShareableValue::Worklet(worklet))
    }

    pub fn host_object(object: Arc<dyn HostObject>) -> Self {
        Self::new(ShareableValue::HostObject(object))
    }

    pub fn host_function<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&dyn Scope, Vec<Shareable>) -> Result<Shareable> + Send + Sync + 'static,
    {
        Self::new(ShareableValue::HostFunction(HostFunction::new(name, func)))
    }

    pub fn value(&self) -> &ShareableValue {
        &self.0
    }

    pub fn kind(&self) -> ShareableKind {
        match self.value() {
            ShareableValue::Undefined
            | ShareableValue::Null
            | ShareableValue::Boolean(_)
            | ShareableValue::Number(_)
            | ShareableValue::String(_) => ShareableKind::Primitive,
            ShareableValue::Array(_) => ShareableKind::Array,
            ShareableValue::Object(_) => ShareableKind::Object,
            ShareableValue::ArrayBuffer(_) => ShareableKind::ArrayBuffer,
            ShareableValue::Worklet(_) => ShareableKind::Worklet,
            ShareableValue::WorkletRuntime(_) => ShareableKind::WorkletRuntime,
            ShareableValue::HostObject(_) => ShareableKind::HostObject,
            ShareableValue::HostFunction(_) => ShareableKind::HostFunction,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self.value(), ShareableValue::Undefined)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.value() {
            ShareableValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self.value() {
            ShareableValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.value() {
            ShareableValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Shareable]> {
        match self.value() {
            ShareableValue::Array(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self.value() {
            ShareableValue::ArrayBuffer(bytes) => Some(bytes.as_slice()),
            _ => None,
        }
    }

    pub fn as_worklet(&self) -> Option<&ShareableWorklet> {
        match self.value() {
            ShareableValue::Worklet(worklet) => Some(worklet),
            _ => None,
        }
    }

    pub fn as_runtime_proxy(&self) -> Option<&RuntimeProxy> {
        match self.value() {
            ShareableValue::WorkletRuntime(proxy) => Some(proxy),
            _ => None,
        }
    }

    /// Look up a property of a plain object
    pub fn get(&self, key: &str) -> Option<&Shareable> {
        match self.value() {
            ShareableValue::Object(entries) => {
                entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
            }
            _ => None,
        }
    }

    /// Number of live handles to this shareable
    pub fn holder_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Convert to JSON. Non-data kinds are rendered as their display text.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;

        match self.value() {
            ShareableValue::Undefined | ShareableValue::Null => Json::Null,
            ShareableValue::Boolean(b) => Json::Bool(*b),
            ShareableValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 9.0e15 {
                    Json::from(*n as i64)
                } else {
                    serde_json::Number::from_f64(*n).map(Json::Number).unwrap_or(Json::Null)
                }
            }
            ShareableValue::String(s) => Json::String(s.clone()),
            ShareableValue::Array(items) => Json::Array(items.iter().map(Shareable::to_json).collect()),
            ShareableValue::Object(entries) => Json::Object(
                entries.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            ShareableValue::ArrayBuffer(bytes) => {
                Json::Array(bytes.iter().map(|b| Json::from(*b)).collect())
            }
            _ => Json::String(self.to_string()),
        }
    }
}

impl Default for Shareable {
    fn default() -> Self {
        Shareable::undefined()
    }
}

impl PartialEq for Shareable {
    fn eq(&self, other: &Self) -> bool {
        use ShareableValue::*;

        match (self.value(), other.value()) {
            (Undefined, Undefined) | (Null, Null) => true,
            (Boolean(a), Boolean(b)) => a == b,
            (Number(a), Number(b)) => a == b,
            (String(a), String(b)) => a == b,
            (Array(a), Array(b)) => a == b,
            (Object(a), Object(b)) => a == b,
            (ArrayBuffer(a), ArrayBuffer(b)) => a == b,
            (Worklet(a), Worklet(b)) => a == b,
            (WorkletRuntime(a), WorkletRuntime(b)) => a.same_runtime(b),
            (HostObject(a), HostObject(b)) => Arc::ptr_eq(a, b),
            (HostFunction(a), HostFunction(b)) => Arc::ptr_eq(&a.func, &b.func),
            _ => false,
        }
    }
}

fn write_number(f: &mut fmt::Formatter<'_>, n: f64) -> fmt::Result {
    if n.is_nan() {
        write!(f, "NaN")
    } else if n.is_infinite() {
        write!(f, "{}", if n > 0.0 { "Infinity" } else { "-Infinity" })
    } else if n.fract() == 0.0 && n.abs() < 9.0e15 {
        write!(f, "{}", n as i64)
    } else {
        write!(f, "{}", n)
    }
}

impl fmt::Display for Shareable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value() {
            ShareableValue::Undefined => write!(f, "undefined"),
            ShareableValue::Null => write!(f, "null"),
            ShareableValue::Boolean(b) => write!(f, "{}", b),
            ShareableValue::Number(n) => write_number(f, *n),
            ShareableValue::String(s) => write!(f, "{}", s),
            ShareableValue::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            ShareableValue::Object(entries) => {
                if entries.is_empty() {
                    return write!(f, "{{}}");
                }
                write!(f, "{{ ")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                write!(f, " }}")
            }
            ShareableValue::ArrayBuffer(bytes) => write!(f, "ArrayBuffer({})", bytes.len()),
            ShareableValue::Worklet(_) => write!(f, "[Worklet]"),
            ShareableValue::WorkletRuntime(proxy) => write!(f, "{}", proxy.to_string()),
            ShareableValue::HostObject(_) => write!(f, "[HostObject]"),
            ShareableValue::HostFunction(func) => write!(f, "[HostFunction {}]", func.name()),
        }
    }
}

impl fmt::Debug for Shareable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value() {
            ShareableValue::String(s) => write!(f, "Shareable({:?})", s),
            ShareableValue::Worklet(worklet) => write!(f, "Shareable({:?})", worklet),
            _ => write!(f, "Shareable({})", self),
        }
    }
}

impl From<bool> for Shareable {
    fn from(value: bool) -> Self {
        Shareable::boolean(value)
    }
}

impl From<f64> for Shareable {
    fn from(value: f64) -> Self {
        Shareable::number(value)
    }
}

impl From<i32> for Shareable {
    fn from(value: i32) -> Self {
        Shareable::number(value as f64)
    }
}

impl From<&str> for Shareable {
    fn from(value: &str) -> Self {
        Shareable::string(value)
    }
}

impl From<String> for Shareable {
    fn from(value: String) -> Self {
        Shareable::string(value)
    }
}

impl From<ShareableWorklet> for Shareable {
    fn from(value: ShareableWorklet) -> Self {
        Shareable::worklet(value)
    }
}

impl From<serde_json::Value> for Shareable {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value as Json;

        match value {
            Json::Null => Shareable::null(),
            Json::Bool(b) => Shareable::boolean(b),
            Json::Number(n) => Shareable::number(n.as_f64().unwrap_or(f64::NAN)),
            Json::String(s) => Shareable::string(s),
            Json::Array(items) => Shareable::array(items.into_iter().map(Shareable::from)),
            Json::Object(map) => Shareable::object(map.into_iter().map(|(k, v)| (k, Shareable::from(v)))),
        }
    }
}

/// A packaged callable unit: code plus captured closure bindings
///
/// `code` must be a function expression. When materialized, the function is
/// rebuilt in the target context and bound so `this.__closure` exposes the
/// unpacked closure bindings.
#[derive(Clone, PartialEq)]
pub struct ShareableWorklet {
    code: Arc<str>,
    closure: Vec<(String, Shareable)>,
    location: Option<String>,
}

impl ShareableWorklet {
    pub fn new(code: impl Into<Arc<str>>) -> Self {
        Self {
            code: code.into(),
            closure: Vec::new(),
            location: None,
        }
    }

    /// Add a captured binding, visible to the worklet as `this.__closure.<name>`
    pub fn with_closure_var(mut self, name: impl Into<String>, value: impl Into<Shareable>) -> Self {
        let name = name.into();
        let value = value.into();
        match self.closure.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => entry.1 = value,
            None => self.closure.push((name, value)),
        }
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn closure(&self) -> &[(String, Shareable)] {
        &self.closure
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    /// The closure bindings as a plain-object shareable
    pub fn closure_object(&self) -> Shareable {
        Shareable::object(self.closure.iter().cloned())
    }
}

impl fmt::Debug for ShareableWorklet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShareableWorklet")
            .field("code", &self.code)
            .field("closure", &self.closure)
            .field("location", &self.location)
            .finish()
    }
}

/// An object whose surface is provided by the host application
///
/// Host objects are opaque to the runtime core: they are materialized by copying
/// every advertised property into a plain native object.
pub trait HostObject: Send + Sync {
    fn get(&self, name: &str) -> Shareable;

    fn property_names(&self) -> Vec<String>;
}

pub type HostFn = dyn Fn(&dyn Scope, Vec<Shareable>) -> Result<Shareable> + Send + Sync;

/// A native function provided by the host, callable from any context it is materialized in
#[derive(Clone)]
pub struct HostFunction {
    name: Arc<str>,
    func: Arc<HostFn>,
}

impl HostFunction {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&dyn Scope, Vec<Shareable>) -> Result<Shareable> + Send + Sync + 'static,
    {
        let name: String = name.into();
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, scope: &dyn Scope, args: Vec<Shareable>) -> Result<Shareable> {
        (self.func)(scope, args)
    }
}

/// Capability object handed to a runtime by the host application
///
/// A simple name -> value map. Functions are added as [`HostFunction`]s.
#[derive(Clone, Default)]
pub struct CapabilityProxy {
    members: BTreeMap<String, Shareable>,
}

impl CapabilityProxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<Shareable>) -> Self {
        self.members.insert(name.into(), value.into());
        self
    }

    pub fn with_function<F>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&dyn Scope, Vec<Shareable>) -> Result<Shareable> + Send + Sync + 'static,
    {
        let name = name.into();
        let value = Shareable::host_function(name.clone(), func);
        self.members.insert(name, value);
        self
    }

    pub fn into_host_object(self) -> Arc<dyn HostObject> {
        Arc::new(self)
    }
}

impl HostObject for CapabilityProxy {
    fn get(&self, name: &str) -> Shareable {
        self.members.get(name).cloned().unwrap_or_default()
    }

    fn property_names(&self) -> Vec<String> {
        self.members.keys().cloned().collect()
    }
}
