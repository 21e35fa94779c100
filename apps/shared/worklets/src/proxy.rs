//! Reflective surface of a worklet runtime observed as a value
//!
//! When a runtime is passed into a context it shows up as an object with exactly
//! two members: `toString()` and `name`. Scheduling work on it is only possible
//! through the dedicated entry points (`_scheduleOnRuntime`, `_executeOnRuntimeSync`).

use std::fmt;
use std::sync::{Arc, Weak};

use crate::shareable::Shareable;
use crate::worklet_runtime::WorkletRuntime;

/// Members exposed by a runtime object, in enumeration order
pub const RUNTIME_PROPERTY_NAMES: [&str; 2] = ["toString", "name"];

/// Non-owning handle to a [`WorkletRuntime`]
///
/// Holding a proxy never keeps the runtime alive.
#[derive(Clone)]
pub struct RuntimeProxy {
    runtime: Weak<WorkletRuntime>,
    runtime_id: u64,
    name: Arc<str>,
}

impl RuntimeProxy {
    pub(crate) fn new(runtime: Weak<WorkletRuntime>, runtime_id: u64, name: &str) -> Self {
        Self {
            runtime,
            runtime_id,
            name: name.into(),
        }
    }

    /// The runtime, if it is still alive
    pub fn upgrade(&self) -> Option<Arc<WorkletRuntime>> {
        self.runtime.upgrade()
    }

    pub fn is_alive(&self) -> bool {
        self.runtime.strong_count() > 0
    }

    pub fn runtime_id(&self) -> u64 {
        self.runtime_id
    }

    /// The `name` member. Captured at creation, so it stays readable after destruction.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The `toString()` member: the runtime description, or an empty string once destroyed
    pub fn to_js_string(&self) -> String {
        match self.upgrade() {
            Some(runtime) => runtime.to_string(),
            None => String::new(),
        }
    }

    pub fn property_names(&self) -> Vec<String> {
        RUNTIME_PROPERTY_NAMES.iter().map(|name| name.to_string()).collect()
    }

    /// Read a member; anything but `toString` and `name` is undefined
    pub fn get(&self, property: &str) -> Shareable {
        match property {
            "toString" => {
                let proxy = self.clone();
                Shareable::host_function("toString", move |_, _| {
                    Ok(Shareable::string(proxy.to_js_string()))
                })
            }
            "name" => Shareable::string(self.name.to_string()),
            _ => Shareable::undefined(),
        }
    }

    pub fn same_runtime(&self, other: &RuntimeProxy) -> bool {
        Weak::ptr_eq(&self.runtime, &other.runtime)
    }
}

impl fmt::Display for RuntimeProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_js_string())
    }
}

impl fmt::Debug for RuntimeProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeProxy")
            .field("runtime_id", &self.runtime_id)
            .field("name", &self.name)
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dangling_proxy_is_neutral() {
        let proxy = RuntimeProxy::new(Weak::new(), 7, "gone");
        assert!(!proxy.is_alive());
        assert!(proxy.upgrade().is_none());
        assert_eq!(proxy.to_js_string(), "");
        assert_eq!(proxy.name(), "gone");
        assert_eq!(proxy.get("name").as_str(), Some("gone"));
        assert!(proxy.get("schedule").is_undefined());
        assert_eq!(proxy.property_names(), vec!["toString", "name"]);
    }
}
