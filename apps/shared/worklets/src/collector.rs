//! Per-runtime bookkeeping
//!
//! Every worklet runtime registers itself in a process-wide registry when it is
//! created and leaves it when its context is gone.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, MutexGuard};

use tracing::debug;

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::shareable::Shareable;

/// Global binding tagging a context with the id of the runtime that owns it
pub const RUNTIME_ID_GLOBAL: &str = "__workletRuntimeId";

static LIVE_RUNTIMES: LazyLock<Mutex<HashMap<u64, String>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn registry() -> MutexGuard<'static, HashMap<u64, String>> {
    match LIVE_RUNTIMES.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct RuntimeCollector;

impl RuntimeCollector {
    /// Register a runtime and tag its context
    ///
    /// # Arguments
    /// * `context` - The runtime's freshly created context
    /// * `runtime_id` - Id of the runtime
    /// * `name` - Name of the runtime
    pub fn install(context: &dyn ExecutionContext, runtime_id: u64, name: &str) -> Result<CollectorGuard> {
        context.set_global(RUNTIME_ID_GLOBAL, &Shareable::number(runtime_id as f64), false)?;

        registry().insert(runtime_id, name.to_string());
        debug!(runtime_id = runtime_id, runtime_name = name, "Runtime registered");

        Ok(CollectorGuard {
            runtime_id,
            name: name.to_string(),
        })
    }
}

/// Unregisters its runtime when dropped
#[derive(Debug)]
pub struct CollectorGuard {
    runtime_id: u64,
    name: String,
}

impl CollectorGuard {
    pub fn runtime_id(&self) -> u64 {
        self.runtime_id
    }
}

impl Drop for CollectorGuard {
    fn drop(&mut self) {
        let mut live = registry();
        // A newer runtime may have reused the id
        if live.get(&self.runtime_id) == Some(&self.name) {
            live.remove(&self.runtime_id);
        }
        debug!(runtime_id = self.runtime_id, runtime_name = %self.name, "Runtime unregistered");
    }
}

/// Snapshot of the live runtimes, sorted by id
pub fn live_runtimes() -> Vec<(u64, String)> {
    let mut runtimes: Vec<(u64, String)> = registry()
        .iter()
        .map(|(id, name)| (*id, name.clone()))
        .collect();
    runtimes.sort();
    runtimes
}

pub fn is_live(runtime_id: u64) -> bool {
    registry().contains_key(&runtime_id)
}

#[cfg(all(test, feature = "quickjs"))]
mod tests {
    use super::*;
    use crate::context::{RuntimeMutex, make_context};
    use crate::engine::EngineKind;
    use std::sync::Arc;

    #[test]
    fn test_install_registers_and_tags_context() {
        let mutex = Arc::new(RuntimeMutex::new(()));
        let context = make_context(EngineKind::QuickJs, "collected", false, &mutex).unwrap();

        let guard = RuntimeCollector::install(context.as_ref(), 9001, "collected").unwrap();
        assert!(is_live(9001));
        assert!(live_runtimes().contains(&(9001, "collected".to_string())));
        assert_eq!(
            context.get_global(RUNTIME_ID_GLOBAL).unwrap().as_number(),
            Some(9001.0)
        );

        drop(guard);
        assert!(!is_live(9001));
    }
}
