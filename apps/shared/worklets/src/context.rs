//! Execution contexts
//!
//! An execution context is one isolated script environment. Every engine backend
//! implements the same [`ExecutionContext`] capability set, so the runtime and
//! scheduler never look at which engine they are driving.
//!
//! # Architecture
//!
//! - **ExecutionContext**: the capability set (evaluate, globals, worklet calls, job draining)
//! - **Scope**: a context that is already entered on the current thread, handed to host functions
//! - **LockableContext**: decorator that runs every capability under the runtime's recursive lock
//! - **make_context**: the factory, the single place where an engine is chosen

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::ReentrantMutex;
use tracing::debug;

use crate::engine::EngineKind;
use crate::error::{Result, WorkletsError};
use crate::shareable::{Shareable, ShareableWorklet};

/// The recursive lock guarding a locking-enabled runtime
pub type RuntimeMutex = ReentrantMutex<()>;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    pub fn next() -> Self {
        ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Capability set of an isolated script environment
///
/// Values only cross this interface as [`Shareable`]s; native values never leave
/// the context that created them.
pub trait ExecutionContext: Send + Sync {
    fn id(&self) -> ContextId;

    fn name(&self) -> &str;

    fn engine(&self) -> EngineKind;

    /// Evaluate a script for its side effects
    ///
    /// # Arguments
    /// * `source` - Script text
    /// * `source_url` - Label used in logs and stack traces
    fn evaluate(&self, source: &str, source_url: &str) -> Result<()>;

    /// Evaluate a script and capture its completion value
    fn evaluate_value(&self, source: &str, source_url: &str) -> Result<Shareable>;

    /// Materialize `value` and bind it to the global scope
    ///
    /// When `frozen` is set, the bound value is frozen (`Object.freeze`) so scripts
    /// cannot mutate it.
    fn set_global(&self, name: &str, value: &Shareable, frozen: bool) -> Result<()>;

    /// Capture a global binding
    fn get_global(&self, name: &str) -> Result<Shareable>;

    /// Materialize a worklet, call it with `args` and capture its return value
    fn call_worklet(&self, worklet: &ShareableWorklet, args: &[Shareable]) -> Result<Shareable>;

    /// Run queued promise jobs until none are left, returning how many ran
    fn run_pending_jobs(&self) -> Result<usize>;
}

/// A context already entered on the current thread
///
/// Host functions receive the scope they are called from. Work that targets the
/// same context must go through the scope rather than the context, since the
/// context cannot be entered a second time from within itself.
pub trait Scope {
    fn context_id(&self) -> ContextId;

    fn context_name(&self) -> &str;

    fn evaluate_value(&self, source: &str, source_url: &str) -> Result<Shareable>;

    fn call_worklet(&self, worklet: &ShareableWorklet, args: &[Shareable]) -> Result<Shareable>;
}

/// Context decorator that serializes every entry through the runtime lock
///
/// The lock is recursive: a thread already holding it (for instance inside a
/// synchronous call) can re-enter without deadlocking. The guard is released on
/// every exit path, including errors and panics.
pub struct LockableContext {
    inner: Arc<dyn ExecutionContext>,
    mutex: Arc<RuntimeMutex>,
}

impl LockableContext {
    pub fn new(inner: Arc<dyn ExecutionContext>, mutex: Arc<RuntimeMutex>) -> Self {
        Self { inner, mutex }
    }

    pub fn mutex(&self) -> &Arc<RuntimeMutex> {
        &self.mutex
    }
}

impl ExecutionContext for LockableContext {
    fn id(&self) -> ContextId {
        self.inner.id()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn engine(&self) -> EngineKind {
        self.inner.engine()
    }

    fn evaluate(&self, source: &str, source_url: &str) -> Result<()> {
        let _guard = self.mutex.lock();
        self.inner.evaluate(source, source_url)
    }

    fn evaluate_value(&self, source: &str, source_url: &str) -> Result<Shareable> {
        let _guard = self.mutex.lock();
        self.inner.evaluate_value(source, source_url)
    }

    fn set_global(&self, name: &str, value: &Shareable, frozen: bool) -> Result<()> {
        let _guard = self.mutex.lock();
        self.inner.set_global(name, value, frozen)
    }

    fn get_global(&self, name: &str) -> Result<Shareable> {
        let _guard = self.mutex.lock();
        self.inner.get_global(name)
    }

    fn call_worklet(&self, worklet: &ShareableWorklet, args: &[Shareable]) -> Result<Shareable> {
        let _guard = self.mutex.lock();
        self.inner.call_worklet(worklet, args)
    }

    fn run_pending_jobs(&self) -> Result<usize> {
        let _guard = self.mutex.lock();
        self.inner.run_pending_jobs()
    }
}

/// Create a new isolated execution context
///
/// # Arguments
/// * `engine` - Engine backing the context
/// * `name` - Display/debug name
/// * `supports_locking` - Wrap the context in a [`LockableContext`]
/// * `mutex` - The runtime lock used by the wrapper
///
/// # Errors
/// Returns [`WorkletsError::UnsupportedEngine`] if `engine` is not compiled into this build
pub fn make_context(
    engine: EngineKind,
    name: &str,
    supports_locking: bool,
    mutex: &Arc<RuntimeMutex>,
) -> Result<Arc<dyn ExecutionContext>> {
    let context: Arc<dyn ExecutionContext> = match engine {
        #[cfg(feature = "quickjs")]
        EngineKind::QuickJs => Arc::new(crate::adapters::js::QuickJsContext::new(name)?),
        other => return Err(WorkletsError::UnsupportedEngine(other)),
    };

    debug!(
        "Created {} context '{}' ({}, locking: {})",
        engine.name(),
        name,
        context.id(),
        supports_locking
    );

    if supports_locking {
        Ok(Arc::new(LockableContext::new(context, Arc::clone(mutex))))
    } else {
        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_ids_are_unique() {
        let a = ContextId::next();
        let b = ContextId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_unsupported_engine_fails_fast() {
        let mutex = Arc::new(RuntimeMutex::new(()));
        let result = make_context(EngineKind::Hermes, "ui", true, &mutex);
        assert!(matches!(result, Err(WorkletsError::UnsupportedEngine(EngineKind::Hermes))));
    }

    #[cfg(feature = "quickjs")]
    #[test]
    fn test_lockable_context_holds_lock_during_calls() {
        let mutex = Arc::new(RuntimeMutex::new(()));
        let context = make_context(EngineKind::QuickJs, "locked", true, &mutex).unwrap();

        let held = Arc::clone(&mutex);
        let is_locked = Shareable::host_function("isLocked", move |_, _| {
            Ok(Shareable::boolean(held.is_locked()))
        });
        context.set_global("isLocked", &is_locked, false).unwrap();

        assert!(!mutex.is_locked());
        let inside = context.evaluate_value("isLocked()", "check").unwrap();
        assert_eq!(inside.as_bool(), Some(true));
        assert!(!mutex.is_locked());
    }

    #[cfg(feature = "quickjs")]
    #[test]
    fn test_lock_released_after_script_error() {
        let mutex = Arc::new(RuntimeMutex::new(()));
        let context = make_context(EngineKind::QuickJs, "locked", true, &mutex).unwrap();

        let result = context.evaluate("throw new Error('boom')", "failing");
        assert!(matches!(result, Err(WorkletsError::Script(_))));
        assert!(!mutex.is_locked());
    }
}
