//! Worklet Runtime System
//!
//! Hosts isolated script environments ("worklet runtimes") that exchange immutable
//! shareable values and schedule packaged callables ("worklets") on each other,
//! either synchronously under a recursive lock or asynchronously through each
//! runtime's home-thread queue.
//!
//! # Architecture
//!
//! - **ExecutionContext**: capability set every engine backend implements (see [`context`])
//! - **Shareable**: engine-independent transfer unit (see [`shareable`])
//! - **WorkletRuntime**: one context plus identity, locking and scheduling (see [`worklet_runtime`])
//! - **MessageQueueThread**: home-thread dispatch (see [`queue`])
//! - **JsScheduler**: posting back onto the application's main context (see [`scheduler`])

pub mod collector;
pub mod context;
pub mod decorator;
pub mod engine;
pub mod error;
pub mod proxy;
pub mod queue;
pub mod scheduler;
pub mod shareable;
pub mod systrace;
pub mod worklet_runtime;

// Conditional module imports based on features
#[cfg(feature = "quickjs")]
pub mod adapters;

pub use context::{ContextId, ExecutionContext, LockableContext, RuntimeMutex, Scope, make_context};
pub use decorator::install_value_unpacker;
pub use engine::EngineKind;
pub use error::{Result, ScriptError, WorkletsError};
pub use proxy::RuntimeProxy;
pub use queue::{DispatchThread, MessageQueueThread, Task};
pub use scheduler::{ErrorReporter, JsErrorRecord, JsScheduler, LogErrorReporter};
pub use shareable::{CapabilityProxy, HostFunction, HostObject, Shareable, ShareableKind, ShareableValue, ShareableWorklet};
pub use systrace::{TraceHook, TraceSection, set_trace_hook};
pub use worklet_runtime::{
    BOOTSTRAP_SUCCESS_SENTINEL, WorkletRuntime, WorkletRuntimeConfig, create_runtime, extract_worklet,
    extract_worklet_runtime, schedule_on_runtime,
};
