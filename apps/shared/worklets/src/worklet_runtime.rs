//! Worklet runtimes
//!
//! A [`WorkletRuntime`] pairs one isolated execution context with its identity,
//! its recursive lock and its scheduling plumbing. Work reaches it in two ways:
//!
//! - **Synchronously** (`execute_sync`): runs on the calling thread under the
//!   runtime lock and returns the result.
//! - **Asynchronously** (`run_async_guarded`, `schedule_on_runtime`): posted to the
//!   home queue, fire-and-forget. Failures go to the error reporter.

use std::fmt;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::collector::{CollectorGuard, RuntimeCollector};
use crate::context::{ExecutionContext, RuntimeMutex, Scope, make_context};
use crate::decorator::{self, RuntimeIdentity};
use crate::engine::EngineKind;
use crate::error::{Result, WorkletsError};
use crate::proxy::RuntimeProxy;
use crate::queue::MessageQueueThread;
use crate::scheduler::{JsErrorRecord, JsScheduler};
use crate::shareable::{HostObject, Shareable, ShareableValue, ShareableWorklet};
use crate::systrace::TraceSection;

/// Message prefix a bootstrap script throws to signal successful initialization
pub const BOOTSTRAP_SUCCESS_SENTINEL: &str = "[Worklets] Worklets initialized successfully";

const EXECUTE_SYNC_ERROR: &str = "[Worklets] Only worklets can be executed synchronously on UI runtime.";
const SCHEDULE_ON_RUNTIME_ERROR: &str = "[Worklets] Function passed to `_scheduleOnRuntime` is not a shareable worklet.";
const DEFAULT_SOURCE_URL: &str = "worklets://bundle.js";

fn default_supports_locking() -> bool {
    true
}

/// Construction parameters of a worklet runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkletRuntimeConfig {
    pub runtime_id: u64,
    pub name: String,
    #[serde(default = "default_supports_locking")]
    pub supports_locking: bool,
    #[serde(default)]
    pub is_dev_bundle: bool,
    #[serde(default)]
    pub engine: EngineKind,
    /// Bootstrap bundle text. Without one the built-in value unpacker is evaluated instead.
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
}

impl WorkletRuntimeConfig {
    pub fn new(runtime_id: u64, name: impl Into<String>) -> Self {
        Self {
            runtime_id,
            name: name.into(),
            supports_locking: true,
            is_dev_bundle: false,
            engine: EngineKind::default(),
            script: None,
            source_url: None,
        }
    }

    pub fn with_locking(mut self, supports_locking: bool) -> Self {
        self.supports_locking = supports_locking;
        self
    }

    pub fn with_dev_bundle(mut self, is_dev_bundle: bool) -> Self {
        self.is_dev_bundle = is_dev_bundle;
        self
    }

    pub fn with_engine(mut self, engine: EngineKind) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_script(mut self, script: impl Into<String>, source_url: impl Into<String>) -> Self {
        self.script = Some(script.into());
        self.source_url = Some(source_url.into());
        self
    }

    /// Check the configuration before anything is built
    ///
    /// # Errors
    /// Returns a configuration error for an empty name or an engine missing from this build
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(WorkletsError::Configuration(format!(
                "Runtime {} has an empty name",
                self.runtime_id
            )));
        }
        if !self.engine.is_available() {
            return Err(WorkletsError::UnsupportedEngine(self.engine));
        }
        Ok(())
    }
}

/// An isolated script environment with identity, locking and scheduling metadata
pub struct WorkletRuntime {
    runtime_id: u64,
    name: String,
    supports_locking: bool,
    is_dev_bundle: bool,
    engine: EngineKind,
    runtime_mutex: Arc<RuntimeMutex>,
    context: Arc<dyn ExecutionContext>,
    home_queue: Arc<dyn MessageQueueThread>,
    js_scheduler: Arc<JsScheduler>,
    weak_self: Weak<WorkletRuntime>,
    // Dropped after the context
    _collector: CollectorGuard,
}

impl WorkletRuntime {
    /// Build a runtime
    ///
    /// # Arguments
    /// * `config` - Identity, locking and bootstrap parameters
    /// * `capability_proxy` - Host facilities bound into the context as `__workletsModuleProxy`
    /// * `home_queue` - Queue of the thread driving this runtime
    /// * `js_scheduler` - Scheduler posting back onto the main context
    ///
    /// # Errors
    /// Fails on configuration errors and when the built-in value unpacker cannot be
    /// evaluated. A failing bootstrap script does not fail construction: it is
    /// reported through the scheduler's fatal error channel instead.
    pub fn new(
        config: WorkletRuntimeConfig,
        capability_proxy: Arc<dyn HostObject>,
        home_queue: Arc<dyn MessageQueueThread>,
        js_scheduler: Arc<JsScheduler>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let WorkletRuntimeConfig {
            runtime_id,
            name,
            supports_locking,
            is_dev_bundle,
            engine,
            script,
            source_url,
        } = config;

        // Allocated even without locking support
        let runtime_mutex = Arc::new(RuntimeMutex::new(()));
        let context = make_context(engine, &name, supports_locking, &runtime_mutex)?;
        let collector = RuntimeCollector::install(context.as_ref(), runtime_id, &name)?;

        decorator::decorate(
            context.as_ref(),
            RuntimeIdentity {
                runtime_id,
                name: &name,
                is_dev_bundle,
            },
            capability_proxy,
            Arc::clone(&js_scheduler),
        )?;

        let runtime = Arc::new_cyclic(|weak_self| WorkletRuntime {
            runtime_id,
            name,
            supports_locking,
            is_dev_bundle,
            engine,
            runtime_mutex,
            context,
            home_queue,
            js_scheduler,
            weak_self: weak_self.clone(),
            _collector: collector,
        });

        match script {
            Some(script) => {
                let source_url = source_url.unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string());
                runtime.bootstrap(&script, &source_url);
            }
            None => decorator::install_value_unpacker(runtime.context.as_ref())?,
        }

        info!(
            runtime_id = runtime.runtime_id,
            runtime_name = %runtime.name,
            "Worklet runtime created (engine: {}, locking: {})",
            runtime.engine.name(),
            runtime.supports_locking
        );
        Ok(runtime)
    }

    /// Evaluate the bootstrap bundle, reporting anything but the success sentinel
    fn bootstrap(&self, script: &str, source_url: &str) {
        let Err(e) = self.context.evaluate(script, source_url) else {
            return;
        };

        let script_error = e.to_script_error();
        if script_error.message.starts_with(BOOTSTRAP_SUCCESS_SENTINEL) {
            debug!(runtime_id = self.runtime_id, runtime_name = %self.name, "Bootstrap completed");
            return;
        }

        let failure = WorkletsError::Bootstrap {
            runtime: self.name.clone(),
            error: script_error.clone(),
        };
        error!(runtime_id = self.runtime_id, runtime_name = %self.name, "{}", failure);

        self.js_scheduler.report_fatal_error_on_js(JsErrorRecord {
            message: format!("[Worklets] Failed to initialize runtime. Reason: {}", script_error.message),
            stack: script_error.stack.unwrap_or_default(),
            name: "WorkletsError".to_string(),
            js_engine: "Worklets".to_string(),
        });
    }

    /// Run a worklet synchronously on the calling thread, under the runtime lock
    ///
    /// # Errors
    /// * [`WorkletsError::LockingNotSupported`] if the runtime was built without locking
    /// * [`WorkletsError::InvocationType`] if `worklet` is not a worklet
    /// * Any error raised by the worklet itself, after the lock is released
    pub fn execute_sync(&self, worklet: &Shareable) -> Result<Shareable> {
        self.ensure_locking()?;
        let worklet = extract_worklet(worklet, EXECUTE_SYNC_ERROR)?;

        let _section = TraceSection::begin("executeSync", &self.name);
        let _guard = self.runtime_mutex.lock();
        self.run_guarded(worklet, &[])
    }

    /// [`execute_sync`](Self::execute_sync) issued from inside a context
    ///
    /// When `scope` is this runtime's own context, the worklet runs inline on it.
    pub fn execute_sync_in(&self, scope: &dyn Scope, worklet: &Shareable) -> Result<Shareable> {
        if scope.context_id() != self.context.id() {
            return self.execute_sync(worklet);
        }

        self.ensure_locking()?;
        let worklet = extract_worklet(worklet, EXECUTE_SYNC_ERROR)?;
        let _section = TraceSection::begin("executeSync", &self.name);
        scope.call_worklet(worklet, &[])
    }

    fn ensure_locking(&self) -> Result<()> {
        if self.supports_locking {
            Ok(())
        } else {
            Err(WorkletsError::LockingNotSupported(self.name.clone()))
        }
    }

    /// Call a worklet in this runtime's context and drain the jobs it queued
    pub fn run_guarded(&self, worklet: &ShareableWorklet, args: &[Shareable]) -> Result<Shareable> {
        let result = self.context.call_worklet(worklet, args)?;
        self.context.run_pending_jobs()?;
        Ok(result)
    }

    /// Post a worklet onto the home queue and return immediately
    ///
    /// The task holds no strong reference: if the runtime is destroyed before the
    /// task runs, the task is skipped.
    pub fn run_async_guarded(&self, worklet: ShareableWorklet) {
        let weak = self.weak_self.clone();
        let name = self.name.clone();

        self.home_queue.run_on_queue(Box::new(move || {
            let Some(runtime) = weak.upgrade() else {
                debug!(runtime_name = %name, "Skipping task queued on a destroyed runtime");
                return;
            };

            let _section = TraceSection::begin("runAsyncGuarded", &runtime.name);
            if let Err(e) = runtime.run_guarded(&worklet, &[]) {
                runtime.js_scheduler.report_error(&runtime.name, &e);
            }
        }));
    }

    /// The runtime as a shareable value
    pub fn handle(&self) -> Shareable {
        Shareable::new(ShareableValue::WorkletRuntime(self.proxy()))
    }

    /// Non-owning handle exposing `toString()` and `name`
    pub fn proxy(&self) -> RuntimeProxy {
        RuntimeProxy::new(self.weak_self.clone(), self.runtime_id, &self.name)
    }

    pub fn runtime_id(&self) -> u64 {
        self.runtime_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn supports_locking(&self) -> bool {
        self.supports_locking
    }

    pub fn is_dev_bundle(&self) -> bool {
        self.is_dev_bundle
    }

    pub fn engine(&self) -> EngineKind {
        self.engine
    }

    pub fn context(&self) -> &Arc<dyn ExecutionContext> {
        &self.context
    }

    pub fn home_queue(&self) -> &Arc<dyn MessageQueueThread> {
        &self.home_queue
    }
}

impl fmt::Display for WorkletRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[WorkletRuntime \"{}\"]", self.name)
    }
}

impl fmt::Debug for WorkletRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkletRuntime")
            .field("runtime_id", &self.runtime_id)
            .field("name", &self.name)
            .field("supports_locking", &self.supports_locking)
            .field("engine", &self.engine)
            .finish()
    }
}

impl Drop for WorkletRuntime {
    fn drop(&mut self) {
        debug!(runtime_id = self.runtime_id, runtime_name = %self.name, "Worklet runtime destroyed");
    }
}

/// Positional construction API
#[allow(clippy::too_many_arguments)]
pub fn create_runtime(
    runtime_id: u64,
    capability_proxy: Arc<dyn HostObject>,
    home_queue: Arc<dyn MessageQueueThread>,
    js_scheduler: Arc<JsScheduler>,
    name: &str,
    supports_locking: bool,
    is_dev_bundle: bool,
    script: Option<String>,
    source_url: Option<String>,
) -> Result<Arc<WorkletRuntime>> {
    let config = WorkletRuntimeConfig {
        runtime_id,
        name: name.to_string(),
        supports_locking,
        is_dev_bundle,
        engine: EngineKind::default(),
        script,
        source_url,
    };
    WorkletRuntime::new(config, capability_proxy, home_queue, js_scheduler)
}

/// Resolve a live runtime from a runtime value
///
/// # Errors
/// * [`WorkletsError::InvocationType`] if `value` is not a runtime
/// * [`WorkletsError::RuntimeDestroyed`] if the runtime is already gone
pub fn extract_worklet_runtime(value: &Shareable) -> Result<Arc<WorkletRuntime>> {
    let proxy = value.as_runtime_proxy().ok_or_else(|| {
        WorkletsError::invocation_type("[Worklets] Expected a worklet runtime.")
    })?;
    proxy
        .upgrade()
        .ok_or_else(|| WorkletsError::RuntimeDestroyed(proxy.name().to_string()))
}

/// The worklet inside `value`, or an invocation error carrying `message`
pub fn extract_worklet<'a>(value: &'a Shareable, message: &str) -> Result<&'a ShareableWorklet> {
    value
        .as_worklet()
        .ok_or_else(|| WorkletsError::invocation_type(message))
}

/// Schedule `worklet` asynchronously on the runtime `runtime` refers to
pub fn schedule_on_runtime(runtime: &Shareable, worklet: &Shareable) -> Result<()> {
    let runtime = extract_worklet_runtime(runtime)?;
    let worklet = extract_worklet(worklet, SCHEDULE_ON_RUNTIME_ERROR)?;
    runtime.run_async_guarded(worklet.clone());
    Ok(())
}

#[cfg(all(test, feature = "quickjs"))]
mod tests {
    use super::*;
    use crate::collector::is_live;
    use crate::decorator::VALUE_UNPACKER_CODE;
    use crate::queue::DispatchThread;
    use crate::scheduler::ErrorReporter;
    use crate::shareable::CapabilityProxy;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    static NEXT_TEST_ID: AtomicU64 = AtomicU64::new(1000);

    #[derive(Default)]
    struct RecordingReporter {
        fatal: Mutex<Vec<JsErrorRecord>>,
        errors: Mutex<Vec<String>>,
    }

    impl ErrorReporter for RecordingReporter {
        fn report_fatal_error(&self, error: JsErrorRecord) {
            self.fatal.lock().unwrap().push(error);
        }

        fn report_error(&self, _runtime_name: &str, error: &WorkletsError) {
            self.errors.lock().unwrap().push(error.to_string());
        }
    }

    struct Harness {
        main_queue: Arc<DispatchThread>,
        scheduler: Arc<JsScheduler>,
        reporter: Arc<RecordingReporter>,
    }

    impl Harness {
        fn new() -> Self {
            let main_queue = Arc::new(DispatchThread::spawn("main").unwrap());
            let reporter = Arc::new(RecordingReporter::default());
            let scheduler = Arc::new(
                JsScheduler::new(main_queue.clone()).with_error_reporter(reporter.clone()),
            );
            Self {
                main_queue,
                scheduler,
                reporter,
            }
        }

        fn runtime(&self, config: WorkletRuntimeConfig) -> (Arc<WorkletRuntime>, Arc<DispatchThread>) {
            let queue = Arc::new(DispatchThread::spawn(config.name.clone()).unwrap());
            let runtime = WorkletRuntime::new(
                config,
                CapabilityProxy::new().into_host_object(),
                queue.clone(),
                Arc::clone(&self.scheduler),
            )
            .unwrap();
            (runtime, queue)
        }

        fn flush_main(&self) {
            self.main_queue.run_on_queue_sync(Box::new(|| {}));
        }
    }

    fn config(name: &str) -> WorkletRuntimeConfig {
        WorkletRuntimeConfig::new(NEXT_TEST_ID.fetch_add(1, Ordering::Relaxed), name)
    }

    fn worklet(code: &str) -> Shareable {
        Shareable::worklet(ShareableWorklet::new(code))
    }

    #[test]
    fn test_execute_sync_returns_worklet_result() {
        let harness = Harness::new();
        let (runtime, _queue) = harness.runtime(config("ui"));

        let result = runtime.execute_sync(&worklet("function () { return 42; }")).unwrap();
        assert_eq!(result.as_number(), Some(42.0));
    }

    #[test]
    fn test_execute_sync_without_locking_never_runs() {
        let harness = Harness::new();
        let (runtime, _queue) = harness.runtime(config("no-lock").with_locking(false));

        let counter = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&counter);
        let bump = Shareable::host_function("bump", move |_, _| {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(Shareable::undefined())
        });
        let body = ShareableWorklet::new("function () { this.__closure.bump(); return 1; }")
            .with_closure_var("bump", bump);

        let error = runtime.execute_sync(&Shareable::worklet(body)).unwrap_err();
        assert!(matches!(error, WorkletsError::LockingNotSupported(ref name) if name == "no-lock"));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_execute_sync_rejects_non_worklets() {
        let harness = Harness::new();
        let (runtime, _queue) = harness.runtime(config("typed"));

        let error = runtime.execute_sync(&Shareable::number(1.0)).unwrap_err();
        assert_eq!(error.to_string(), EXECUTE_SYNC_ERROR);
    }

    #[test]
    fn test_execute_sync_propagates_errors_and_releases_lock() {
        let harness = Harness::new();
        let (runtime, _queue) = harness.runtime(config("throws"));

        let error = runtime
            .execute_sync(&worklet("function () { throw new RangeError('out of range'); }"))
            .unwrap_err();
        match error {
            WorkletsError::Script(script) => {
                assert_eq!(script.name, "RangeError");
                assert_eq!(script.message, "out of range");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!runtime.runtime_mutex.is_locked());

        // Another thread can still get in
        let other = Arc::clone(&runtime);
        let value = thread::spawn(move || other.execute_sync(&worklet("function () { return 'ok'; }")))
            .join()
            .unwrap()
            .unwrap();
        assert_eq!(value.as_str(), Some("ok"));
    }

    #[test]
    fn test_async_calls_run_in_fifo_order() {
        let harness = Harness::new();
        let (runtime, queue) = harness.runtime(config("fifo"));
        runtime.context().evaluate("globalThis.order = []", "test").unwrap();

        for i in 1..=3 {
            let w = ShareableWorklet::new("function () { globalThis.order.push(this.__closure.i); }")
                .with_closure_var("i", i);
            runtime.run_async_guarded(w);
        }
        queue.run_on_queue_sync(Box::new(|| {}));

        let order = runtime.context().get_global("order").unwrap();
        assert_eq!(order, Shareable::array([Shareable::from(1), Shareable::from(2), Shareable::from(3)]));
    }

    #[test]
    fn test_async_failure_goes_to_reporter() {
        let harness = Harness::new();
        let (runtime, queue) = harness.runtime(config("async-fail"));

        runtime.run_async_guarded(ShareableWorklet::new("function () { throw new Error('async boom'); }"));
        queue.run_on_queue_sync(Box::new(|| {}));

        let errors = harness.reporter.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("async boom"));
    }

    #[test]
    fn test_bootstrap_failure_is_reported_once() {
        let harness = Harness::new();
        let (runtime, _queue) = harness.runtime(
            config("broken").with_script("throw new Error('bundle exploded')", "broken.bundle"),
        );
        harness.flush_main();

        let fatal = harness.reporter.fatal.lock().unwrap();
        assert_eq!(fatal.len(), 1);
        assert_eq!(fatal[0].message, "[Worklets] Failed to initialize runtime. Reason: bundle exploded");
        assert_eq!(fatal[0].name, "WorkletsError");
        assert_eq!(fatal[0].js_engine, "Worklets");
        assert_eq!(runtime.name(), "broken");
        assert_eq!(runtime.proxy().name(), "broken");
    }

    #[test]
    fn test_bootstrap_sentinel_is_success() {
        let harness = Harness::new();
        let script = format!(
            "{}\nthrow new Error('{} (ready)');",
            VALUE_UNPACKER_CODE, BOOTSTRAP_SUCCESS_SENTINEL
        );
        let (runtime, _queue) = harness.runtime(config("bundled").with_script(script, "app.bundle"));
        harness.flush_main();

        assert!(harness.reporter.fatal.lock().unwrap().is_empty());
        let result = runtime.execute_sync(&worklet("function () { return _LABEL; }")).unwrap();
        assert_eq!(result.as_str(), Some("bundled"));
    }

    #[test]
    fn test_materialized_values_are_identity_distinct() {
        let harness = Harness::new();
        let (a, _qa) = harness.runtime(config("a"));
        let (b, _qb) = harness.runtime(config("b"));
        let value = Shareable::object([("list", Shareable::array([Shareable::from(1), Shareable::from(2)]))]);

        for runtime in [&a, &b] {
            runtime.context().set_global("first", &value, false).unwrap();
            runtime.context().set_global("second", &value, false).unwrap();
            let distinct = runtime
                .context()
                .evaluate_value("first !== second && first.list !== second.list", "test")
                .unwrap();
            assert_eq!(distinct.as_bool(), Some(true));
        }

        a.context().evaluate("first.list.push(3)", "test").unwrap();
        assert_eq!(b.context().get_global("first").unwrap(), value);
        assert_ne!(a.context().get_global("first").unwrap(), value);
    }

    #[test]
    fn test_sync_calls_do_not_interleave() {
        let harness = Harness::new();
        let (runtime, _queue) = harness.runtime(config("serial"));
        runtime
            .context()
            .evaluate("globalThis.inside = 0; globalThis.overlaps = 0;", "test")
            .unwrap();

        let sleep = Shareable::host_function("sleep", |_, _| {
            thread::sleep(Duration::from_millis(2));
            Ok(Shareable::undefined())
        });
        let body = ShareableWorklet::new(
            "function () { globalThis.inside++; if (globalThis.inside > 1) globalThis.overlaps++; \
             this.__closure.sleep(); globalThis.inside--; }",
        )
        .with_closure_var("sleep", sleep);
        let body = Shareable::worklet(body);

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let runtime = Arc::clone(&runtime);
                let body = body.clone();
                thread::spawn(move || {
                    for _ in 0..20 {
                        runtime.execute_sync(&body).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(runtime.context().get_global("overlaps").unwrap().as_number(), Some(0.0));
    }

    #[test]
    fn test_sync_and_async_calls_do_not_interleave() {
        let harness = Harness::new();
        let (runtime, queue) = harness.runtime(config("mixed"));
        runtime
            .context()
            .evaluate("globalThis.inside = 0; globalThis.overlaps = 0; globalThis.runs = 0;", "test")
            .unwrap();

        let sleep = Shareable::host_function("sleep", |_, _| {
            thread::sleep(Duration::from_millis(2));
            Ok(Shareable::undefined())
        });
        let body = ShareableWorklet::new(
            "function () { globalThis.inside++; if (globalThis.inside > 1) globalThis.overlaps++; \
             this.__closure.sleep(); globalThis.runs++; globalThis.inside--; }",
        )
        .with_closure_var("sleep", sleep);

        let sync_runtime = Arc::clone(&runtime);
        let sync_body = Shareable::worklet(body.clone());
        let caller = thread::spawn(move || {
            for _ in 0..20 {
                sync_runtime.execute_sync(&sync_body).unwrap();
            }
        });
        for _ in 0..20 {
            runtime.run_async_guarded(body.clone());
        }
        caller.join().unwrap();
        queue.run_on_queue_sync(Box::new(|| {}));

        assert_eq!(runtime.context().get_global("overlaps").unwrap().as_number(), Some(0.0));
        assert_eq!(runtime.context().get_global("runs").unwrap().as_number(), Some(40.0));
        assert!(harness.reporter.errors.lock().unwrap().is_empty());
    }

    #[test]
    fn test_self_reentrant_sync_call_runs_inline() {
        let harness = Harness::new();
        let (runtime, _queue) = harness.runtime(config("reentrant"));

        let inner = ShareableWorklet::new("function () { return 7; }");
        let outer = ShareableWorklet::new(
            "function () { return _executeOnRuntimeSync(this.__closure.self, this.__closure.inner) * 6; }",
        )
        .with_closure_var("self", runtime.handle())
        .with_closure_var("inner", inner);

        let result = runtime.execute_sync(&Shareable::worklet(outer)).unwrap();
        assert_eq!(result.as_number(), Some(42.0));
    }

    #[test]
    fn test_cross_runtime_sync_call() {
        let harness = Harness::new();
        let (ui, _qa) = harness.runtime(config("ui-cross"));
        let (bg, _qb) = harness.runtime(config("bg-cross"));

        let inner = ShareableWorklet::new("function () { return _LABEL; }");
        let outer = ShareableWorklet::new(
            "function () { return _LABEL + '->' + _executeOnRuntimeSync(this.__closure.target, this.__closure.inner); }",
        )
        .with_closure_var("target", bg.handle())
        .with_closure_var("inner", inner);

        let result = ui.execute_sync(&Shareable::worklet(outer)).unwrap();
        assert_eq!(result.as_str(), Some("ui-cross->bg-cross"));
    }

    #[test]
    fn test_schedule_on_runtime_from_script() {
        let harness = Harness::new();
        let (ui, _qa) = harness.runtime(config("ui-sched"));
        let (bg, qb) = harness.runtime(config("bg-sched"));

        let job = ShareableWorklet::new("function () { globalThis.touched = _LABEL; }");
        let outer = ShareableWorklet::new(
            "function () { _scheduleOnRuntime(this.__closure.target, this.__closure.job); return 'queued'; }",
        )
        .with_closure_var("target", bg.handle())
        .with_closure_var("job", job);

        let result = ui.execute_sync(&Shareable::worklet(outer)).unwrap();
        assert_eq!(result.as_str(), Some("queued"));
        qb.run_on_queue_sync(Box::new(|| {}));
        assert_eq!(bg.context().get_global("touched").unwrap().as_str(), Some("bg-sched"));
    }

    #[test]
    fn test_indirect_reentry_is_rejected() {
        let harness = Harness::new();
        let (a, _qa) = harness.runtime(config("reenter-a"));
        let (b, _qb) = harness.runtime(config("reenter-b"));

        let leaf = ShareableWorklet::new("function () { return 'leaf'; }");
        let inner = ShareableWorklet::new(
            "function () { return _executeOnRuntimeSync(this.__closure.back, this.__closure.leaf); }",
        )
        .with_closure_var("back", a.handle())
        .with_closure_var("leaf", leaf);
        let outer = ShareableWorklet::new(
            "function () { return _executeOnRuntimeSync(this.__closure.target, this.__closure.inner); }",
        )
        .with_closure_var("target", b.handle())
        .with_closure_var("inner", inner);

        let error = a.execute_sync(&Shareable::worklet(outer)).unwrap_err().to_string();
        assert!(error.contains("is already entered on this thread"), "{error}");
        assert!(error.contains("reenter-a"), "{error}");
        assert!(!a.runtime_mutex.is_locked());
        assert!(!b.runtime_mutex.is_locked());
        let value = a.execute_sync(&worklet("function () { return _LABEL; }")).unwrap();
        assert_eq!(value.as_str(), Some("reenter-a"));
    }

    #[test]
    fn test_scheduled_job_keeps_host_function_closure() {
        let harness = Harness::new();
        let (ui, _qa) = harness.runtime(config("ui-host-job"));
        let (bg, qb) = harness.runtime(config("bg-host-job"));

        let counter = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&counter);
        let bump = Shareable::host_function("bump", move |_, _| {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(Shareable::undefined())
        });
        let job = ShareableWorklet::new("function () { this.__closure.bump(); }").with_closure_var("bump", bump);
        let outer = ShareableWorklet::new(
            "function () { _scheduleOnRuntime(this.__closure.target, this.__closure.job); }",
        )
        .with_closure_var("target", bg.handle())
        .with_closure_var("job", job);

        ui.execute_sync(&Shareable::worklet(outer)).unwrap();
        qb.run_on_queue_sync(Box::new(|| {}));

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(harness.reporter.errors.lock().unwrap().is_empty());
    }

    #[test]
    fn test_schedule_on_runtime_validates_arguments() {
        let harness = Harness::new();
        let (runtime, _queue) = harness.runtime(config("validate"));

        let error = schedule_on_runtime(&runtime.handle(), &Shareable::from("nope")).unwrap_err();
        assert_eq!(error.to_string(), SCHEDULE_ON_RUNTIME_ERROR);
        let error = schedule_on_runtime(&Shareable::from(1), &worklet("function () {}")).unwrap_err();
        assert!(matches!(error, WorkletsError::InvocationType(_)));
    }

    #[test]
    fn test_runtime_object_surface() {
        let harness = Harness::new();
        let (ui, _qa) = harness.runtime(config("observer"));
        let (target, _qb) = harness.runtime(config("observed"));

        ui.context().set_global("rt", &target.handle(), false).unwrap();
        let surface = ui
            .context()
            .evaluate_value(
                "(function () { var seen = []; for (var k in rt) seen.push(k); \
                 return [rt.toString(), rt.name, Object.keys(rt).join(','), seen.join(','), typeof rt.schedule]; })()",
                "test",
            )
            .unwrap();
        assert_eq!(
            surface,
            Shareable::array([
                Shareable::from("[WorkletRuntime \"observed\"]"),
                Shareable::from("observed"),
                Shareable::from("toString,name"),
                Shareable::from("toString,name"),
                Shareable::from("undefined"),
            ])
        );

        drop(target);
        let after = ui.context().evaluate_value("[rt.toString(), rt.name]", "test").unwrap();
        assert_eq!(after, Shareable::array([Shareable::from(""), Shareable::from("observed")]));
    }

    #[test]
    fn test_queued_task_after_teardown_never_runs() {
        let harness = Harness::new();
        let (runtime, queue) = harness.runtime(config("teardown"));

        let counter = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&counter);
        let bump = Shareable::host_function("bump", move |_, _| {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(Shareable::undefined())
        });

        // Hold the home thread so the task stays queued
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        queue.run_on_queue(Box::new(move || {
            let _ = release_rx.recv();
        }));
        runtime.run_async_guarded(
            ShareableWorklet::new("function () { this.__closure.bump(); }").with_closure_var("bump", bump),
        );

        drop(runtime);
        release_tx.send(()).unwrap();
        queue.run_on_queue_sync(Box::new(|| {}));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_destroyed_runtime_is_unregistered() {
        let harness = Harness::new();
        let (runtime, _queue) = harness.runtime(config("collected-runtime"));
        let id = runtime.runtime_id();
        assert!(is_live(id));

        let handle = runtime.handle();
        drop(runtime);
        assert!(!is_live(id));
        assert!(matches!(extract_worklet_runtime(&handle), Err(WorkletsError::RuntimeDestroyed(_))));
    }

    #[test]
    fn test_config_from_json() {
        let config: WorkletRuntimeConfig =
            serde_json::from_str(r#"{ "runtime_id": 5, "name": "bg", "engine": "quickjs" }"#).unwrap();
        assert_eq!(config, WorkletRuntimeConfig::new(5, "bg"));

        let hermes = WorkletRuntimeConfig::new(6, "h").with_engine(EngineKind::Hermes);
        assert!(matches!(hermes.validate(), Err(WorkletsError::UnsupportedEngine(EngineKind::Hermes))));
    }
}
