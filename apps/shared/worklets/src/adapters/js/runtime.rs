use std::cell::RefCell;
use std::sync::Arc;

use rquickjs::class::Trace;
use rquickjs::{Context, Ctx, Function, JsLifetime, Object, Runtime, Value};
use tracing::{debug, trace};

use crate::context::{ContextId, ExecutionContext, Scope};
use crate::engine::EngineKind;
use crate::error::{Result, WorkletsError};
use crate::proxy::RuntimeProxy;
use crate::shareable::{HostFunction, HostObject, Shareable, ShareableWorklet};

use super::convert::{call_worklet_in, capture, catch_error, exception_to_script_error, to_js};

thread_local! {
    /// Contexts entered on this thread, innermost last
    static ENTERED: RefCell<Vec<ContextId>> = const { RefCell::new(Vec::new()) };
}

/// Marks a context as entered on the current thread until dropped
struct EntryGuard(ContextId);

impl EntryGuard {
    fn acquire(info: &ContextInfo) -> Result<Self> {
        ENTERED.with(|entered| {
            let mut entered = entered.borrow_mut();
            if entered.contains(&info.id) {
                return Err(WorkletsError::ReentrantEntry(info.name.to_string()));
            }
            entered.push(info.id);
            Ok(EntryGuard(info.id))
        })
    }
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        ENTERED.with(|entered| {
            let mut entered = entered.borrow_mut();
            if let Some(pos) = entered.iter().rposition(|id| *id == self.0) {
                entered.remove(pos);
            }
        });
    }
}

/// Identity of a QuickJS context, carried into every host function it materializes
#[derive(Debug, Clone)]
pub(crate) struct ContextInfo {
    pub id: ContextId,
    pub name: Arc<str>,
}

/// Execution context backed by a dedicated QuickJS runtime
///
/// Each context owns its own `rquickjs::Runtime`, so two contexts never share a
/// heap or an engine lock.
pub struct QuickJsContext {
    context: Context,
    runtime: Runtime,
    info: ContextInfo,
}

impl QuickJsContext {
    /// Create a new context with the full set of QuickJS intrinsics
    ///
    /// # Arguments
    /// * `name` - Display/debug name of the context
    pub fn new(name: &str) -> Result<Self> {
        let runtime = Runtime::new().map_err(|e| WorkletsError::Engine(e.to_string()))?;
        let context = Context::full(&runtime).map_err(|e| WorkletsError::Engine(e.to_string()))?;

        Ok(Self {
            context,
            runtime,
            info: ContextInfo {
                id: ContextId::next(),
                name: name.into(),
            },
        })
    }

    /// Run `f` inside the context
    ///
    /// # Errors
    /// Returns [`WorkletsError::ReentrantEntry`] if this thread is already inside the context
    fn enter<F, R>(&self, f: F) -> Result<R>
    where
        F: for<'js> FnOnce(&Ctx<'js>, &ContextInfo) -> Result<R> + Send,
        R: Send,
    {
        let _entry = EntryGuard::acquire(&self.info)?;
        let info = &self.info;
        self.context.with(|ctx| f(&ctx, info))
    }
}

impl ExecutionContext for QuickJsContext {
    fn id(&self) -> ContextId {
        self.info.id
    }

    fn name(&self) -> &str {
        &self.info.name
    }

    fn engine(&self) -> EngineKind {
        EngineKind::QuickJs
    }

    fn evaluate(&self, source: &str, source_url: &str) -> Result<()> {
        trace!("Evaluating '{}' in {}", source_url, self.info.id);
        self.enter(|ctx, _| ctx.eval::<(), _>(source).map_err(|e| catch_error(ctx, e)))
    }

    fn evaluate_value(&self, source: &str, source_url: &str) -> Result<Shareable> {
        trace!("Evaluating '{}' in {}", source_url, self.info.id);
        self.enter(|ctx, _| {
            let value: Value = ctx.eval(source).map_err(|e| catch_error(ctx, e))?;
            capture(ctx, &value)
        })
    }

    fn set_global(&self, name: &str, value: &Shareable, frozen: bool) -> Result<()> {
        self.enter(|ctx, info| {
            let bind = || -> rquickjs::Result<()> {
                let native = to_js(ctx, info, value)?;
                if frozen && native.is_object() {
                    let object: Object = ctx.globals().get("Object")?;
                    let freeze: Function = object.get("freeze")?;
                    freeze.call::<_, Value>((native.clone(),))?;
                }
                ctx.globals().set(name, native)
            };
            bind().map_err(|e| catch_error(ctx, e))
        })
    }

    fn get_global(&self, name: &str) -> Result<Shareable> {
        self.enter(|ctx, _| {
            let value: Value = ctx.globals().get(name).map_err(|e| catch_error(ctx, e))?;
            capture(ctx, &value)
        })
    }

    fn call_worklet(&self, worklet: &ShareableWorklet, args: &[Shareable]) -> Result<Shareable> {
        self.enter(|ctx, info| call_worklet_in(ctx, info, worklet, args))
    }

    fn run_pending_jobs(&self) -> Result<usize> {
        let _entry = EntryGuard::acquire(&self.info)?;
        let mut executed = 0;
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => executed += 1,
                Ok(false) => break,
                Err(job) => {
                    let error = job.0.with(|ctx| exception_to_script_error(&ctx.catch()));
                    return Err(WorkletsError::Script(error));
                }
            }
        }
        if executed > 0 {
            debug!("Ran {} pending jobs in {}", executed, self.info.id);
        }
        Ok(executed)
    }
}

/// Scope handed to host functions called from a QuickJS context
pub(crate) struct QuickJsScope<'a, 'js> {
    ctx: &'a Ctx<'js>,
    info: &'a ContextInfo,
}

impl<'a, 'js> QuickJsScope<'a, 'js> {
    pub(crate) fn new(ctx: &'a Ctx<'js>, info: &'a ContextInfo) -> Self {
        Self { ctx, info }
    }
}

impl Scope for QuickJsScope<'_, '_> {
    fn context_id(&self) -> ContextId {
        self.info.id
    }

    fn context_name(&self) -> &str {
        &self.info.name
    }

    fn evaluate_value(&self, source: &str, _source_url: &str) -> Result<Shareable> {
        let value: Value = self.ctx.eval(source).map_err(|e| catch_error(self.ctx, e))?;
        capture(self.ctx, &value)
    }

    fn call_worklet(&self, worklet: &ShareableWorklet, args: &[Shareable]) -> Result<Shareable> {
        call_worklet_in(self.ctx, self.info, worklet, args)
    }
}

/// A worklet runtime observed from script
///
/// Carries the runtime proxy so the value can be captured again. Its members
/// (`toString` and `name`) are defined as own enumerable properties when the
/// instance is materialized.
#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct WorkletRuntimeObject {
    #[qjs(skip_trace)]
    proxy: RuntimeProxy,
}

impl WorkletRuntimeObject {
    pub(crate) fn new(proxy: RuntimeProxy) -> Self {
        Self { proxy }
    }

    pub(crate) fn proxy(&self) -> &RuntimeProxy {
        &self.proxy
    }
}

/// Identity of a host function, kept on the native function that wraps it
#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub(crate) struct HostFunctionTag {
    #[qjs(skip_trace)]
    pub(crate) function: HostFunction,
}

/// Identity of a host object, kept on its native snapshot
#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub(crate) struct HostObjectTag {
    #[qjs(skip_trace)]
    pub(crate) object: Arc<dyn HostObject>,
}
