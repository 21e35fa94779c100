//! Global-scope decoration of worklet runtimes
//!
//! Installs the capability proxy, the runtime identity bindings, logging and the
//! scheduling entry points into a freshly built context.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::scheduler::JsScheduler;
use crate::shareable::{HostObject, Shareable};
use crate::worklet_runtime::{extract_worklet, extract_worklet_runtime, schedule_on_runtime};

/// Built-in script that installs `__valueUnpacker`
pub const VALUE_UNPACKER_CODE: &str = include_str!("glue/value_unpacker.js");

pub const VALUE_UNPACKER_URL: &str = "worklets://value_unpacker.js";

const SCHEDULE_ON_JS_ERROR: &str = "[Worklets] Function passed to `_scheduleOnJS` is not a shareable worklet.";

/// Evaluate the built-in value unpacker in `context`
///
/// Any context that materializes worklets needs it.
pub fn install_value_unpacker(context: &dyn ExecutionContext) -> Result<()> {
    context.evaluate(VALUE_UNPACKER_CODE, VALUE_UNPACKER_URL)
}

/// Identity of the runtime being decorated
pub struct RuntimeIdentity<'a> {
    pub runtime_id: u64,
    pub name: &'a str,
    pub is_dev_bundle: bool,
}

/// Install every global a worklet runtime exposes
///
/// # Arguments
/// * `context` - The runtime's context
/// * `identity` - Runtime id, name and dev flag
/// * `capability_proxy` - Host facilities, bound frozen as `__workletsModuleProxy`
/// * `js_scheduler` - Scheduler used by `_scheduleOnJS`
pub fn decorate(
    context: &dyn ExecutionContext,
    identity: RuntimeIdentity<'_>,
    capability_proxy: Arc<dyn HostObject>,
    js_scheduler: Arc<JsScheduler>,
) -> Result<()> {
    let RuntimeIdentity {
        runtime_id,
        name,
        is_dev_bundle,
    } = identity;

    context.set_global("__workletsModuleProxy", &Shareable::host_object(capability_proxy), true)?;

    context.set_global("_WORKLET", &Shareable::boolean(true), false)?;
    context.set_global("_LABEL", &Shareable::string(name), false)?;
    context.set_global("_RUNTIME_ID", &Shareable::number(runtime_id as f64), false)?;
    context.set_global("__DEV__", &Shareable::boolean(is_dev_bundle), false)?;

    install_console(context, runtime_id, name)?;
    install_scheduling(context, js_scheduler)?;

    debug!(runtime_id = runtime_id, runtime_name = name, "Runtime globals installed");
    Ok(())
}

#[derive(Clone, Copy)]
enum ConsoleLevel {
    Debug,
    Info,
    Warn,
    Error,
}

fn console_function(level: ConsoleLevel, runtime_id: u64, runtime_name: &str) -> Shareable {
    let runtime_name: Arc<str> = runtime_name.into();
    Shareable::host_function("log", move |_, args| {
        let message = args.iter().map(|arg| arg.to_string()).collect::<Vec<_>>().join(" ");
        let runtime_name = runtime_name.as_ref();
        match level {
            ConsoleLevel::Debug => debug!(target: "worklets::console", runtime_id, runtime_name, "{}", message),
            ConsoleLevel::Info => info!(target: "worklets::console", runtime_id, runtime_name, "{}", message),
            ConsoleLevel::Warn => warn!(target: "worklets::console", runtime_id, runtime_name, "{}", message),
            ConsoleLevel::Error => error!(target: "worklets::console", runtime_id, runtime_name, "{}", message),
        }
        Ok(Shareable::undefined())
    })
}

fn install_console(context: &dyn ExecutionContext, runtime_id: u64, name: &str) -> Result<()> {
    context.set_global("_log", &console_function(ConsoleLevel::Info, runtime_id, name), false)?;

    let console = Shareable::object([
        ("log", console_function(ConsoleLevel::Info, runtime_id, name)),
        ("info", console_function(ConsoleLevel::Info, runtime_id, name)),
        ("warn", console_function(ConsoleLevel::Warn, runtime_id, name)),
        ("error", console_function(ConsoleLevel::Error, runtime_id, name)),
        ("debug", console_function(ConsoleLevel::Debug, runtime_id, name)),
    ]);
    context.set_global("console", &console, false)
}

fn install_scheduling(context: &dyn ExecutionContext, js_scheduler: Arc<JsScheduler>) -> Result<()> {
    // _scheduleOnJS(worklet, ...args)
    let schedule_on_js = Shareable::host_function("_scheduleOnJS", move |_, mut args| {
        if args.is_empty() {
            args.push(Shareable::undefined());
        }
        let rest = args.split_off(1);
        let worklet = extract_worklet(&args[0], SCHEDULE_ON_JS_ERROR)?;
        js_scheduler.schedule_worklet_on_js(worklet.clone(), rest)?;
        Ok(Shareable::undefined())
    });
    context.set_global("_scheduleOnJS", &schedule_on_js, false)?;

    // _scheduleOnRuntime(runtime, worklet)
    let schedule = Shareable::host_function("_scheduleOnRuntime", |_, args| {
        let runtime = args.first().cloned().unwrap_or_default();
        let worklet = args.get(1).cloned().unwrap_or_default();
        schedule_on_runtime(&runtime, &worklet)?;
        Ok(Shareable::undefined())
    });
    context.set_global("_scheduleOnRuntime", &schedule, false)?;

    // _executeOnRuntimeSync(runtime, worklet)
    let execute_sync = Shareable::host_function("_executeOnRuntimeSync", |scope, args| {
        let runtime = args.first().cloned().unwrap_or_default();
        let worklet = args.get(1).cloned().unwrap_or_default();
        extract_worklet_runtime(&runtime)?.execute_sync_in(scope, &worklet)
    });
    context.set_global("_executeOnRuntimeSync", &execute_sync, false)
}

#[cfg(all(test, feature = "quickjs"))]
mod tests {
    use super::*;
    use crate::context::{RuntimeMutex, make_context};
    use crate::engine::EngineKind;
    use crate::queue::DispatchThread;
    use crate::shareable::{CapabilityProxy, ShareableKind};

    fn decorated(name: &str, dev: bool) -> Arc<dyn ExecutionContext> {
        let mutex = Arc::new(RuntimeMutex::new(()));
        let context = make_context(EngineKind::QuickJs, name, false, &mutex).unwrap();
        install_value_unpacker(context.as_ref()).unwrap();

        let queue = Arc::new(DispatchThread::spawn("decorator-main").unwrap());
        let scheduler = Arc::new(JsScheduler::new(queue));
        let proxy = CapabilityProxy::new()
            .with_value("platform", "test")
            .with_function("double", |_, args| {
                let n = args.first().and_then(Shareable::as_number).unwrap_or(0.0);
                Ok(Shareable::number(n * 2.0))
            })
            .into_host_object();

        let identity = RuntimeIdentity {
            runtime_id: 3,
            name,
            is_dev_bundle: dev,
        };
        decorate(context.as_ref(), identity, proxy, scheduler).unwrap();
        context
    }

    #[test]
    fn test_identity_globals() {
        let context = decorated("ui", true);
        let globals = context
            .evaluate_value("[_WORKLET, _LABEL, _RUNTIME_ID, __DEV__]", "test")
            .unwrap();
        assert_eq!(
            globals,
            Shareable::array([
                Shareable::from(true),
                Shareable::from("ui"),
                Shareable::from(3),
                Shareable::from(true),
            ])
        );
    }

    #[test]
    fn test_module_proxy_is_frozen_and_callable() {
        let context = decorated("proxy", false);
        let result = context
            .evaluate_value(
                "[Object.isFrozen(__workletsModuleProxy), __workletsModuleProxy.platform, __workletsModuleProxy.double(21)]",
                "test",
            )
            .unwrap();
        assert_eq!(
            result,
            Shareable::array([Shareable::from(true), Shareable::from("test"), Shareable::from(42)])
        );
    }

    #[test]
    fn test_module_proxy_can_be_passed_back_to_the_host() {
        let context = decorated("proxy-capture", false);
        let captured = context.get_global("__workletsModuleProxy").unwrap();
        assert_eq!(captured.kind(), ShareableKind::HostObject);

        let double = context.evaluate_value("__workletsModuleProxy.double", "test").unwrap();
        assert_eq!(double.kind(), ShareableKind::HostFunction);
    }

    #[test]
    fn test_console_is_available() {
        let context = decorated("console", false);
        context
            .evaluate("console.log('hello', 1, { a: true }); console.error('bad'); _log('raw')", "test")
            .unwrap();
    }

    #[test]
    fn test_schedule_on_js_rejects_plain_values() {
        let context = decorated("schedule", false);
        let caught = context
            .evaluate_value("(function () { try { _scheduleOnJS(5); } catch (e) { return e.message; } })()", "test")
            .unwrap();
        assert_eq!(caught.as_str(), Some(SCHEDULE_ON_JS_ERROR));
    }
}
