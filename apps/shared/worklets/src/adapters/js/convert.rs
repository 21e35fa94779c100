//! Conversion between shareables and QuickJS values
//!
//! `to_js` materializes a shareable into a context, always building a new native
//! value. `capture` goes the other way. Errors cross the boundary as native
//! `Error` objects (`throw_error`) and are read back with `catch_error`.

use rquickjs::class::JsClass;
use rquickjs::function::{Constructor, Rest};
use rquickjs::object::Property;
use rquickjs::{Array, ArrayBuffer, Class, Ctx, Function, IntoJs, Object, Value};

use crate::error::{Result, ScriptError, WorkletsError};
use crate::proxy::RUNTIME_PROPERTY_NAMES;
use crate::shareable::{MAX_CAPTURE_DEPTH, Shareable, ShareableValue, ShareableWorklet};

use super::runtime::{ContextInfo, HostFunctionTag, HostObjectTag, QuickJsScope, WorkletRuntimeObject};

/// Global installed by the value-unpacker glue
pub const VALUE_UNPACKER_GLOBAL: &str = "__valueUnpacker";

/// Hidden property linking a native function back to its host function
const HOST_FUNCTION_TAG: &str = "__hostFunction";

/// Hidden property linking a native snapshot back to its host object
const HOST_OBJECT_TAG: &str = "__hostObject";

/// Materialize a shareable into `ctx`
///
/// # Arguments
/// * `ctx` - The entered context
/// * `owner` - Identity of that context, handed to host functions as their scope
/// * `value` - The value to materialize
pub(crate) fn to_js<'js>(ctx: &Ctx<'js>, owner: &ContextInfo, value: &Shareable) -> rquickjs::Result<Value<'js>> {
    match value.value() {
        ShareableValue::Undefined => Ok(Value::new_undefined(ctx.clone())),
        ShareableValue::Null => Ok(Value::new_null(ctx.clone())),
        ShareableValue::Boolean(b) => (*b).into_js(ctx),
        ShareableValue::Number(n) => (*n).into_js(ctx),
        ShareableValue::String(s) => s.as_str().into_js(ctx),
        ShareableValue::Array(items) => {
            let array = Array::new(ctx.clone())?;
            for (i, item) in items.iter().enumerate() {
                array.set(i, to_js(ctx, owner, item)?)?;
            }
            array.into_js(ctx)
        }
        ShareableValue::Object(entries) => {
            let object = Object::new(ctx.clone())?;
            for (key, item) in entries {
                object.set(key.as_str(), to_js(ctx, owner, item)?)?;
            }
            Ok(object.into_value())
        }
        ShareableValue::ArrayBuffer(bytes) => ArrayBuffer::new_copy(ctx.clone(), bytes.as_slice())?.into_js(ctx),
        ShareableValue::Worklet(worklet) => Ok(materialize_worklet(ctx, owner, worklet)?.into_value()),
        ShareableValue::WorkletRuntime(proxy) => {
            let instance = Class::instance(ctx.clone(), WorkletRuntimeObject::new(proxy.clone()))?.into_js(ctx)?;
            if let Some(object) = instance.as_object() {
                for member in RUNTIME_PROPERTY_NAMES {
                    let native = to_js(ctx, owner, &proxy.get(member))?;
                    object.prop(member, Property::from(native).enumerable())?;
                }
            }
            Ok(instance)
        }
        ShareableValue::HostObject(host) => {
            let object = Object::new(ctx.clone())?;
            for name in host.property_names() {
                object.set(name.as_str(), to_js(ctx, owner, &host.get(&name))?)?;
            }
            let tag = Class::instance(ctx.clone(), HostObjectTag { object: host.clone() })?;
            object.prop(HOST_OBJECT_TAG, Property::from(tag))?;
            Ok(object.into_value())
        }
        ShareableValue::HostFunction(function) => {
            let host_fn = function.clone();
            let owner = owner.clone();
            let func = Function::new(ctx.clone(), move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<Value<'js>> {
                let captured = args
                    .0
                    .iter()
                    .map(|arg| capture(&ctx, arg))
                    .collect::<Result<Vec<_>>>()
                    .map_err(|e| throw_error(&ctx, &e))?;

                let scope = QuickJsScope::new(&ctx, &owner);
                let result = host_fn.call(&scope, captured).map_err(|e| throw_error(&ctx, &e))?;
                to_js(&ctx, &owner, &result)
            })?;
            let tag = Class::instance(ctx.clone(), HostFunctionTag { function: function.clone() })?;
            func.prop(HOST_FUNCTION_TAG, Property::from(tag))?;
            Ok(func.into_value())
        }
    }
}

/// Rebuild a worklet as a native function through the value unpacker
pub(crate) fn materialize_worklet<'js>(
    ctx: &Ctx<'js>,
    owner: &ContextInfo,
    worklet: &ShareableWorklet,
) -> rquickjs::Result<Function<'js>> {
    let unpacker: Option<Function> = ctx.globals().get(VALUE_UNPACKER_GLOBAL)?;
    let Some(unpacker) = unpacker else {
        let error = WorkletsError::Engine(format!(
            "Value unpacker is not installed in context \"{}\"",
            owner.name
        ));
        return Err(throw_error(ctx, &error));
    };

    let closure = to_js(ctx, owner, &worklet.closure_object())?;
    unpacker.call((worklet.code(), closure, worklet.location()))
}

/// Call a worklet inside an entered context and capture its result
pub(crate) fn call_worklet_in<'js>(
    ctx: &Ctx<'js>,
    owner: &ContextInfo,
    worklet: &ShareableWorklet,
    args: &[Shareable],
) -> Result<Shareable> {
    let outcome = (|| {
        let func = materialize_worklet(ctx, owner, worklet)?;
        let js_args = args
            .iter()
            .map(|arg| to_js(ctx, owner, arg))
            .collect::<rquickjs::Result<Vec<_>>>()?;
        func.call::<_, Value>((Rest(js_args),))
    })();

    match outcome {
        Ok(result) => capture(ctx, &result),
        Err(e) => Err(catch_error(ctx, e)),
    }
}

/// Capture a native value as a shareable
///
/// # Errors
/// Returns an invocation type error for plain (non-worklet) functions, symbols
/// and values nested deeper than [`MAX_CAPTURE_DEPTH`]
pub(crate) fn capture<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> Result<Shareable> {
    capture_at(ctx, value, 0)
}

fn capture_at<'js>(ctx: &Ctx<'js>, value: &Value<'js>, depth: usize) -> Result<Shareable> {
    if depth > MAX_CAPTURE_DEPTH {
        return Err(WorkletsError::invocation_type(format!(
            "[Worklets] Value is nested deeper than {} levels and cannot be shared.",
            MAX_CAPTURE_DEPTH
        )));
    }

    if value.is_undefined() {
        return Ok(Shareable::undefined());
    }
    if value.is_null() {
        return Ok(Shareable::null());
    }
    if let Some(b) = value.as_bool() {
        return Ok(Shareable::boolean(b));
    }
    if let Some(n) = value.as_number() {
        return Ok(Shareable::number(n));
    }
    if let Some(s) = value.as_string() {
        let s = s.to_string().map_err(|e| catch_error(ctx, e))?;
        return Ok(Shareable::string(s));
    }
    if let Some(array) = value.as_array() {
        let mut items = Vec::with_capacity(array.len());
        for item in array.iter::<Value>() {
            let item = item.map_err(|e| catch_error(ctx, e))?;
            items.push(capture_at(ctx, &item, depth + 1)?);
        }
        return Ok(Shareable::array(items));
    }
    if value.is_function() {
        if let Some(tag) = tag_of::<HostFunctionTag>(value, HOST_FUNCTION_TAG) {
            return Ok(Shareable::new(ShareableValue::HostFunction(tag.borrow().function.clone())));
        }
        return capture_worklet(ctx, value, depth);
    }
    if let Ok(runtime) = value.get::<Class<WorkletRuntimeObject>>() {
        return Ok(Shareable::new(ShareableValue::WorkletRuntime(runtime.borrow().proxy().clone())));
    }
    if let Ok(buffer) = value.get::<ArrayBuffer>() {
        let bytes = buffer.as_bytes().map(<[u8]>::to_vec).unwrap_or_default();
        return Ok(Shareable::array_buffer(bytes));
    }
    if let Some(tag) = tag_of::<HostObjectTag>(value, HOST_OBJECT_TAG) {
        return Ok(Shareable::host_object(tag.borrow().object.clone()));
    }
    if let Some(object) = value.as_object() {
        let mut entries = Vec::new();
        for key in object.keys::<String>() {
            let key = key.map_err(|e| catch_error(ctx, e))?;
            let item: Value = object.get(key.as_str()).map_err(|e| catch_error(ctx, e))?;
            entries.push((key, capture_at(ctx, &item, depth + 1)?));
        }
        return Ok(Shareable::object(entries));
    }

    Err(WorkletsError::invocation_type(format!(
        "[Worklets] Values of type '{}' cannot be shared between runtimes.",
        value.type_name()
    )))
}

/// The class instance stored under the hidden property `key`, if any
fn tag_of<'js, C: JsClass<'js>>(value: &Value<'js>, key: &str) -> Option<Class<'js, C>> {
    let object = value.as_object()?;
    object.get::<_, Option<Class<'js, C>>>(key).ok().flatten()
}

fn capture_worklet<'js>(ctx: &Ctx<'js>, value: &Value<'js>, depth: usize) -> Result<Shareable> {
    let not_a_worklet = || {
        WorkletsError::invocation_type(
            "[Worklets] Only worklets can be shared between runtimes, got a plain function.",
        )
    };

    let func = value.as_object().ok_or_else(not_a_worklet)?;
    let init_data: Option<Object> = func.get("__initData").ok().flatten();
    let init_data = init_data.ok_or_else(not_a_worklet)?;
    let code: Option<String> = init_data.get("code").ok().flatten();
    let code = code.ok_or_else(not_a_worklet)?;
    let location: Option<String> = init_data.get("location").ok().flatten();

    let mut worklet = ShareableWorklet::new(code);
    if let Some(location) = location {
        worklet = worklet.with_location(location);
    }

    let closure: Value = func.get("__closure").map_err(|e| catch_error(ctx, e))?;
    let closure = capture_at(ctx, &closure, depth + 1)?;
    if let ShareableValue::Object(entries) = closure.value() {
        for (name, item) in entries {
            worklet = worklet.with_closure_var(name.clone(), item.clone());
        }
    }

    Ok(Shareable::worklet(worklet))
}

/// Throw `error` into `ctx` as a native `Error` carrying name, message and stack
pub(crate) fn throw_error<'js>(ctx: &Ctx<'js>, error: &WorkletsError) -> rquickjs::Error {
    let script = error.to_script_error();
    match build_error(ctx, &script) {
        Ok(value) => ctx.throw(value),
        Err(e) => e,
    }
}

fn build_error<'js>(ctx: &Ctx<'js>, error: &ScriptError) -> rquickjs::Result<Value<'js>> {
    let globals = ctx.globals();
    // Keep the native error type (RangeError, TypeError, ...) when the context has it
    let native: Option<Constructor> = if error.name.ends_with("Error") {
        globals.get(error.name.as_str()).ok().flatten()
    } else {
        None
    };
    let constructor = match native {
        Some(constructor) => constructor,
        None => globals.get("Error")?,
    };
    let object: Object = constructor.construct((error.message.as_str(),))?;
    object.set("name", error.name.as_str())?;
    if let Some(stack) = &error.stack {
        object.set("stack", stack.as_str())?;
    }
    Ok(object.into_value())
}

/// Convert an engine error, taking the pending exception if there is one
pub(crate) fn catch_error(ctx: &Ctx<'_>, error: rquickjs::Error) -> WorkletsError {
    if !matches!(error, rquickjs::Error::Exception) {
        return WorkletsError::Engine(error.to_string());
    }
    WorkletsError::Script(exception_to_script_error(&ctx.catch()))
}

pub(crate) fn exception_to_script_error(exception: &Value<'_>) -> ScriptError {
    if let Some(object) = exception.as_object() {
        let name: Option<String> = object.get("name").ok().flatten();
        let message: Option<String> = object.get("message").ok().flatten();
        let stack: Option<String> = object.get("stack").ok().flatten();

        let error = ScriptError::new(name.unwrap_or_else(|| "Error".to_string()), message.unwrap_or_default());
        return match stack {
            Some(stack) if !stack.is_empty() => error.with_stack(stack),
            _ => error,
        };
    }

    if let Some(s) = exception.as_string() {
        if let Ok(message) = s.to_string() {
            return ScriptError::new("Error", message);
        }
    }
    if let Some(n) = exception.as_number() {
        return ScriptError::new("Error", Shareable::number(n).to_string());
    }

    ScriptError::new("Error", "Unknown JavaScript error")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};

    #[test]
    fn test_exception_keeps_name_and_stack() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(|ctx| {
            let thrown: Value = ctx
                .eval("(function () { try { throw new RangeError('late'); } catch (e) { return e; } })()")
                .unwrap();
            let error = exception_to_script_error(&thrown);
            assert_eq!(error.name, "RangeError");
            assert_eq!(error.message, "late");
            assert!(error.stack.is_some());

            let plain: Value = ctx.eval("'just text'").unwrap();
            assert_eq!(exception_to_script_error(&plain), ScriptError::new("Error", "just text"));
        });
    }
}
