//! Host reference bindings for the in-guest bootstrap.
//!
//! The bootstrap is declared as a module in each fresh context; its
//! `install` export is called with the host references (event sink, debug
//! sink, hook invoker), the value-id seed, the parsed hook table, and the
//! entry URL. Everything crossing the boundary is a string, a number, or a
//! value produced by the engine's own JSON bridge.

use rquickjs::convert::Coerced;
use rquickjs::prelude::Rest;
use rquickjs::{Ctx, Exception, Function, Module, Value};

use crate::{EvalError, EvalJob, BOOTSTRAP_MODULE_NAME, BOOTSTRAP_SOURCE};

/// Rust cannot name the lifetime relationship between a closure's `Ctx`
/// argument and its returned `Value` directly; routing the closure through
/// this identity function lets inference tie them together.
fn coerce_fn_signature<F>(f: F) -> F
where
    F: for<'js> Fn(Ctx<'js>, Rest<Value<'js>>) -> rquickjs::Result<Value<'js>>,
{
    f
}

fn engine_err(ctx: &Ctx<'_>, err: rquickjs::Error, what: &str) -> EvalError {
    let detail = if matches!(err, rquickjs::Error::Exception) {
        let thrown = ctx.catch();
        thrown
            .as_object()
            .and_then(|o| o.get::<_, Option<String>>("message").ok().flatten())
            .unwrap_or_else(|| format!("{thrown:?}"))
    } else {
        err.to_string()
    };
    EvalError::Engine(format!("{what}: {detail}"))
}

/// Declare and evaluate the bootstrap module, then call its `install`
/// export with the job's host references. After this returns the context's
/// global object is hijacked and all hooks are in place.
pub(crate) fn install_bootstrap<'js>(ctx: &Ctx<'js>, job: &EvalJob) -> Result<(), EvalError> {
    let declared = Module::declare(ctx.clone(), BOOTSTRAP_MODULE_NAME, BOOTSTRAP_SOURCE)
        .map_err(|e| engine_err(ctx, e, "bootstrap failed to parse"))?;
    let (module, promise) = declared
        .eval()
        .map_err(|e| engine_err(ctx, e, "bootstrap failed to evaluate"))?;
    promise
        .finish::<()>()
        .map_err(|e| engine_err(ctx, e, "bootstrap failed to settle"))?;

    let install: Function = module
        .get("install")
        .map_err(|e| engine_err(ctx, e, "bootstrap has no install export"))?;

    let sink = job.event_sink.clone();
    let emit = coerce_fn_signature(move |ctx, args| {
        let mut args = args.into_inner().into_iter();
        let event = args.next();
        let next_id = args.next().and_then(|v| v.as_number()).unwrap_or(0.0);
        if let Some(event) = event {
            if let Some(json) = ctx.json_stringify(event)? {
                sink(json.to_string()?, next_id as u64);
            }
        }
        Ok(Value::new_undefined(ctx))
    });
    let emit = Function::new(ctx.clone(), emit)
        .and_then(|f| f.with_name("__sandtrapEmit"))
        .map_err(|e| engine_err(ctx, e, "failed to build event sink"))?;

    let debug = job.debug_sink.clone();
    let debug_log = coerce_fn_signature(move |ctx, args| {
        if let Some(message) = args
            .into_inner()
            .into_iter()
            .next()
            .and_then(|v| v.get::<Coerced<String>>().ok())
        {
            debug(message.0);
        }
        Ok(Value::new_undefined(ctx))
    });
    let debug_log = Function::new(ctx.clone(), debug_log)
        .and_then(|f| f.with_name("__sandtrapDebug"))
        .map_err(|e| engine_err(ctx, e, "failed to build debug sink"))?;

    let invoker = job.invoke_hook.clone();
    let invoke = coerce_fn_signature(move |ctx, args| {
        let mut args = args.into_inner().into_iter();
        let index = args.next().and_then(|v| v.as_number()).unwrap_or(-1.0);
        let payload = args
            .next()
            .and_then(|v| v.get::<Coerced<String>>().ok())
            .map(|c| c.0)
            .unwrap_or_else(|| String::from("[]"));
        if !(0.0..=u32::MAX as f64).contains(&index) {
            return Err(Exception::throw_internal(&ctx, "unknown hook index"));
        }
        match invoker(index as u32, payload) {
            Ok(json) => ctx.json_parse(json),
            Err(message) => Err(Exception::throw_message(&ctx, &message)),
        }
    });
    let invoke = Function::new(ctx.clone(), invoke)
        .and_then(|f| f.with_name("__sandtrapInvoke"))
        .map_err(|e| engine_err(ctx, e, "failed to build hook invoker"))?;

    let hooks = ctx
        .json_parse(job.hook_table.as_bytes())
        .map_err(|e| engine_err(ctx, e, "hook table failed to parse"))?;

    install
        .call::<_, ()>((
            emit,
            debug_log,
            invoke,
            job.next_value_id as f64,
            hooks,
            job.entry_url.as_str(),
        ))
        .map_err(|e| engine_err(ctx, e, "bootstrap install failed"))
}
