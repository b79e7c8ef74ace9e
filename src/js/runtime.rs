use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result};
use rquickjs::prelude::Opt;
use rquickjs::{Context, Ctx, Error as JsError, Function, IntoJs, Runtime, Value};
use serde_json::Value as JsonValue;

use super::exception::RawFault;
use super::{HostBindings, ScriptEngine};

const MAX_JOBS: usize = 1000;

/// JavaScript engine backed by QuickJS.
///
/// Owns the QuickJS runtime and context for one frame. Console output is
/// forwarded to `tracing`, host bindings are installed as `__viewhost_*`
/// globals and the runtime is interrupted as soon as the abort flag is set.
pub struct QuickJsEngine {
    runtime: Runtime,
    context: Context,
    async_faults: Vec<RawFault>,
}

impl QuickJsEngine {
    /// Create a bare engine with console forwarding only.
    pub fn new() -> Result<Self> {
        let runtime = Runtime::new().context("failed to create QuickJS runtime")?;
        let context = Context::full(&runtime).context("failed to create QuickJS context")?;
        let engine = Self {
            runtime,
            context,
            async_faults: Vec::new(),
        };
        engine.init_console()?;
        Ok(engine)
    }

    /// Create an engine for `frame` wired to the host and interruptible
    /// through `abort`.
    pub fn with_host(
        frame: &str,
        bindings: Arc<dyn HostBindings>,
        abort: Arc<AtomicBool>,
    ) -> Result<Self> {
        let engine = Self::new()?;
        engine
            .runtime
            .set_interrupt_handler(Some(Box::new(move || abort.load(Ordering::SeqCst))));
        engine.install_host_bindings(frame, bindings)?;
        Ok(engine)
    }

    /// Provide access to the underlying QuickJS context for advanced integrations.
    pub fn with_context<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'js> FnOnce(Ctx<'js>) -> rquickjs::Result<T>,
    {
        self.context.with(f).map_err(anyhow::Error::from)
    }

    /// Run queued promise jobs. Job failures are kept as asynchronous faults.
    fn execute_pending_jobs(&mut self) {
        let mut job_count = 0;

        while self.runtime.is_job_pending() {
            match self.runtime.execute_pending_job() {
                Ok(true) => {
                    job_count += 1;
                    if job_count >= MAX_JOBS {
                        tracing::warn!(
                            target: "quickjs",
                            "Stopped processing jobs after {} iterations (possible infinite loop)",
                            MAX_JOBS
                        );
                        break;
                    }
                }
                Ok(false) => break,
                Err(_) => {
                    let fault = self.context.with(|ctx| capture_fault(&ctx));
                    tracing::debug!(target: "quickjs", payload = %fault.payload, "job failed");
                    self.async_faults.push(fault);
                }
            }
        }

        if job_count > 0 {
            tracing::trace!(target: "quickjs", "Executed {} pending jobs", job_count);
        }
    }

    fn init_console(&self) -> Result<()> {
        self.context
            .with(|ctx| {
                let global = ctx.globals();
                let log_fn =
                    Function::new(ctx.clone(), log_from_js)?.with_name("__viewhost_log")?;
                global.set("__viewhost_log", log_fn)?;
                ctx.eval::<(), _>(CONSOLE_BOOTSTRAP.as_bytes())
            })
            .map_err(anyhow::Error::from)
    }

    fn install_host_bindings(&self, frame: &str, bindings: Arc<dyn HostBindings>) -> Result<()> {
        let frame = frame.to_string();
        self.with_context(|ctx| {
            let global = ctx.globals();
            global.set("__viewhost_frame", frame.clone())?;

            {
                let host = Arc::clone(&bindings);
                let func = Function::new(
                    ctx.clone(),
                    move |event: String, args: Opt<String>| -> rquickjs::Result<()> {
                        host.notify(&event, parse_args(args.0.as_deref()));
                        Ok(())
                    },
                )?
                .with_name("__viewhost_notify")?;
                global.set("__viewhost_notify", func)?;
            }

            {
                let host = Arc::clone(&bindings);
                let func = Function::new(ctx.clone(), move |name: String| -> bool {
                    host.has_object(&name)
                })?
                .with_name("__viewhost_has_object")?;
                global.set("__viewhost_has_object", func)?;
            }

            {
                let host = Arc::clone(&bindings);
                let func = Function::new(
                    ctx.clone(),
                    move |ctx: Ctx<'_>,
                          object: String,
                          method: String,
                          args: Opt<String>|
                          -> rquickjs::Result<Option<String>> {
                        let args = parse_args(args.0.as_deref());
                        match host.call(&object, &method, args) {
                            Ok(Some(value)) => Ok(Some(value.to_string())),
                            Ok(None) => Ok(None),
                            Err(err) => throw_error(&ctx, format!("{object}.{method}: {err:#}")),
                        }
                    },
                )?
                .with_name("__viewhost_call")?;
                global.set("__viewhost_call", func)?;
            }

            {
                let host = Arc::clone(&bindings);
                let frame = frame.clone();
                let func = Function::new(
                    ctx.clone(),
                    move |ctx: Ctx<'_>,
                          path: String,
                          view: Opt<String>|
                          -> rquickjs::Result<Option<String>> {
                        let view = view.0.unwrap_or_else(|| frame.clone());
                        match host.resolve(&view, &path) {
                            Ok(content) => Ok(content),
                            Err(err) => throw_error(&ctx, format!("failed to load '{path}': {err:#}")),
                        }
                    },
                )?
                .with_name("__viewhost_resolve")?;
                global.set("__viewhost_resolve", func)?;
            }

            {
                let host = Arc::clone(&bindings);
                let func = Function::new(ctx.clone(), move |key: String| -> Option<String> {
                    host.cache_get(&key)
                })?
                .with_name("__viewhost_cache_get")?;
                global.set("__viewhost_cache_get", func)?;
            }

            {
                let host = Arc::clone(&bindings);
                let func = Function::new(
                    ctx.clone(),
                    move |source: String, hash: String, markup: String, capacity: f64| {
                        host.cache_store(&source, &hash, &markup, capacity.max(0.0) as usize);
                    },
                )?
                .with_name("__viewhost_cache_store")?;
                global.set("__viewhost_cache_store", func)?;
            }

            {
                let host = Arc::clone(&bindings);
                let func = Function::new(ctx.clone(), move |payload: String| {
                    host.report_error(RawFault::new(payload));
                })?
                .with_name("__viewhost_report_error")?;
                global.set("__viewhost_report_error", func)?;
            }

            Ok(())
        })
    }
}

impl ScriptEngine for QuickJsEngine {
    fn evaluate(&mut self, script: &str) -> Result<Option<String>, RawFault> {
        let result = self.context.with(|ctx| match ctx.eval::<Value, _>(script.as_bytes()) {
            Ok(value) => completion_json(&ctx, value),
            Err(JsError::Exception) => Err(capture_fault(&ctx)),
            Err(err) => Err(RawFault::new(err.to_string())),
        });

        self.execute_pending_jobs();
        result
    }

    fn take_async_faults(&mut self) -> Vec<RawFault> {
        std::mem::take(&mut self.async_faults)
    }
}

fn completion_json<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> Result<Option<String>, RawFault> {
    if value.is_undefined() {
        return Ok(None);
    }
    let rendered = match ctx.json_stringify(value) {
        Ok(rendered) => rendered,
        Err(JsError::Exception) => return Err(capture_fault(ctx)),
        Err(err) => return Err(RawFault::new(err.to_string())),
    };
    match rendered {
        Some(text) => text
            .to_string()
            .map(Some)
            .map_err(|err| RawFault::new(err.to_string())),
        None => Ok(None),
    }
}

fn parse_args(args: Option<&str>) -> Vec<JsonValue> {
    match args.map(serde_json::from_str::<JsonValue>) {
        Some(Ok(JsonValue::Array(items))) => items,
        Some(Ok(other)) => vec![other],
        Some(Err(err)) => {
            tracing::warn!(target: "quickjs", "discarding malformed call arguments: {err}");
            Vec::new()
        }
        None => Vec::new(),
    }
}

fn throw_error<T>(ctx: &Ctx<'_>, message: String) -> rquickjs::Result<T> {
    tracing::debug!(target: "quickjs", "native call failed: {message}");
    let value = message.into_js(ctx)?;
    Err(ctx.throw(value))
}

fn log_from_js(level: String, message: String) -> rquickjs::Result<()> {
    match level.as_str() {
        "error" => tracing::error!(target: "quickjs", "{message}"),
        "warn" => tracing::warn!(target: "quickjs", "{message}"),
        "debug" => tracing::debug!(target: "quickjs", "{message}"),
        _ => tracing::info!(target: "quickjs", "{message}"),
    }
    Ok(())
}

/// Take the pending exception and render it as a fault payload. Thrown
/// strings are kept as-is; error objects become `{name, message, stack}`.
fn capture_fault(ctx: &Ctx<'_>) -> RawFault {
    let exception: Value = ctx.catch();

    if let Some(text) = exception.as_string() {
        return RawFault::new(text.to_string().unwrap_or_default());
    }

    if let Some(obj) = exception.as_object() {
        let field = |key: &str| obj.get::<_, Option<String>>(key).ok().flatten();
        let payload = serde_json::json!({
            "name": field("name"),
            "message": field("message"),
            "stack": field("stack"),
        });
        return RawFault::new(payload.to_string());
    }

    RawFault::new(format!("{:?}", exception))
}

const CONSOLE_BOOTSTRAP: &str = r#"
(() => {
    const global = globalThis;
    const stringify = (value) => {
        try {
            if (typeof value === 'string') {
                return value;
            }
            if (value === undefined) {
                return 'undefined';
            }
            if (value === null) {
                return 'null';
            }
            if (value instanceof Error) {
                return value.name + ': ' + value.message;
            }
            if (typeof value === 'object') {
                return JSON.stringify(value);
            }
            return String(value);
        } catch (err) {
            return '[unprintable]';
        }
    };

    const logAt = (level) => (...args) => {
        try {
            global.__viewhost_log(level, args.map(stringify).join(' '));
        } catch (err) {
            // console must never throw
        }
    };

    if (typeof global.console !== 'object' || global.console === null) {
        global.console = {};
    }

    global.console.log = logAt('info');
    global.console.info = logAt('info');
    global.console.warn = logAt('warn');
    global.console.error = logAt('error');
    global.console.debug = logAt('debug');
})();
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_values_render_as_json() {
        let mut engine = QuickJsEngine::new().unwrap();
        assert_eq!(engine.evaluate("1 + 2").unwrap().as_deref(), Some("3"));
        assert_eq!(
            engine.evaluate("({a: [1, 'x']})").unwrap().as_deref(),
            Some(r#"{"a":[1,"x"]}"#)
        );
        assert_eq!(engine.evaluate("undefined").unwrap(), None);
        assert_eq!(engine.evaluate("null").unwrap().as_deref(), Some("null"));
    }

    #[test]
    fn globals_survive_between_submissions() {
        let mut engine = QuickJsEngine::new().unwrap();
        engine.evaluate("var counter = 41;").unwrap();
        assert_eq!(engine.evaluate("++counter").unwrap().as_deref(), Some("42"));
    }

    #[test]
    fn thrown_errors_become_payloads() {
        let mut engine = QuickJsEngine::new().unwrap();
        let fault = engine.evaluate("throw new TypeError('bad')").unwrap_err();
        let payload: JsonValue = serde_json::from_str(&fault.payload).unwrap();
        assert_eq!(payload["name"], "TypeError");
        assert_eq!(payload["message"], "bad");

        let fault = engine.evaluate("throw 'plain'").unwrap_err();
        assert_eq!(fault.payload, "plain");
    }

    #[test]
    fn pending_jobs_run_after_evaluation() {
        let mut engine = QuickJsEngine::new().unwrap();
        engine
            .evaluate("var done = false; Promise.resolve().then(() => { done = true; });")
            .unwrap();
        assert_eq!(engine.evaluate("done").unwrap().as_deref(), Some("true"));
    }

    #[test]
    fn abort_flag_interrupts_scripts() {
        struct NoHost;
        impl HostBindings for NoHost {
            fn notify(&self, _: &str, _: Vec<JsonValue>) {}
            fn has_object(&self, _: &str) -> bool {
                false
            }
            fn call(&self, _: &str, _: &str, _: Vec<JsonValue>) -> Result<Option<JsonValue>> {
                Ok(None)
            }
            fn resolve(&self, _: &str, _: &str) -> Result<Option<String>> {
                Ok(None)
            }
            fn cache_get(&self, _: &str) -> Option<String> {
                None
            }
            fn cache_store(&self, _: &str, _: &str, _: &str, _: usize) {}
            fn report_error(&self, _: RawFault) {}
        }

        let abort = Arc::new(AtomicBool::new(true));
        let mut engine = QuickJsEngine::with_host("", Arc::new(NoHost), abort).unwrap();
        assert!(engine.evaluate("while (true) {}").is_err());
    }
}
