//! Script evaluation inside a dedicated V8 isolate.
//!
//! Everything here runs on the script thread spawned by [`crate::DenoHost`].
//! The isolate's thread-safe handle is published through the execution's
//! [`InterruptTarget`] before any tenant code runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use deno_core::error::{AnyError, JsError};
use deno_core::serde_v8;
use deno_core::v8;
use deno_core::JsRuntime;
use deno_core::PollEventLoopOptions;
use deno_core::RuntimeOptions;
use serde::Deserialize;

use crate::error::ScriptError;
use crate::host::{ExecutionSignal, ScriptRequest};
use crate::interrupt::ScriptInterrupt;

/// Mutex to serialize V8 isolate creation.
/// Creating multiple isolates concurrently can cause crashes in V8.
static ISOLATE_CREATE_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

/// Extra heap granted once the near-heap-limit callback fires, so the
/// termination can unwind instead of aborting the process.
const HEAP_GRACE_BYTES: usize = 1024 * 1024;

/// Terminates the isolate's current instruction stream.
struct IsolateInterrupt {
    handle: v8::IsolateHandle,
    fired: Arc<AtomicBool>,
}

impl ScriptInterrupt for IsolateInterrupt {
    fn interrupt(&self) {
        self.fired.store(true, Ordering::SeqCst);
        self.handle.terminate_execution();
    }
}

/// Result envelope produced by the wrapper script.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    ok: Option<String>,
    #[serde(default)]
    error: Option<Thrown>,
}

#[derive(Debug, Deserialize)]
struct Thrown {
    code: Option<String>,
    message: String,
    stack: Option<String>,
}

impl Envelope {
    fn into_result(self) -> Result<String, ScriptError> {
        match (self.ok, self.error) {
            (_, Some(Thrown { code: Some(code), message, stack })) => {
                Err(ScriptError::Tenant { code, message, stack })
            }
            (_, Some(Thrown { code: None, message, stack })) => {
                Err(ScriptError::Exception { message, stack })
            }
            (Some(value), None) => Ok(value),
            (None, None) => Err(ScriptError::exception("Script produced no result")),
        }
    }
}

/// Run one request to completion on the current thread.
pub(crate) async fn run_script(
    request: ScriptRequest,
    signal: ExecutionSignal,
    heap_limit: Option<usize>,
) -> Result<String, ScriptError> {
    let mut js_runtime = create_runtime(heap_limit);

    let interrupted = Arc::new(AtomicBool::new(false));
    signal.target.install(Arc::new(IsolateInterrupt {
        handle: js_runtime.v8_isolate().thread_safe_handle(),
        fired: Arc::clone(&interrupted),
    }));

    let heap_exhausted = match heap_limit {
        Some(_) => watch_heap(&mut js_runtime),
        None => Arc::new(AtomicBool::new(false)),
    };

    // Checked after install: any cancellation from here on reaches the isolate.
    let outcome = if signal.is_cancelled() {
        Err(ScriptError::Interrupted)
    } else {
        evaluate(&mut js_runtime, &request, &signal).await
    };

    signal.target.clear();

    if interrupted.load(Ordering::SeqCst) {
        tracing::debug!(execution_id = %request.execution_id, "Script stopped by interrupt");
        return Err(ScriptError::Interrupted);
    }
    if heap_exhausted.load(Ordering::SeqCst) {
        return Err(ScriptError::exception("Heap limit exceeded"));
    }

    outcome
}

fn create_runtime(heap_limit: Option<usize>) -> JsRuntime {
    let create_params = heap_limit.map(|max| v8::CreateParams::default().heap_limits(0, max));

    let _lock = ISOLATE_CREATE_LOCK.lock();
    JsRuntime::new(RuntimeOptions {
        create_params,
        ..Default::default()
    })
}

fn watch_heap(js_runtime: &mut JsRuntime) -> Arc<AtomicBool> {
    let exhausted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&exhausted);
    let handle = js_runtime.v8_isolate().thread_safe_handle();

    js_runtime.add_near_heap_limit_callback(move |current, _initial| {
        if !flag.swap(true, Ordering::SeqCst) {
            handle.terminate_execution();
        }
        current + HEAP_GRACE_BYTES
    });

    exhausted
}

async fn evaluate(
    js_runtime: &mut JsRuntime,
    request: &ScriptRequest,
    signal: &ExecutionSignal,
) -> Result<String, ScriptError> {
    let script = wrap_source(request)?;

    let promise = js_runtime
        .execute_script("<tenant>", script)
        .map_err(classify)?;

    tokio::select! {
        biased;

        _ = signal.cancel.cancelled() => return Err(ScriptError::Interrupted),

        result = js_runtime.run_event_loop(PollEventLoopOptions::default()) => {
            result.map_err(classify)?;
        }
    }

    match settle(js_runtime, promise)? {
        Some(envelope) => envelope.into_result(),
        None => {
            // Event loop drained with the entry promise still pending: nothing
            // can resolve it anymore, so it hangs until it is interrupted.
            signal.cancel.cancelled().await;
            Err(ScriptError::Interrupted)
        }
    }
}

/// Read the wrapper's promise. `None` means it is still pending.
fn settle(
    js_runtime: &mut JsRuntime,
    promise: v8::Global<v8::Value>,
) -> Result<Option<Envelope>, ScriptError> {
    let scope = &mut js_runtime.handle_scope();
    let local = v8::Local::new(scope, promise);

    let value = match v8::Local::<v8::Promise>::try_from(local) {
        Ok(promise) => match promise.state() {
            v8::PromiseState::Fulfilled => promise.result(scope),
            v8::PromiseState::Rejected => {
                let reason = promise.result(scope);
                return Err(ScriptError::exception(reason.to_rust_string_lossy(scope)));
            }
            v8::PromiseState::Pending => return Ok(None),
        },
        Err(_) => local,
    };

    let json: String = serde_v8::from_v8(scope, value)
        .map_err(|e| ScriptError::exception(format!("Failed to read script result: {}", e)))?;

    serde_json::from_str(&json)
        .map(Some)
        .map_err(|e| ScriptError::exception(format!("Malformed script result: {}", e)))
}

fn classify(error: AnyError) -> ScriptError {
    match error.downcast_ref::<JsError>() {
        Some(js) => ScriptError::Exception {
            message: js.exception_message.clone(),
            stack: js.stack.clone(),
        },
        None => ScriptError::exception(error.to_string()),
    }
}

/// Wrap tenant source so the entry call always settles to a JSON envelope.
///
/// The source is a function body; `export default` becomes its return value
/// and the entry function is looked up there first, then on `globalThis`.
fn wrap_source(request: &ScriptRequest) -> Result<String, ScriptError> {
    let entry = serde_json::to_string(&request.entry)
        .map_err(|e| ScriptError::Startup(format!("Failed to encode entry: {}", e)))?;
    let args = serde_json::to_string(&request.args)
        .map_err(|e| ScriptError::Startup(format!("Failed to encode arguments: {}", e)))?;
    let source = request.source.replace("export default", "return");

    Ok(format!(
        r#"(async () => {{
    const __entry = {entry};
    const __args = {args};
    try {{
        const __module = (await (async () => {{
{source}
        }})()) ?? {{}};
        const __fn = __module[__entry] ?? globalThis[__entry];
        if (typeof __fn !== "function") {{
            return JSON.stringify({{ error: {{ code: "EntryPointNotDefined", message: `entry point '${{__entry}}' is not defined`, stack: null }} }});
        }}
        const __argv = __args === null ? [] : (Array.isArray(__args) ? __args : [__args]);
        const __value = await __fn.apply(__module, __argv);
        const __out = typeof __value === "string" ? __value : (__value === undefined ? "" : JSON.stringify(__value));
        return JSON.stringify({{ ok: __out }});
    }} catch (e) {{
        const __stack = e && typeof e.stack === "string" ? e.stack : null;
        if (e && typeof e === "object" && typeof e.code === "string") {{
            return JSON.stringify({{ error: {{ code: e.code, message: String(e.message ?? e.code), stack: __stack }} }});
        }}
        const __message = e && e.message !== undefined ? e.message : e;
        return JSON.stringify({{ error: {{ code: null, message: String(__message), stack: __stack }} }});
    }}
}})()"#
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(source: &str) -> ScriptRequest {
        ScriptRequest {
            execution_id: "exec-1".to_string(),
            tenant_id: "tenant".to_string(),
            source: source.to_string(),
            entry: "main".to_string(),
            args: serde_json::json!([1, 2]),
        }
    }

    #[test]
    fn test_wrap_source_rewrites_export_default() {
        let wrapped = wrap_source(&request("export default { main() {} }")).unwrap();
        assert!(wrapped.contains("return { main() {} }"));
        assert!(wrapped.contains(r#"const __entry = "main";"#));
        assert!(wrapped.contains("const __args = [1,2];"));
    }

    #[test]
    fn test_envelope_mapping() {
        let ok: Envelope = serde_json::from_str(r#"{"ok":"3"}"#).unwrap();
        assert_eq!(ok.into_result(), Ok("3".to_string()));

        let tenant: Envelope = serde_json::from_str(
            r#"{"error":{"code":"InvalidPath","message":"bad path","stack":null}}"#,
        )
        .unwrap();
        assert!(matches!(
            tenant.into_result(),
            Err(ScriptError::Tenant { code, .. }) if code == "InvalidPath"
        ));

        let plain: Envelope =
            serde_json::from_str(r#"{"error":{"code":null,"message":"boom","stack":"at x"}}"#)
                .unwrap();
        assert_eq!(
            plain.into_result(),
            Err(ScriptError::Exception {
                message: "boom".to_string(),
                stack: Some("at x".to_string()),
            })
        );
    }
}
