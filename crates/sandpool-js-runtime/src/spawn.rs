//! Deno-backed script host.
//!
//! Each execution gets a fresh isolate on its own OS thread with a
//! current-thread tokio runtime, so a script stuck in synchronous code never
//! blocks the caller's runtime.

use std::thread;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::ScriptError;
use crate::host::{ExecutionSignal, ScriptHost, ScriptRequest};
use crate::worker::run_script;

/// [`ScriptHost`] running tenant code in V8 via deno_core.
#[derive(Debug, Clone, Default)]
pub struct DenoHost {
    /// Maximum V8 heap size in bytes
    heap_limit: Option<usize>,
}

impl DenoHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the isolate heap; scripts exceeding it are terminated.
    pub fn with_heap_limit(mut self, bytes: usize) -> Self {
        self.heap_limit = Some(bytes);
        self
    }
}

#[async_trait]
impl ScriptHost for DenoHost {
    async fn run(
        &self,
        request: ScriptRequest,
        signal: ExecutionSignal,
    ) -> Result<String, ScriptError> {
        crate::init_platform();

        let heap_limit = self.heap_limit;
        let (tx, rx) = oneshot::channel();
        let name = format!("script:{}", request.execution_id);

        thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                tracing::trace!("[{}] Thread started", name);

                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = tx.send(Err(ScriptError::Startup(e.to_string())));
                        return;
                    }
                };

                let result = rt.block_on(run_script(request, signal, heap_limit));
                rt.shutdown_background();

                if tx.send(result).is_err() {
                    tracing::debug!("[{}] Result receiver dropped", name);
                }
            })
            .map_err(|e| ScriptError::Startup(format!("Failed to spawn script thread: {}", e)))?;

        rx.await
            .map_err(|_| ScriptError::exception("Script thread panicked"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use crate::interrupt::InterruptTarget;

    fn request(source: &str, entry: &str) -> ScriptRequest {
        ScriptRequest {
            execution_id: "exec-test".to_string(),
            tenant_id: "tenant".to_string(),
            source: source.to_string(),
            entry: entry.to_string(),
            args: serde_json::json!([2, 3]),
        }
    }

    #[tokio::test]
    async fn test_returns_stringified_value() {
        let host = DenoHost::new();
        let source = "export default { add(a, b) { return { sum: a + b }; } }";

        let result = host
            .run(request(source, "add"), ExecutionSignal::detached())
            .await;

        assert_eq!(result, Ok(r#"{"sum":5}"#.to_string()));
    }

    #[tokio::test]
    async fn test_missing_entry_point() {
        let host = DenoHost::new();

        let result = host
            .run(request("export default {}", "main"), ExecutionSignal::detached())
            .await;

        assert!(matches!(
            result,
            Err(ScriptError::Tenant { ref code, .. }) if code == "EntryPointNotDefined"
        ));
    }

    #[tokio::test]
    async fn test_thrown_error_keeps_message() {
        let host = DenoHost::new();
        let source = r#"export default { main() { throw new Error("intentional"); } }"#;

        let result = host
            .run(request(source, "main"), ExecutionSignal::detached())
            .await;

        match result {
            Err(ScriptError::Exception { message, .. }) => assert!(message.contains("intentional")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_infinite_loop_is_interrupted() {
        let host = DenoHost::new();
        let cancel = CancellationToken::new();
        let target = InterruptTarget::new();
        let signal = ExecutionSignal::new(cancel.clone(), target.clone());
        let source = "export default { main() { while (true) {} } }";

        let run = tokio::spawn(async move { host.run(request(source, "main"), signal).await });

        // Keep forcing until the isolate yields.
        let forcing = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
            loop {
                target.fire();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        let result = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .expect("script did not stop")
            .unwrap();
        forcing.abort();

        assert_eq!(result, Err(ScriptError::Interrupted));
    }
}
