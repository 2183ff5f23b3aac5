//! The seam between the orchestration layer and whatever actually runs scripts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::ScriptError;
use crate::interrupt::InterruptTarget;

/// One invocation of a tenant script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptRequest {
    /// Execution id, used for thread names and logs
    pub execution_id: String,
    /// Owning tenant
    pub tenant_id: String,
    /// Tenant source code
    pub source: String,
    /// Name of the function to call
    pub entry: String,
    /// Arguments; an array is spread into positional arguments
    pub args: serde_json::Value,
}

/// Cancellation handles passed to a host for one execution.
#[derive(Debug, Clone)]
pub struct ExecutionSignal {
    /// Cancelled when the execution must stop; native async work should observe it
    pub cancel: CancellationToken,
    /// Slot the host installs its interrupter into
    pub target: InterruptTarget,
}

impl ExecutionSignal {
    pub fn new(cancel: CancellationToken, target: InterruptTarget) -> Self {
        Self { cancel, target }
    }

    /// A signal nobody will ever fire.
    pub fn detached() -> Self {
        Self::new(CancellationToken::new(), InterruptTarget::new())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Runs tenant scripts.
///
/// A host must install an interrupter into `signal.target` before it starts
/// executing tenant code, and must check `signal.cancel` right after doing so.
/// On success it returns the stringified return value of the entry function.
#[async_trait]
pub trait ScriptHost: Send + Sync + 'static {
    async fn run(
        &self,
        request: ScriptRequest,
        signal: ExecutionSignal,
    ) -> Result<String, ScriptError>;
}
