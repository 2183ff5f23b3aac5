use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pool::PoolError;

/// Dispatcher-assigned id of a worker process
pub type WorkerId = u32;

/// Caller-supplied execution id, unique per coordinator
pub type ExecutionId = String;

/// Live executions grouped by tenant id
pub type ExecutionListing = HashMap<String, Vec<ExecutionDescriptor>>;

// ─────────────────────────────────────────────────────────────────────────────
// Work Orders
// ─────────────────────────────────────────────────────────────────────────────

/// Time allowances for one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    #[serde(default = "default_max_startup_ms")]
    pub max_startup_ms: u64,
    #[serde(default = "default_max_execution_ms")]
    pub max_execution_ms: u64,
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
}

fn default_max_startup_ms() -> u64 {
    1_000
}

fn default_max_execution_ms() -> u64 {
    5_000
}

fn default_grace_ms() -> u64 {
    500
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_startup_ms: default_max_startup_ms(),
            max_execution_ms: default_max_execution_ms(),
            grace_ms: default_grace_ms(),
        }
    }
}

impl Limits {
    /// Startup plus execution allowance; the governor fires here.
    pub fn budget(&self) -> Duration {
        Duration::from_millis(self.max_startup_ms.saturating_add(self.max_execution_ms))
    }

    /// Budget plus grace; past this the coordinator stops waiting for the host.
    pub fn deadline(&self) -> Duration {
        self.budget() + Duration::from_millis(self.grace_ms)
    }
}

/// One request to run a tenant's entry function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkOrder {
    pub execution_id: ExecutionId,
    pub tenant_id: String,
    /// Logical worker id, used for bulk cancellation and storage lookup
    #[serde(default)]
    pub worker_id: Option<String>,
    /// Name of the function to invoke
    pub entry: String,
    /// Arguments; arrays are spread positionally
    #[serde(default)]
    pub args: serde_json::Value,
    /// Script source
    pub script: String,
    #[serde(default)]
    pub limits: Limits,
    /// Database names the worker declares
    #[serde(default)]
    pub databases: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub user_data: serde_json::Value,
}

impl WorkOrder {
    pub fn new(
        execution_id: impl Into<ExecutionId>,
        tenant_id: impl Into<String>,
        entry: impl Into<String>,
        script: impl Into<String>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            tenant_id: tenant_id.into(),
            worker_id: None,
            entry: entry.into(),
            args: serde_json::Value::Array(Vec::new()),
            script: script.into(),
            limits: Limits::default(),
            databases: Vec::new(),
            metadata: serde_json::Value::Null,
            user_data: serde_json::Value::Null,
        }
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_databases(mut self, databases: Vec<String>) -> Self {
        self.databases = databases;
        self
    }

    pub fn with_user_data(mut self, user_data: serde_json::Value) -> Self {
        self.user_data = user_data;
        self
    }

    /// Snapshot of this order as an in-flight execution.
    pub fn descriptor(&self) -> ExecutionDescriptor {
        ExecutionDescriptor {
            execution_id: self.execution_id.clone(),
            tenant_id: self.tenant_id.clone(),
            worker_id: self.worker_id.clone(),
            metadata: self.metadata.clone(),
            user_data: self.user_data.clone(),
            started_at: Utc::now(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Results
// ─────────────────────────────────────────────────────────────────────────────

/// Closed set of execution outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    Success,
    Timeout,
    InvalidPath,
    PermissionError,
    EntryPointNotDefined,
    UnauthorizedDatabaseAccess,
    UserException,
}

impl ResultCode {
    /// Map a code carried by a structured tenant error.
    ///
    /// Unknown codes become [`ResultCode::UserException`].
    pub fn from_tenant_code(code: &str) -> Self {
        match code {
            "InvalidPath" => Self::InvalidPath,
            "PermissionError" => Self::PermissionError,
            "EntryPointNotDefined" => Self::EntryPointNotDefined,
            "Timeout" => Self::Timeout,
            "UnauthorizedDatabaseAccess" => Self::UnauthorizedDatabaseAccess,
            _ => Self::UserException,
        }
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResultCode::Success => "Success",
            ResultCode::Timeout => "Timeout",
            ResultCode::InvalidPath => "InvalidPath",
            ResultCode::PermissionError => "PermissionError",
            ResultCode::EntryPointNotDefined => "EntryPointNotDefined",
            ResultCode::UnauthorizedDatabaseAccess => "UnauthorizedDatabaseAccess",
            ResultCode::UserException => "UserException",
        };
        f.write_str(name)
    }
}

/// Outcome of one execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkResult {
    pub code: ResultCode,
    /// Stringified return value on success, error message otherwise
    pub message: String,
    #[serde(default)]
    pub stacktrace: Option<String>,
}

impl WorkResult {
    pub fn success(value: impl Into<String>) -> Self {
        Self {
            code: ResultCode::Success,
            message: value.into(),
            stacktrace: None,
        }
    }

    pub fn failure(code: ResultCode, message: impl Into<String>, stacktrace: Option<String>) -> Self {
        Self {
            code,
            message: message.into(),
            stacktrace,
        }
    }

    pub fn timeout(limits: &Limits) -> Self {
        Self::failure(
            ResultCode::Timeout,
            format!("Execution exceeded {}ms", limits.budget().as_millis()),
            None,
        )
    }

    pub fn is_success(&self) -> bool {
        self.code == ResultCode::Success
    }
}

/// Point-in-time view of an in-flight execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionDescriptor {
    pub execution_id: ExecutionId,
    pub tenant_id: String,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub user_data: serde_json::Value,
    pub started_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker Database Queries
// ─────────────────────────────────────────────────────────────────────────────

/// Query against one of a worker's databases
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbQuery {
    pub tenant_id: String,
    #[serde(default)]
    pub worker_id: Option<String>,
    pub database: String,
    pub sql: String,
    #[serde(default)]
    pub params: Vec<serde_json::Value>,
}

/// Rows or a structured failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbOutcome {
    Rows(Vec<serde_json::Value>),
    Error { code: String, message: String },
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Every worker slot is bound; retry later
    #[error("Too much work: all {max} workers are busy")]
    TooMuchWork { max: usize },

    #[error("Worker {worker_id} not ready after {timeout:?}")]
    ReadinessTimeout { worker_id: WorkerId, timeout: Duration },

    #[error("Worker {0} is recycling")]
    Recycling(WorkerId),

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Failure reported by the other end of an RPC connection
    #[error("Remote error: {message}")]
    Remote { message: String, retryable: bool },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Shutting down")]
    ShuttingDown,
}

impl Error {
    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TooMuchWork { .. } | Error::Remote { retryable: true, .. }
        )
    }
}

impl From<PoolError> for Error {
    fn from(error: PoolError) -> Self {
        match error {
            PoolError::Exhausted { max } => Error::TooMuchWork { max },
            PoolError::Construction(message) => Error::Spawn(message),
            PoolError::Closed => Error::ShuttingDown,
            PoolError::InvalidCapacity => {
                Error::Config("worker pool capacity must be at least 1".to_string())
            }
        }
    }
}
