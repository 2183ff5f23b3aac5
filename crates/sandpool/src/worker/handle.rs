//! Worker Handle
//!
//! Dispatcher-side proxy for one worker process.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::process::Child;
use tokio::sync::{watch, OnceCell};
use tracing::{debug, error, info, warn};

use super::observer::{
    MetricsClock, MetricsSink, ObserverList, SnapshotReason, StorageUsage, WorkerSnapshot,
};
use crate::execution::is_path_segment;
use crate::rpc::{SocketClient, WorkerRpc};
use crate::types::{Error, ExecutionDescriptor, ExecutionId, Result, WorkOrder, WorkerId};

/// How long a child gets to exit after its stdin closes
const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// File extensions counted as tenant databases
const DATABASE_EXTENSIONS: &[&str] = &["db", "sqlite", "sqlite3"];

// ─────────────────────────────────────────────────────────────────────────────
// Worker State
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle of a worker handle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Uninitialized,
    /// Process spawned, readiness not yet announced
    Starting,
    Available,
    /// Terminal for routing
    Recycling,
}

impl WorkerState {
    pub fn is_ready(&self) -> bool {
        *self == WorkerState::Available
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Uninitialized => write!(f, "uninitialized"),
            WorkerState::Starting => write!(f, "starting"),
            WorkerState::Available => write!(f, "available"),
            WorkerState::Recycling => write!(f, "recycling"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────────────────

/// How a handle reaches its worker
#[derive(Clone)]
pub enum Connector {
    /// Worker process listening on a Unix socket
    Socket(PathBuf),
    /// Coordinator running in this process
    Local(Arc<dyn WorkerRpc>),
}

impl Connector {
    async fn connect(&self) -> Result<Arc<dyn WorkerRpc>> {
        match self {
            Connector::Socket(path) => {
                let client = SocketClient::connect(path).await?;
                Ok(Arc::new(client))
            }
            Connector::Local(rpc) => Ok(Arc::clone(rpc)),
        }
    }
}

/// Collaborators shared by every handle of a dispatcher
#[derive(Clone)]
pub struct HandleContext {
    pub observers: ObserverList,
    pub metrics: Arc<dyn MetricsSink>,
    pub clock: Arc<MetricsClock>,
    /// Root of `<root>/<tenant>/<worker>/` database directories
    pub storage_root: PathBuf,
}

struct ExecutionRecord {
    descriptor: ExecutionDescriptor,
    /// Metrics tick at which the execution finished
    finished_at: Mutex<Option<u64>>,
}

/// Proxy for one worker process
pub struct WorkerHandle {
    id: WorkerId,
    connector: Connector,
    socket: Option<PathBuf>,
    state: watch::Sender<WorkerState>,
    client: OnceCell<Arc<dyn WorkerRpc>>,
    executions: DashMap<ExecutionId, ExecutionRecord>,
    process: tokio::sync::Mutex<Option<Child>>,
    ctx: HandleContext,
}

impl WorkerHandle {
    /// Handle for a freshly spawned worker that has not announced readiness.
    pub fn starting(
        id: WorkerId,
        connector: Connector,
        socket: Option<PathBuf>,
        child: Option<Child>,
        ctx: HandleContext,
    ) -> Self {
        Self::new(id, connector, socket, child, WorkerState::Starting, ctx)
    }

    /// Handle wrapping a coordinator in the current process.
    pub fn local(id: WorkerId, rpc: Arc<dyn WorkerRpc>, ctx: HandleContext) -> Self {
        Self::new(
            id,
            Connector::Local(rpc),
            None,
            None,
            WorkerState::Available,
            ctx,
        )
    }

    fn new(
        id: WorkerId,
        connector: Connector,
        socket: Option<PathBuf>,
        child: Option<Child>,
        initial: WorkerState,
        ctx: HandleContext,
    ) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            id,
            connector,
            socket,
            state,
            client: OnceCell::new(),
            executions: DashMap::new(),
            process: tokio::sync::Mutex::new(child),
            ctx,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn socket(&self) -> Option<&Path> {
        self.socket.as_deref()
    }

    /// Readiness announced. Has no effect once recycling.
    pub fn mark_available(&self) -> bool {
        let changed = self.state.send_if_modified(|state| match *state {
            WorkerState::Uninitialized | WorkerState::Starting => {
                *state = WorkerState::Available;
                true
            }
            _ => false,
        });
        if changed {
            info!(worker_id = self.id, "Worker available");
        }
        changed
    }

    /// Take the handle out of routing for good.
    pub fn mark_recycling(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == WorkerState::Recycling {
                return false;
            }
            *state = WorkerState::Recycling;
            true
        })
    }

    /// Get the RPC client, waiting up to `timeout` for the worker to become ready.
    ///
    /// The client is created on first success and reused afterwards.
    pub async fn get_client(&self, timeout: Duration) -> Result<Arc<dyn WorkerRpc>> {
        let mut rx = self.state.subscribe();

        let state = match tokio::time::timeout(
            timeout,
            rx.wait_for(|state| *state >= WorkerState::Available),
        )
        .await
        {
            Ok(Ok(state)) => *state,
            Ok(Err(_)) => WorkerState::Recycling,
            Err(_) => {
                return Err(Error::ReadinessTimeout {
                    worker_id: self.id,
                    timeout,
                });
            }
        };

        if state == WorkerState::Recycling {
            error!(worker_id = self.id, "Client requested from a recycling worker");
            return Err(Error::Recycling(self.id));
        }

        let client = self
            .client
            .get_or_try_init(|| self.connector.connect())
            .await?;
        Ok(Arc::clone(client))
    }

    /// Register an execution before it is sent to the worker.
    ///
    /// Returns `None` when an execution with the same id is already tracked.
    /// Dropping the guard marks it finished; the registry entry survives until
    /// the next metrics tick so the interval snapshot still attributes it.
    pub async fn track(self: &Arc<Self>, order: &WorkOrder) -> Option<ExecutionGuard> {
        let descriptor = order.descriptor();
        match self.executions.entry(order.execution_id.clone()) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(vacant) => {
                vacant.insert(ExecutionRecord {
                    descriptor: descriptor.clone(),
                    finished_at: Mutex::new(None),
                });
            }
        }

        let guard = ExecutionGuard {
            handle: Arc::clone(self),
            descriptor: descriptor.clone(),
        };
        self.ctx.observers.job_started(self.id, &descriptor);
        self.emit(SnapshotReason::JobStart);

        let scan = StorageScan {
            root: self.ctx.storage_root.clone(),
            worker_id: self.id,
            tenant_id: order.tenant_id.clone(),
            logical_worker_id: order.worker_id.clone(),
            databases: order.databases.clone(),
        };
        match tokio::task::spawn_blocking(move || scan.run()).await {
            Ok(Some(usage)) => self.ctx.metrics.track_storage(&usage),
            Ok(None) => warn!(
                worker_id = self.id,
                tenant_id = %order.tenant_id,
                "Storage directory outside the storage root, not scanned"
            ),
            Err(e) => warn!(worker_id = self.id, error = %e, "Storage scan failed"),
        }

        Some(guard)
    }

    /// Executions attributed to this worker, finished ones included until swept.
    pub fn executions(&self) -> Vec<ExecutionDescriptor> {
        self.executions
            .iter()
            .map(|entry| entry.value().descriptor.clone())
            .collect()
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            worker_id: self.id,
            state: self.state(),
            executions: self.executions(),
            tick: self.ctx.clock.now(),
        }
    }

    fn emit(&self, reason: SnapshotReason) {
        self.ctx.metrics.snapshot(reason, &self.snapshot());
    }

    /// Emit the interval snapshot, then drop executions finished before `now`.
    pub fn on_metrics_tick(&self, now: u64) {
        self.emit(SnapshotReason::Interval);
        self.executions
            .retain(|_, record| match *record.finished_at.lock() {
                Some(finished) => finished >= now,
                None => true,
            });
    }

    /// Stop the worker: close its stdin, wait for exit, kill if it lingers.
    pub async fn dispose(&self) {
        self.mark_recycling();

        let child = self.process.lock().await.take();
        if let Some(mut child) = child {
            drop(child.stdin.take());

            match tokio::time::timeout(WORKER_STOP_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => {
                    info!(worker_id = self.id, %status, "Worker exited");
                }
                Ok(Err(e)) => {
                    error!(worker_id = self.id, error = %e, "Error waiting for worker");
                }
                Err(_) => {
                    warn!(worker_id = self.id, "Worker did not exit in time, killing");
                    let _ = child.kill().await;
                }
            }
        }

        if let Some(socket) = &self.socket {
            if let Err(e) = std::fs::remove_file(socket) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!(worker_id = self.id, error = %e, "Failed to remove worker socket");
                }
            }
        }
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("socket", &self.socket)
            .field("executions", &self.executions.len())
            .finish()
    }
}

/// Database files of one worker directory, `<root>/<tenant>/<worker>/`
struct StorageScan {
    root: PathBuf,
    worker_id: WorkerId,
    tenant_id: String,
    logical_worker_id: Option<String>,
    databases: Vec<String>,
}

impl StorageScan {
    /// `None` when a path segment would leave the storage root.
    fn run(self) -> Option<StorageUsage> {
        if !is_path_segment(&self.tenant_id) {
            return None;
        }
        let mut dir = self.root.join(&self.tenant_id);
        if let Some(worker) = &self.logical_worker_id {
            if !is_path_segment(worker) {
                return None;
            }
            dir.push(worker);
        }

        let mut files: BTreeMap<PathBuf, u64> = BTreeMap::new();
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if is_database_file(&path) {
                    let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                    files.insert(path, size);
                }
            }
        }

        // Declared names are file names inside the worker directory.
        for name in self.databases.iter().filter(|name| is_path_segment(name)) {
            let path = dir.join(name);
            if !files.contains_key(&path) {
                let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                files.insert(path, size);
            }
        }

        let total_bytes = files.values().sum();
        Some(StorageUsage {
            worker_id: self.worker_id,
            tenant_id: self.tenant_id,
            logical_worker_id: self.logical_worker_id,
            files: files.into_iter().collect(),
            total_bytes,
        })
    }
}

fn is_database_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| DATABASE_EXTENSIONS.contains(&ext))
}

// ─────────────────────────────────────────────────────────────────────────────
// Execution Guard
// ─────────────────────────────────────────────────────────────────────────────

/// Scope of one tracked execution
pub struct ExecutionGuard {
    handle: Arc<WorkerHandle>,
    descriptor: ExecutionDescriptor,
}

impl ExecutionGuard {
    pub fn execution_id(&self) -> &str {
        &self.descriptor.execution_id
    }

    pub fn handle(&self) -> &Arc<WorkerHandle> {
        &self.handle
    }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        let now = self.handle.ctx.clock.now();
        if let Some(record) = self.handle.executions.get(&self.descriptor.execution_id) {
            *record.finished_at.lock() = Some(now);
        }

        self.handle
            .ctx
            .observers
            .job_stopped(self.handle.id, &self.descriptor);
        self.handle.emit(SnapshotReason::JobStop);
    }
}
