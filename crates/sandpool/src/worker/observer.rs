//! Execution observers and metrics reporting.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::types::{ExecutionDescriptor, WorkerId};

use super::handle::WorkerState;

// ─────────────────────────────────────────────────────────────────────────────
// Observers
// ─────────────────────────────────────────────────────────────────────────────

/// Notified when executions start and stop on a worker handle.
pub trait ExecutionObserver: Send + Sync + 'static {
    fn on_job_started(&self, worker_id: WorkerId, execution: &ExecutionDescriptor);

    fn on_job_stopped(&self, worker_id: WorkerId, execution: &ExecutionDescriptor);
}

/// Ordered list of observers. Notification follows insertion order.
#[derive(Clone, Default)]
pub struct ObserverList {
    observers: Vec<Arc<dyn ExecutionObserver>>,
}

impl ObserverList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Concatenate two lists. Every observer in `self` is notified before
    /// any observer in `other`.
    pub fn combine(mut self, other: ObserverList) -> Self {
        self.observers.extend(other.observers);
        self
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub(crate) fn job_started(&self, worker_id: WorkerId, execution: &ExecutionDescriptor) {
        for observer in &self.observers {
            observer.on_job_started(worker_id, execution);
        }
    }

    pub(crate) fn job_stopped(&self, worker_id: WorkerId, execution: &ExecutionDescriptor) {
        for observer in &self.observers {
            observer.on_job_stopped(worker_id, execution);
        }
    }
}

impl std::fmt::Debug for ObserverList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverList")
            .field("len", &self.observers.len())
            .finish()
    }
}

/// Logs job boundaries
pub struct TracingObserver;

impl ExecutionObserver for TracingObserver {
    fn on_job_started(&self, worker_id: WorkerId, execution: &ExecutionDescriptor) {
        info!(
            worker_id,
            execution_id = %execution.execution_id,
            tenant_id = %execution.tenant_id,
            "Job started"
        );
    }

    fn on_job_stopped(&self, worker_id: WorkerId, execution: &ExecutionDescriptor) {
        info!(
            worker_id,
            execution_id = %execution.execution_id,
            tenant_id = %execution.tenant_id,
            "Job stopped"
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Metrics
// ─────────────────────────────────────────────────────────────────────────────

/// Why a snapshot was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotReason {
    JobStart,
    JobStop,
    Interval,
}

/// Point-in-time state of one worker handle
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub worker_id: WorkerId,
    pub state: WorkerState,
    /// Executions still attributed to the worker, finished ones included
    /// until the next metrics tick
    pub executions: Vec<ExecutionDescriptor>,
    pub tick: u64,
}

/// Database files attributed to one execution's worker
#[derive(Debug, Clone, Serialize)]
pub struct StorageUsage {
    pub worker_id: WorkerId,
    pub tenant_id: String,
    pub logical_worker_id: Option<String>,
    pub files: Vec<(PathBuf, u64)>,
    pub total_bytes: u64,
}

/// Receives metrics snapshots and storage reports.
pub trait MetricsSink: Send + Sync + 'static {
    fn snapshot(&self, reason: SnapshotReason, snapshot: &WorkerSnapshot);

    fn track_storage(&self, usage: &StorageUsage);
}

/// Metrics sink writing to the log
pub struct LogMetrics;

impl MetricsSink for LogMetrics {
    fn snapshot(&self, reason: SnapshotReason, snapshot: &WorkerSnapshot) {
        debug!(
            worker_id = snapshot.worker_id,
            state = %snapshot.state,
            executions = snapshot.executions.len(),
            tick = snapshot.tick,
            ?reason,
            "Worker snapshot"
        );
    }

    fn track_storage(&self, usage: &StorageUsage) {
        debug!(
            worker_id = usage.worker_id,
            tenant_id = %usage.tenant_id,
            files = usage.files.len(),
            total_bytes = usage.total_bytes,
            "Storage usage"
        );
    }
}

/// Monotonic tick counter advanced by the metrics ticker.
#[derive(Debug, Default)]
pub struct MetricsClock {
    tick: AtomicU64,
}

impl MetricsClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> u64 {
        self.tick.load(Ordering::SeqCst)
    }

    /// Advance by one tick and return the new value.
    pub fn advance(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ExecutionObserver for Recorder {
        fn on_job_started(&self, _worker_id: WorkerId, execution: &ExecutionDescriptor) {
            self.log
                .lock()
                .push(format!("{}:start:{}", self.name, execution.execution_id));
        }

        fn on_job_stopped(&self, _worker_id: WorkerId, execution: &ExecutionDescriptor) {
            self.log
                .lock()
                .push(format!("{}:stop:{}", self.name, execution.execution_id));
        }
    }

    #[test]
    fn test_combine_preserves_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let recorder = |name| -> Arc<dyn ExecutionObserver> {
            Arc::new(Recorder {
                name,
                log: Arc::clone(&log),
            })
        };

        let first = ObserverList::new().with(recorder("a")).with(recorder("b"));
        let second = ObserverList::new().with(recorder("c"));
        let combined = first.combine(second);
        assert_eq!(combined.len(), 3);

        let execution = crate::types::WorkOrder::new("e1", "t", "main", "").descriptor();
        combined.job_started(1, &execution);
        combined.job_stopped(1, &execution);

        assert_eq!(
            *log.lock(),
            vec![
                "a:start:e1",
                "b:start:e1",
                "c:start:e1",
                "a:stop:e1",
                "b:stop:e1",
                "c:stop:e1",
            ]
        );
    }

    #[test]
    fn test_clock_advances() {
        let clock = MetricsClock::new();
        assert_eq!(clock.now(), 0);
        assert_eq!(clock.advance(), 1);
        assert_eq!(clock.advance(), 2);
        assert_eq!(clock.now(), 2);
    }
}
