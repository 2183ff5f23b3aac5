//! Shared fakes for worker tests.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::handle::HandleContext;
use super::observer::{
    MetricsClock, MetricsSink, ObserverList, SnapshotReason, StorageUsage, WorkerSnapshot,
};
use crate::rpc::WorkerRpc;
use crate::types::{
    DbOutcome, DbQuery, ExecutionId, ExecutionListing, Result, WorkOrder, WorkResult,
};

/// Worker surface answering everything with empty results
pub(crate) struct NullRpc;

#[async_trait]
impl WorkerRpc for NullRpc {
    async fn execute(&self, order: WorkOrder) -> Result<WorkResult> {
        Ok(WorkResult::success(order.execution_id))
    }

    async fn list_current_executions(&self) -> Result<ExecutionListing> {
        Ok(ExecutionListing::new())
    }

    async fn cancel_worker_executions(&self, _worker_id: &str) -> Result<Vec<ExecutionId>> {
        Ok(Vec::new())
    }

    async fn query_db(&self, _query: DbQuery) -> Result<DbOutcome> {
        Ok(DbOutcome::Rows(Vec::new()))
    }
}

#[derive(Default)]
pub(crate) struct RecordingMetrics {
    pub snapshots: Mutex<Vec<(SnapshotReason, WorkerSnapshot)>>,
    pub storage: Mutex<Vec<StorageUsage>>,
}

impl RecordingMetrics {
    pub fn reasons(&self) -> Vec<SnapshotReason> {
        self.snapshots.lock().iter().map(|(reason, _)| *reason).collect()
    }
}

impl MetricsSink for RecordingMetrics {
    fn snapshot(&self, reason: SnapshotReason, snapshot: &WorkerSnapshot) {
        self.snapshots.lock().push((reason, snapshot.clone()));
    }

    fn track_storage(&self, usage: &StorageUsage) {
        self.storage.lock().push(usage.clone());
    }
}

pub(crate) fn context() -> (HandleContext, Arc<RecordingMetrics>) {
    let metrics = Arc::new(RecordingMetrics::default());
    let ctx = HandleContext {
        observers: ObserverList::new(),
        metrics: metrics.clone(),
        clock: Arc::new(MetricsClock::new()),
        storage_root: PathBuf::from("/nonexistent/sandpool-storage"),
    };
    (ctx, metrics)
}
