//! Worker processes as seen from the server
//!
//! ```text
//! WorkerDispatcher ──► ResourcePool<tenant, WorkerHandle>
//!                          │
//!                          ├─► WorkerLauncher (spawn child)
//!                          └─► WorkerHandle ──► WorkerRpc (socket or local)
//! ```

mod dispatcher;
mod handle;
mod launcher;
mod observer;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatcher::{child_socket_path, DispatcherConfig, WorkerDispatcher, LOCAL_WORKER_ID};
pub use handle::{Connector, ExecutionGuard, HandleContext, WorkerHandle, WorkerState};
pub use launcher::{LaunchSpec, ProcessLauncher, WorkerLauncher};
pub use observer::{
    ExecutionObserver, LogMetrics, MetricsClock, MetricsSink, ObserverList, SnapshotReason,
    StorageUsage, TracingObserver, WorkerSnapshot,
};
