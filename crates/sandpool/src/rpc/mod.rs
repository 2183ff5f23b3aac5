//! RPC between the scheduling server and worker processes
//!
//! Framed JSON messages over Unix domain sockets. Both sides speak the same
//! protocol: the server answers `NotifyWorkerReady` and front-door requests,
//! workers answer the execution requests.

mod client;
mod frame;
mod messages;
mod server;

pub use client::SocketClient;
pub use frame::{Frame, FrameReader, FrameWriter, MessageType, MAX_FRAME_LEN};
pub use messages::{CancelReply, CancelRequest, Fault, ReadyNotice, Reply, Request};
pub use server::{bind, serve, RequestHandler};

use async_trait::async_trait;

use crate::types::{DbOutcome, DbQuery, ExecutionId, ExecutionListing, Result, WorkOrder, WorkResult};

/// The worker process surface, local or remote.
#[async_trait]
pub trait WorkerRpc: Send + Sync + 'static {
    async fn execute(&self, order: WorkOrder) -> Result<WorkResult>;

    async fn list_current_executions(&self) -> Result<ExecutionListing>;

    /// Cancel every in-flight execution of a logical worker.
    async fn cancel_worker_executions(&self, worker_id: &str) -> Result<Vec<ExecutionId>>;

    async fn query_db(&self, query: DbQuery) -> Result<DbOutcome>;
}
