//! Multiplexed RPC client over a Unix socket.
//!
//! Requests are tagged with a fresh id and parked in a pending map; a
//! background reader task completes them as replies arrive, in any order.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::frame::{Frame, FrameReader, FrameWriter, MessageType};
use super::messages::{CancelReply, CancelRequest, Fault, ReadyNotice, Request};
use super::WorkerRpc;
use crate::types::{
    DbOutcome, DbQuery, Error, ExecutionId, ExecutionListing, Result, WorkOrder, WorkResult,
    WorkerId,
};

type PendingMap = DashMap<u64, oneshot::Sender<Frame>>;

/// Client end of one RPC connection
pub struct SocketClient {
    writer: Mutex<FrameWriter<OwnedWriteHalf>>,
    pending: Arc<PendingMap>,
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl SocketClient {
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).await?;
        let (read_half, write_half) = stream.into_split();

        let pending: Arc<PendingMap> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        let reader = {
            let pending = Arc::clone(&pending);
            let closed = Arc::clone(&closed);
            let mut frames = FrameReader::new(read_half);
            tokio::spawn(async move {
                loop {
                    match frames.recv().await {
                        Ok(Some(frame)) => match pending.remove(&frame.request_id) {
                            Some((_, tx)) => {
                                let _ = tx.send(frame);
                            }
                            None => {
                                debug!(request_id = frame.request_id, "Reply for unknown request");
                            }
                        },
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "RPC connection failed");
                            break;
                        }
                    }
                }

                // Waiters see their sender dropped.
                closed.store(true, Ordering::SeqCst);
                pending.clear();
            })
        };

        Ok(Self {
            writer: Mutex::new(FrameWriter::new(write_half)),
            pending,
            closed,
            next_id: AtomicU64::new(1),
            reader,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn call<T: DeserializeOwned>(&self, request: Request) -> Result<T> {
        let request_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = request.into_frame(request_id)?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);

        // Checked after insert so a concurrent teardown cannot strand us.
        if self.is_closed() {
            self.pending.remove(&request_id);
            return Err(Error::ConnectionClosed);
        }

        let sent = self.writer.lock().await.send(&frame).await;
        if let Err(e) = sent {
            self.pending.remove(&request_id);
            return Err(e);
        }

        let reply = rx.await.map_err(|_| Error::ConnectionClosed)?;
        match reply.msg_type {
            MessageType::Reply => reply.parse_json(),
            MessageType::Fault => {
                let fault: Fault = reply.parse_json()?;
                Err(Error::Remote {
                    message: fault.message,
                    retryable: fault.retryable,
                })
            }
            other => Err(Error::Protocol(format!("Expected a reply, got {:?}", other))),
        }
    }

    /// Tell the server this worker is listening.
    pub async fn notify_ready(&self, worker_id: WorkerId) -> Result<()> {
        let _: serde_json::Value = self
            .call(Request::NotifyWorkerReady(ReadyNotice { worker_id }))
            .await?;
        Ok(())
    }
}

impl Drop for SocketClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl WorkerRpc for SocketClient {
    async fn execute(&self, order: WorkOrder) -> Result<WorkResult> {
        self.call(Request::Execute(order)).await
    }

    async fn list_current_executions(&self) -> Result<ExecutionListing> {
        self.call(Request::ListCurrentExecutions).await
    }

    async fn cancel_worker_executions(&self, worker_id: &str) -> Result<Vec<ExecutionId>> {
        let reply: CancelReply = self
            .call(Request::CancelWorkerExecutions(CancelRequest {
                worker_id: worker_id.to_string(),
            }))
            .await?;
        Ok(reply.cancelled_execution_ids)
    }

    async fn query_db(&self, query: DbQuery) -> Result<DbOutcome> {
        self.call(Request::QueryWorkerDb(query)).await
    }
}
