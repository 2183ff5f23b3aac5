//! Scheduler Service
//!
//! Request handler behind the server socket. Workers announce readiness here;
//! clients submit orders, list executions and cancel logical workers.

use async_trait::async_trait;
use tracing::debug;

use crate::rpc::{CancelReply, Reply, Request, RequestHandler};
use crate::types::{Error, Result};
use crate::worker::WorkerDispatcher;

pub struct SchedulerService {
    dispatcher: WorkerDispatcher,
}

impl SchedulerService {
    pub fn new(dispatcher: WorkerDispatcher) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &WorkerDispatcher {
        &self.dispatcher
    }
}

#[async_trait]
impl RequestHandler for SchedulerService {
    async fn handle(&self, request: Request) -> Result<Reply> {
        debug!(msg_type = ?request.message_type(), "Server request");
        match request {
            Request::NotifyWorkerReady(notice) => {
                if self.dispatcher.mark_ready(notice.worker_id) {
                    Ok(Reply::Ack)
                } else {
                    Err(Error::Protocol(format!(
                        "Worker {} is not awaiting readiness",
                        notice.worker_id
                    )))
                }
            }
            Request::Execute(order) => Ok(Reply::Executed(self.dispatcher.submit(order).await?)),
            Request::ListCurrentExecutions => {
                Ok(Reply::Executions(self.dispatcher.list_executions().await))
            }
            Request::CancelWorkerExecutions(req) => Ok(Reply::Cancelled(CancelReply {
                cancelled_execution_ids: self
                    .dispatcher
                    .cancel_worker_executions(&req.worker_id)
                    .await,
            })),
            Request::QueryWorkerDb(query) => {
                Ok(Reply::Queried(self.dispatcher.query_db(query).await?))
            }
        }
    }
}
