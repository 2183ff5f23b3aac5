//! Execution Coordinator
//!
//! Runs work orders inside a worker process. Every execution is registered in
//! a live set and, when it carries a logical worker id, in a per-worker
//! cancellation registry; both entries go away on every exit path.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use sandpool_js_runtime::{
    ExecutionSignal, InterruptTarget, ScriptError, ScriptHost, ScriptRequest,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::database::{check_database_name, NoDatabase, TenantDatabase};
use super::governor::InterruptGovernor;
use crate::rpc::{CancelReply, Reply, Request, RequestHandler, WorkerRpc};
use crate::types::{
    DbOutcome, DbQuery, Error, ExecutionDescriptor, ExecutionId, ExecutionListing, Limits,
    Result, ResultCode, WorkOrder, WorkResult,
};

pub struct ExecutionCoordinator {
    host: Arc<dyn ScriptHost>,
    governor: InterruptGovernor,
    database: Arc<dyn TenantDatabase>,
    live: DashMap<ExecutionId, ExecutionDescriptor>,
    /// Logical worker id -> execution tokens
    by_worker: DashMap<String, DashMap<ExecutionId, CancellationToken>>,
}

impl ExecutionCoordinator {
    pub fn new(host: Arc<dyn ScriptHost>) -> Self {
        Self {
            host,
            governor: InterruptGovernor::default(),
            database: Arc::new(NoDatabase),
            live: DashMap::new(),
            by_worker: DashMap::new(),
        }
    }

    pub fn with_governor(mut self, governor: InterruptGovernor) -> Self {
        self.governor = governor;
        self
    }

    pub fn with_database(mut self, database: Arc<dyn TenantDatabase>) -> Self {
        self.database = database;
        self
    }

    /// Run one order to completion. Never fails and never panics.
    pub async fn execute(&self, order: WorkOrder) -> WorkResult {
        let token = CancellationToken::new();
        let Some(_registration) = self.register(&order, &token) else {
            warn!(execution_id = %order.execution_id, "Duplicate execution id");
            return WorkResult::failure(
                ResultCode::UserException,
                format!("Execution {} is already running", order.execution_id),
                None,
            );
        };

        let limits = order.limits;
        let started = Instant::now();
        debug!(
            execution_id = %order.execution_id,
            tenant_id = %order.tenant_id,
            budget = ?limits.budget(),
            "Execution started"
        );

        let target = InterruptTarget::new();
        let scope = self.governor.arm(&token, target.clone(), limits.budget());
        let signal = ExecutionSignal::new(scope.native_token(), target);

        let request = ScriptRequest {
            execution_id: order.execution_id.clone(),
            tenant_id: order.tenant_id.clone(),
            source: order.script,
            entry: order.entry,
            args: order.args,
        };
        let run = AssertUnwindSafe(self.host.run(request, signal)).catch_unwind();

        let outcome = tokio::select! {
            outcome = run => Some(outcome),
            _ = tokio::time::sleep(limits.deadline()) => {
                warn!(execution_id = %order.execution_id, "Host ignored interrupts past the deadline");
                token.cancel();
                None
            }
        };
        drop(scope);

        let result = match outcome {
            _ if token.is_cancelled() => WorkResult::timeout(&limits),
            None => WorkResult::timeout(&limits),
            Some(Ok(outcome)) => map_outcome(outcome, &limits),
            Some(Err(panic)) => WorkResult::failure(
                ResultCode::UserException,
                format!("Script host panicked: {}", panic_message(panic.as_ref())),
                None,
            ),
        };

        info!(
            execution_id = %order.execution_id,
            tenant_id = %order.tenant_id,
            code = %result.code,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Execution finished"
        );
        result
    }

    fn register(&self, order: &WorkOrder, token: &CancellationToken) -> Option<Registration<'_>> {
        match self.live.entry(order.execution_id.clone()) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(vacant) => {
                vacant.insert(order.descriptor());
            }
        }

        if let Some(worker_id) = &order.worker_id {
            self.by_worker
                .entry(worker_id.clone())
                .or_default()
                .insert(order.execution_id.clone(), token.clone());
        }

        Some(Registration {
            coordinator: self,
            execution_id: order.execution_id.clone(),
            worker_id: order.worker_id.clone(),
        })
    }

    /// In-flight executions grouped by tenant.
    pub fn list_current(&self) -> ExecutionListing {
        let mut listing = ExecutionListing::new();
        for entry in self.live.iter() {
            let descriptor = entry.value().clone();
            listing
                .entry(descriptor.tenant_id.clone())
                .or_default()
                .push(descriptor);
        }
        listing
    }

    /// Cancel every in-flight execution of a logical worker and return their ids.
    pub fn cancel(&self, worker_id: &str) -> Vec<ExecutionId> {
        let tokens: Vec<(ExecutionId, CancellationToken)> = match self.by_worker.get(worker_id) {
            Some(executions) => executions
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
            None => Vec::new(),
        };

        for (execution_id, token) in &tokens {
            debug!(worker_id, execution_id = %execution_id, "Cancelling execution");
            token.cancel();
        }

        if !tokens.is_empty() {
            info!(worker_id, count = tokens.len(), "Cancelled worker executions");
        }
        tokens.into_iter().map(|(id, _)| id).collect()
    }

    pub async fn query_db(&self, query: DbQuery) -> DbOutcome {
        if let Some(rejected) = check_database_name(&query.database) {
            return rejected;
        }
        self.database.query(query).await
    }
}

/// Removes an execution from the live set and the cancellation registry.
struct Registration<'a> {
    coordinator: &'a ExecutionCoordinator,
    execution_id: ExecutionId,
    worker_id: Option<String>,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.coordinator.live.remove(&self.execution_id);

        if let Some(worker_id) = &self.worker_id {
            if let Some(executions) = self.coordinator.by_worker.get(worker_id) {
                executions.remove(&self.execution_id);
            }
            self.coordinator
                .by_worker
                .remove_if(worker_id, |_, executions| executions.is_empty());
        }
    }
}

fn map_outcome(outcome: std::result::Result<String, ScriptError>, limits: &Limits) -> WorkResult {
    match outcome {
        Ok(value) => WorkResult::success(value),
        Err(ScriptError::Interrupted) => WorkResult::timeout(limits),
        Err(ScriptError::Tenant {
            code,
            message,
            stack,
        }) => WorkResult::failure(ResultCode::from_tenant_code(&code), message, stack),
        Err(ScriptError::Exception { message, stack }) => {
            WorkResult::failure(ResultCode::UserException, message, stack)
        }
        Err(error @ ScriptError::Startup(_)) => {
            WorkResult::failure(ResultCode::UserException, error.to_string(), None)
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Surfaces
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl WorkerRpc for ExecutionCoordinator {
    async fn execute(&self, order: WorkOrder) -> Result<WorkResult> {
        Ok(ExecutionCoordinator::execute(self, order).await)
    }

    async fn list_current_executions(&self) -> Result<ExecutionListing> {
        Ok(self.list_current())
    }

    async fn cancel_worker_executions(&self, worker_id: &str) -> Result<Vec<ExecutionId>> {
        Ok(self.cancel(worker_id))
    }

    async fn query_db(&self, query: DbQuery) -> Result<DbOutcome> {
        Ok(ExecutionCoordinator::query_db(self, query).await)
    }
}

#[async_trait]
impl RequestHandler for ExecutionCoordinator {
    async fn handle(&self, request: Request) -> Result<Reply> {
        match request {
            Request::Execute(order) => Ok(Reply::Executed(self.execute(order).await)),
            Request::ListCurrentExecutions => Ok(Reply::Executions(self.list_current())),
            Request::CancelWorkerExecutions(req) => Ok(Reply::Cancelled(CancelReply {
                cancelled_execution_ids: self.cancel(&req.worker_id),
            })),
            Request::QueryWorkerDb(query) => Ok(Reply::Queried(self.query_db(query).await)),
            Request::NotifyWorkerReady(_) => Err(Error::Protocol(
                "Readiness notices go to the server socket".to_string(),
            )),
        }
    }
}
