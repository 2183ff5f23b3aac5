//! Worker Dispatcher
//!
//! Routes tenants to worker handles. In pooled mode each tenant is bound to
//! its own child process from a [`ResourcePool`]; in single mode every tenant
//! shares one handle wrapping the in-process coordinator.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handle::{Connector, HandleContext, WorkerHandle, WorkerState};
use super::launcher::{LaunchSpec, WorkerLauncher};
use crate::config::DispatchMode;
use crate::pool::{PoolError, ResourceFactory, ResourcePool};
use crate::types::{
    DbOutcome, DbQuery, Error, ExecutionId, ExecutionListing, Result, ResultCode, WorkOrder,
    WorkResult, WorkerId,
};

/// Worker id of the in-process handle in single mode
pub const LOCAL_WORKER_ID: WorkerId = 0;

/// Dispatcher tuning
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_workers: usize,
    pub prewarm: usize,
    pub readiness_timeout: Duration,
    pub metrics_interval: Duration,
    /// Base socket; children listen on numbered siblings of it
    pub server_socket: PathBuf,
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker Construction
// ─────────────────────────────────────────────────────────────────────────────

struct Spawner {
    launcher: Arc<dyn WorkerLauncher>,
    /// Readiness signals of spawned workers that have not called back yet
    pending: DashMap<WorkerId, oneshot::Sender<()>>,
    next_child: AtomicU32,
    server_socket: PathBuf,
    ctx: HandleContext,
}

impl Spawner {
    /// Next free child socket: the base stem suffixed with a fresh index.
    fn allocate_socket(&self) -> (WorkerId, PathBuf) {
        loop {
            let index = self.next_child.fetch_add(1, Ordering::SeqCst);
            let path = child_socket_path(&self.server_socket, index);
            if !path.exists() {
                return (index, path);
            }
            debug!(socket = %path.display(), "Socket path taken, skipping");
        }
    }

    async fn spawn_worker(&self) -> Result<Arc<WorkerHandle>> {
        let (worker_id, socket) = self.allocate_socket();

        let (ready_tx, ready_rx) = oneshot::channel();
        self.pending.insert(worker_id, ready_tx);

        let spec = LaunchSpec {
            worker_id,
            socket: socket.clone(),
            server_socket: self.server_socket.clone(),
        };
        let child = match self.launcher.launch(&spec).await {
            Ok(child) => child,
            Err(e) => {
                self.pending.remove(&worker_id);
                return Err(e);
            }
        };

        let handle = Arc::new(WorkerHandle::starting(
            worker_id,
            Connector::Socket(socket.clone()),
            Some(socket),
            child,
            self.ctx.clone(),
        ));

        let weak = Arc::downgrade(&handle);
        tokio::spawn(async move {
            if ready_rx.await.is_ok() {
                if let Some(handle) = weak.upgrade() {
                    handle.mark_available();
                }
            }
        });

        Ok(handle)
    }
}

struct WorkerFactory {
    spawner: Arc<Spawner>,
}

#[async_trait]
impl ResourceFactory<Arc<WorkerHandle>> for WorkerFactory {
    async fn create(&self) -> std::result::Result<Arc<WorkerHandle>, PoolError> {
        self.spawner
            .spawn_worker()
            .await
            .map_err(|e| PoolError::Construction(e.to_string()))
    }

    async fn release(&self, handle: Arc<WorkerHandle>) {
        self.spawner.pending.remove(&handle.id());
        handle.dispose().await;
    }
}

/// `sandpool.sock` with index 7 becomes `sandpool.7.sock`.
pub fn child_socket_path(base: &Path, index: u32) -> PathBuf {
    let stem = base
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("sandpool");
    let name = match base.extension().and_then(|ext| ext.to_str()) {
        Some(ext) => format!("{}.{}.{}", stem, index, ext),
        None => format!("{}.{}", stem, index),
    };
    base.with_file_name(name)
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────────────────────────

enum Backend {
    Single(Arc<WorkerHandle>),
    Pooled {
        pool: ResourcePool<String, Arc<WorkerHandle>>,
        spawner: Arc<Spawner>,
    },
}

struct DispatcherInner {
    backend: Backend,
    ctx: HandleContext,
    readiness_timeout: Duration,
    shutdown: CancellationToken,
}

/// Maps tenants to worker handles
#[derive(Clone)]
pub struct WorkerDispatcher {
    inner: Arc<DispatcherInner>,
}

impl WorkerDispatcher {
    /// One handle wrapping the coordinator of the current process.
    pub fn single(
        rpc: Arc<dyn crate::rpc::WorkerRpc>,
        ctx: HandleContext,
        config: &DispatcherConfig,
    ) -> Self {
        let handle = Arc::new(WorkerHandle::local(LOCAL_WORKER_ID, rpc, ctx.clone()));
        Self::start(Backend::Single(handle), ctx, config)
    }

    /// Bounded pool of child processes started by `launcher`.
    pub fn pooled(
        launcher: Arc<dyn WorkerLauncher>,
        ctx: HandleContext,
        config: &DispatcherConfig,
    ) -> Result<Self> {
        let spawner = Arc::new(Spawner {
            launcher,
            pending: DashMap::new(),
            next_child: AtomicU32::new(LOCAL_WORKER_ID + 1),
            server_socket: config.server_socket.clone(),
            ctx: ctx.clone(),
        });
        let factory: Arc<dyn ResourceFactory<Arc<WorkerHandle>>> = Arc::new(WorkerFactory {
            spawner: Arc::clone(&spawner),
        });
        let pool = ResourcePool::new(factory, config.max_workers, config.prewarm)?;

        Ok(Self::start(Backend::Pooled { pool, spawner }, ctx, config))
    }

    fn start(backend: Backend, ctx: HandleContext, config: &DispatcherConfig) -> Self {
        let inner = Arc::new(DispatcherInner {
            backend,
            ctx,
            readiness_timeout: config.readiness_timeout,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(run_metrics_ticker(
            Arc::downgrade(&inner),
            config.metrics_interval,
            inner.shutdown.clone(),
        ));

        Self { inner }
    }

    pub fn mode(&self) -> DispatchMode {
        match self.inner.backend {
            Backend::Single(_) => DispatchMode::Single,
            Backend::Pooled { .. } => DispatchMode::Pooled,
        }
    }

    pub fn readiness_timeout(&self) -> Duration {
        self.inner.readiness_timeout
    }

    /// Handle bound to `tenant`, spawning a worker if the tenant is new.
    ///
    /// Fails with [`Error::TooMuchWork`] when every worker is bound.
    pub async fn route_to(&self, tenant: &str) -> Result<Arc<WorkerHandle>> {
        match &self.inner.backend {
            Backend::Single(handle) => Ok(Arc::clone(handle)),
            Backend::Pooled { pool, .. } => {
                let key = tenant.to_string();
                let handle = pool.get(&key).await?;
                if handle.state() != WorkerState::Recycling {
                    return Ok(handle);
                }

                info!(tenant, worker_id = handle.id(), "Replacing recycling worker");
                if let Some(stale) = pool.remove(&key) {
                    self.release_later(stale);
                }
                Ok(pool.get(&key).await?)
            }
        }
    }

    fn release_later(&self, handle: Arc<WorkerHandle>) {
        if let Backend::Pooled { spawner, .. } = &self.inner.backend {
            spawner.pending.remove(&handle.id());
        }
        tokio::spawn(async move { handle.dispose().await });
    }

    /// Retire the worker bound to `tenant`. Returns whether one was bound.
    pub async fn recycle(&self, tenant: &str) -> bool {
        match &self.inner.backend {
            Backend::Single(_) => {
                warn!(tenant, "Cannot recycle the in-process worker");
                false
            }
            Backend::Pooled { pool, .. } => pool.remove_and_release(&tenant.to_string()).await,
        }
    }

    /// Every constructed handle, for broadcasts.
    pub fn all_handles(&self) -> Vec<Arc<WorkerHandle>> {
        match &self.inner.backend {
            Backend::Single(handle) => vec![Arc::clone(handle)],
            Backend::Pooled { pool, .. } => pool.values(),
        }
    }

    /// Fulfil the readiness signal of a spawned worker.
    pub fn mark_ready(&self, worker_id: WorkerId) -> bool {
        let Backend::Pooled { spawner, .. } = &self.inner.backend else {
            return false;
        };
        match spawner.pending.remove(&worker_id) {
            Some((_, ready)) => {
                debug!(worker_id, "Worker reported ready");
                ready.send(()).is_ok()
            }
            None => {
                warn!(worker_id, "Readiness from unknown worker");
                false
            }
        }
    }

    /// Route an order, track it on its handle and run it.
    pub async fn submit(&self, order: WorkOrder) -> Result<WorkResult> {
        let handle = self.route_to(&order.tenant_id).await?;
        let client = handle.get_client(self.inner.readiness_timeout).await?;

        let Some(_guard) = handle.track(&order).await else {
            warn!(execution_id = %order.execution_id, "Duplicate execution id");
            return Ok(WorkResult::failure(
                ResultCode::UserException,
                format!("Execution {} is already running", order.execution_id),
                None,
            ));
        };
        let result = client.execute(order).await;

        if matches!(result, Err(Error::ConnectionClosed)) {
            warn!(worker_id = handle.id(), "Lost connection to worker");
            handle.mark_recycling();
        }
        result
    }

    /// Live executions of every reachable worker, merged by tenant.
    pub async fn list_executions(&self) -> ExecutionListing {
        let timeout = self.inner.readiness_timeout;
        let calls = self.ready_handles().into_iter().map(|handle| async move {
            let client = handle.get_client(timeout).await?;
            client.list_current_executions().await
        });

        let mut listing = ExecutionListing::new();
        for result in join_all(calls).await {
            match result {
                Ok(part) => {
                    for (tenant, executions) in part {
                        listing.entry(tenant).or_default().extend(executions);
                    }
                }
                Err(e) => debug!(error = %e, "Worker skipped in listing"),
            }
        }
        listing
    }

    /// Cancel a logical worker's executions on every reachable worker process.
    pub async fn cancel_worker_executions(&self, worker_id: &str) -> Vec<ExecutionId> {
        let timeout = self.inner.readiness_timeout;
        let calls = self.ready_handles().into_iter().map(|handle| async move {
            let client = handle.get_client(timeout).await?;
            client.cancel_worker_executions(worker_id).await
        });

        let mut cancelled = Vec::new();
        for result in join_all(calls).await {
            match result {
                Ok(ids) => cancelled.extend(ids),
                Err(e) => debug!(error = %e, "Worker skipped in cancellation"),
            }
        }
        cancelled
    }

    pub async fn query_db(&self, query: DbQuery) -> Result<DbOutcome> {
        let handle = self.route_to(&query.tenant_id).await?;
        let client = handle.get_client(self.inner.readiness_timeout).await?;
        client.query_db(query).await
    }

    fn ready_handles(&self) -> Vec<Arc<WorkerHandle>> {
        self.all_handles()
            .into_iter()
            .filter(|handle| handle.state().is_ready())
            .collect()
    }

    /// Advance the metrics clock and sweep finished executions.
    pub fn tick(&self) {
        let now = self.inner.ctx.clock.advance();
        for handle in self.all_handles() {
            handle.on_metrics_tick(now);
        }
    }

    /// Stop the ticker and dispose of every worker.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        match &self.inner.backend {
            Backend::Single(handle) => {
                handle.mark_recycling();
            }
            Backend::Pooled { pool, .. } => pool.shutdown().await,
        }
        info!("Dispatcher shut down");
    }
}

async fn run_metrics_ticker(
    inner: Weak<DispatcherInner>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(inner) = inner.upgrade() else {
            break;
        };
        WorkerDispatcher { inner }.tick();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::process::Child;
    use tokio::sync::Notify;

    use crate::rpc::{bind, serve, CancelReply, Reply, Request, RequestHandler, WorkerRpc};
    use crate::worker::testing::{context, NullRpc};

    /// Records launches without starting anything
    #[derive(Default)]
    struct RecordingLauncher {
        specs: Mutex<Vec<LaunchSpec>>,
    }

    #[async_trait]
    impl WorkerLauncher for RecordingLauncher {
        async fn launch(&self, spec: &LaunchSpec) -> Result<Option<Child>> {
            self.specs.lock().push(spec.clone());
            Ok(None)
        }
    }

    /// Worker process with one live `acme` execution
    struct BusyWorker;

    #[async_trait]
    impl RequestHandler for BusyWorker {
        async fn handle(&self, request: Request) -> Result<Reply> {
            match request {
                Request::ListCurrentExecutions => {
                    let mut listing = ExecutionListing::new();
                    listing.insert(
                        "acme".to_string(),
                        vec![WorkOrder::new("e-live", "acme", "main", "").descriptor()],
                    );
                    Ok(Reply::Executions(listing))
                }
                Request::CancelWorkerExecutions(_) => Ok(Reply::Cancelled(CancelReply {
                    cancelled_execution_ids: vec!["e-live".to_string()],
                })),
                _ => Ok(Reply::Ack),
            }
        }
    }

    /// Holds every execution until released
    #[derive(Default)]
    struct GateRpc(Notify);

    #[async_trait]
    impl WorkerRpc for GateRpc {
        async fn execute(&self, order: WorkOrder) -> Result<WorkResult> {
            self.0.notified().await;
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

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn config(dir: &Path, max_workers: usize) -> DispatcherConfig {
        DispatcherConfig {
            max_workers,
            prewarm: 0,
            readiness_timeout: Duration::from_millis(100),
            metrics_interval: Duration::from_secs(3600),
            server_socket: dir.join("sandpool.sock"),
        }
    }

    fn pooled(dir: &Path, max_workers: usize) -> (WorkerDispatcher, Arc<RecordingLauncher>) {
        let launcher = Arc::new(RecordingLauncher::default());
        let (ctx, _) = context();
        let dispatcher =
            WorkerDispatcher::pooled(launcher.clone(), ctx, &config(dir, max_workers)).unwrap();
        (dispatcher, launcher)
    }

    #[test]
    fn test_child_socket_path() {
        assert_eq!(
            child_socket_path(Path::new("/run/sandpool.sock"), 7),
            PathBuf::from("/run/sandpool.7.sock")
        );
        assert_eq!(
            child_socket_path(Path::new("/run/sandpool"), 2),
            PathBuf::from("/run/sandpool.2")
        );
    }

    #[tokio::test]
    async fn test_same_tenant_same_handle() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, launcher) = pooled(dir.path(), 2);

        let a = dispatcher.route_to("acme").await.unwrap();
        let b = dispatcher.route_to("acme").await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(launcher.specs.lock().len(), 1);
        assert_eq!(a.state(), WorkerState::Starting);
    }

    #[tokio::test]
    async fn test_exhaustion_is_too_much_work() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, _) = pooled(dir.path(), 1);

        dispatcher.route_to("acme").await.unwrap();
        let error = dispatcher.route_to("globex").await.unwrap_err();

        assert!(matches!(error, Error::TooMuchWork { max: 1 }));
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn test_launch_spec_uses_numbered_sockets() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sandpool.1.sock"), b"").unwrap();
        let (dispatcher, launcher) = pooled(dir.path(), 2);

        let handle = dispatcher.route_to("acme").await.unwrap();

        let specs = launcher.specs.lock().clone();
        assert_eq!(specs[0].worker_id, 2);
        assert_eq!(specs[0].socket, dir.path().join("sandpool.2.sock"));
        assert_eq!(specs[0].server_socket, dir.path().join("sandpool.sock"));
        assert_eq!(handle.id(), 2);
    }

    #[tokio::test]
    async fn test_mark_ready_makes_handle_available() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, _) = pooled(dir.path(), 1);
        let handle = dispatcher.route_to("acme").await.unwrap();

        assert!(dispatcher.mark_ready(handle.id()));
        assert!(!dispatcher.mark_ready(handle.id()));

        wait_until(|| handle.state() == WorkerState::Available).await;
    }

    #[tokio::test]
    async fn test_silent_worker_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, _) = pooled(dir.path(), 1);
        let order = WorkOrder::new("e1", "acme", "main", "");

        let result = dispatcher.submit(order).await;
        assert!(matches!(result, Err(Error::ReadinessTimeout { .. })));
    }

    #[tokio::test]
    async fn test_recycling_handle_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, launcher) = pooled(dir.path(), 1);

        let first = dispatcher.route_to("acme").await.unwrap();
        first.mark_recycling();

        let second = dispatcher.route_to("acme").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.state(), WorkerState::Starting);
        assert_eq!(launcher.specs.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_recycle_frees_the_slot() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, _) = pooled(dir.path(), 1);

        let handle = dispatcher.route_to("acme").await.unwrap();
        assert!(dispatcher.recycle("acme").await);
        assert_eq!(handle.state(), WorkerState::Recycling);

        dispatcher.route_to("globex").await.unwrap();
    }

    #[tokio::test]
    async fn test_single_mode_shares_one_local_handle() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = context();
        let dispatcher = WorkerDispatcher::single(Arc::new(NullRpc), ctx, &config(dir.path(), 1));

        let a = dispatcher.route_to("acme").await.unwrap();
        let b = dispatcher.route_to("globex").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.id(), LOCAL_WORKER_ID);
        assert_eq!(dispatcher.mode(), DispatchMode::Single);

        let result = dispatcher
            .submit(WorkOrder::new("e1", "acme", "main", ""))
            .await
            .unwrap();
        assert_eq!(result.message, "e1");

        // Finished but still attributed until the next tick.
        assert_eq!(a.executions().len(), 1);
        dispatcher.tick();
        assert!(a.executions().is_empty());
    }

    #[tokio::test]
    async fn test_broadcasts_skip_unready_workers() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, _) = pooled(dir.path(), 2);
        dispatcher.route_to("acme").await.unwrap();

        assert!(dispatcher.list_executions().await.is_empty());
        assert!(dispatcher.cancel_worker_executions("w1").await.is_empty());
    }

    #[tokio::test]
    async fn test_broadcasts_return_partial_results() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, _) = pooled(dir.path(), 2);
        let live = dispatcher.route_to("acme").await.unwrap();
        let dead = dispatcher.route_to("globex").await.unwrap();

        // Only the first worker actually listens on its socket.
        let shutdown = CancellationToken::new();
        let listener = bind(live.socket().unwrap()).unwrap();
        tokio::spawn(serve(listener, Arc::new(BusyWorker), shutdown.clone()));

        assert!(dispatcher.mark_ready(live.id()));
        assert!(dispatcher.mark_ready(dead.id()));
        wait_until(|| live.state().is_ready() && dead.state().is_ready()).await;

        let listing = dispatcher.list_executions().await;
        assert_eq!(listing.len(), 1);
        assert_eq!(listing["acme"][0].execution_id, "e-live");

        let cancelled = dispatcher.cancel_worker_executions("w1").await;
        assert_eq!(cancelled, vec!["e-live".to_string()]);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_duplicate_submission_keeps_original_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = context();
        let gate = Arc::new(GateRpc::default());
        let dispatcher = WorkerDispatcher::single(gate.clone(), ctx, &config(dir.path(), 1));
        let handle = dispatcher.route_to("acme").await.unwrap();

        let first = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .submit(WorkOrder::new("e1", "acme", "main", ""))
                    .await
            })
        };
        wait_until(|| handle.executions().len() == 1).await;

        let duplicate = dispatcher
            .submit(WorkOrder::new("e1", "acme", "main", ""))
            .await
            .unwrap();
        assert_eq!(duplicate.code, ResultCode::UserException);

        dispatcher.tick();
        assert_eq!(handle.executions().len(), 1);

        gate.0.notify_one();
        assert!(first.await.unwrap().unwrap().is_success());
    }

    #[tokio::test]
    async fn test_shutdown_disposes_workers() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, _) = pooled(dir.path(), 2);
        let handle = dispatcher.route_to("acme").await.unwrap();

        dispatcher.shutdown().await;

        assert_eq!(handle.state(), WorkerState::Recycling);
        assert!(matches!(
            dispatcher.route_to("acme").await,
            Err(Error::ShuttingDown)
        ));
    }
}
