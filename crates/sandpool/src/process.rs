//! Worker Process
//!
//! The child side of pooled mode: bind the worker socket, announce readiness
//! to the server and answer execution requests until told to stop.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::execution::ExecutionCoordinator;
use crate::rpc::{bind, serve, SocketClient};
use crate::types::{Result, WorkerId};

/// Where this worker listens and whom it reports to
#[derive(Debug, Clone)]
pub struct WorkerEndpoint {
    pub worker_id: WorkerId,
    pub socket: PathBuf,
    pub server_socket: PathBuf,
}

/// Serve `coordinator` on the endpoint's socket until `shutdown` fires.
pub async fn serve_worker(
    endpoint: WorkerEndpoint,
    coordinator: Arc<ExecutionCoordinator>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = bind(&endpoint.socket)?;
    let server = tokio::spawn(serve(listener, coordinator, shutdown.clone()));

    if let Err(e) = announce(&endpoint).await {
        warn!(worker_id = endpoint.worker_id, error = %e, "Could not reach server");
        shutdown.cancel();
        let _ = server.await;
        remove_socket(&endpoint);
        return Err(e);
    }
    info!(
        worker_id = endpoint.worker_id,
        socket = %endpoint.socket.display(),
        "Worker ready"
    );

    shutdown.cancelled().await;
    match server.await {
        Ok(result) => result?,
        Err(e) => warn!(error = %e, "Worker server task failed"),
    }
    remove_socket(&endpoint);

    info!(worker_id = endpoint.worker_id, "Worker stopped");
    Ok(())
}

async fn announce(endpoint: &WorkerEndpoint) -> Result<()> {
    let client = SocketClient::connect(&endpoint.server_socket).await?;
    client.notify_ready(endpoint.worker_id).await
}

fn remove_socket(endpoint: &WorkerEndpoint) {
    if let Err(e) = std::fs::remove_file(&endpoint.socket) {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!(error = %e, "Failed to remove worker socket");
        }
    }
}

/// Cancel `shutdown` once stdin reaches EOF, i.e. the parent went away.
pub fn exit_on_stdin_eof(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 256];
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                read = stdin.read(&mut buf) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                },
            }
        }
        info!("Parent closed stdin, shutting down");
        shutdown.cancel();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sandpool_js_runtime::{ExecutionSignal, ScriptError, ScriptHost, ScriptRequest};
    use std::time::Duration;

    use crate::rpc::{Reply, Request, RequestHandler, WorkerRpc};
    use crate::types::{ResultCode, WorkOrder};

    struct EntryHost;

    #[async_trait]
    impl ScriptHost for EntryHost {
        async fn run(
            &self,
            request: ScriptRequest,
            _signal: ExecutionSignal,
        ) -> std::result::Result<String, ScriptError> {
            Ok(request.entry)
        }
    }

    /// Server side that records readiness notices
    struct ReadyLog(tokio::sync::mpsc::UnboundedSender<WorkerId>);

    #[async_trait]
    impl RequestHandler for ReadyLog {
        async fn handle(&self, request: Request) -> Result<Reply> {
            if let Request::NotifyWorkerReady(notice) = request {
                let _ = self.0.send(notice.worker_id);
            }
            Ok(Reply::Ack)
        }
    }

    #[tokio::test]
    async fn test_worker_announces_and_serves() {
        let dir = tempfile::tempdir().unwrap();
        let server_socket = dir.path().join("sandpool.sock");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let server_shutdown = CancellationToken::new();
        tokio::spawn(serve(
            bind(&server_socket).unwrap(),
            Arc::new(ReadyLog(tx)),
            server_shutdown.clone(),
        ));

        let endpoint = WorkerEndpoint {
            worker_id: 4,
            socket: dir.path().join("sandpool.4.sock"),
            server_socket,
        };
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(serve_worker(
            endpoint.clone(),
            Arc::new(ExecutionCoordinator::new(Arc::new(EntryHost))),
            shutdown.clone(),
        ));

        let announced = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(announced, Some(4));

        let client = SocketClient::connect(&endpoint.socket).await.unwrap();
        let result = client
            .execute(WorkOrder::new("e1", "acme", "handler", ""))
            .await
            .unwrap();
        assert_eq!(result.code, ResultCode::Success);
        assert_eq!(result.message, "handler");

        shutdown.cancel();
        worker.await.unwrap().unwrap();
        assert!(!endpoint.socket.exists());
        server_shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = WorkerEndpoint {
            worker_id: 1,
            socket: dir.path().join("sandpool.1.sock"),
            server_socket: dir.path().join("missing.sock"),
        };

        let result = serve_worker(
            endpoint.clone(),
            Arc::new(ExecutionCoordinator::new(Arc::new(EntryHost))),
            CancellationToken::new(),
        )
        .await;

        assert!(result.is_err());
        assert!(!endpoint.socket.exists());
    }
}
