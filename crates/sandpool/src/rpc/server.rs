//! Unix socket RPC server.
//!
//! Each connection gets a reader loop and a writer task. Requests are handled
//! concurrently and replies are written back as they complete.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::frame::{Frame, FrameReader, FrameWriter};
use super::messages::{fault_frame, Reply, Request};
use crate::types::Result;

/// Answers decoded requests
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Result<Reply>;
}

/// Bind a listener at `path`, replacing a stale socket file.
pub fn bind(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(UnixListener::bind(path)?)
}

/// Accept connections until `shutdown` fires.
pub async fn serve(
    listener: UnixListener,
    handler: Arc<dyn RequestHandler>,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        tokio::spawn(handle_connection(
                            stream,
                            Arc::clone(&handler),
                            shutdown.child_token(),
                        ));
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }
        }
    }

    debug!("RPC server stopped");
    Ok(())
}

async fn handle_connection(
    stream: UnixStream,
    handler: Arc<dyn RequestHandler>,
    shutdown: CancellationToken,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    let (tx, mut rx) = mpsc::channel::<Frame>(64);

    let writer = tokio::spawn(async move {
        let mut writer = FrameWriter::new(write_half);
        while let Some(frame) = rx.recv().await {
            if let Err(e) = writer.send(&frame).await {
                debug!(error = %e, "Failed to write reply");
                break;
            }
        }
    });

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = reader.recv() => frame,
        };

        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Dropping connection after protocol error");
                break;
            }
        };

        let handler = Arc::clone(&handler);
        let tx = tx.clone();
        tokio::spawn(async move {
            let request_id = frame.request_id;
            let reply = match Request::from_frame(&frame) {
                Ok(request) => handler.handle(request).await,
                Err(e) => Err(e),
            };
            let frame = match reply.and_then(|reply| reply.into_frame(request_id)) {
                Ok(frame) => frame,
                Err(e) => fault_frame(request_id, &e),
            };
            let _ = tx.send(frame).await;
        });
    }

    // In-flight handlers keep their sender clones until they reply.
    drop(tx);
    let _ = writer.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::rpc::{SocketClient, WorkerRpc};
    use crate::types::{DbOutcome, DbQuery, Error, WorkOrder, WorkResult};

    struct EchoHandler;

    #[async_trait]
    impl RequestHandler for EchoHandler {
        async fn handle(&self, request: Request) -> Result<Reply> {
            match request {
                Request::Execute(order) => {
                    // Later ids answer first to exercise out-of-order replies.
                    let delay: u64 = order.execution_id.parse().unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(50 - delay * 10)).await;
                    Ok(Reply::Executed(WorkResult::success(order.execution_id)))
                }
                Request::QueryWorkerDb(_) => Err(Error::TooMuchWork { max: 1 }),
                _ => Ok(Reply::Ack),
            }
        }
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_multiplexed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rpc.sock");
        let shutdown = CancellationToken::new();
        let listener = bind(&path).unwrap();
        tokio::spawn(serve(listener, Arc::new(EchoHandler), shutdown.clone()));

        let client = SocketClient::connect(&path).await.unwrap();
        let calls = (0..4).map(|i| {
            let order = WorkOrder::new(i.to_string(), "t", "main", "");
            client.execute(order)
        });
        let results = futures::future::join_all(calls).await;

        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap().message, i.to_string());
        }
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_handler_error_becomes_fault() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rpc.sock");
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(bind(&path).unwrap(), Arc::new(EchoHandler), shutdown.clone()));

        let client = SocketClient::connect(&path).await.unwrap();
        let query = DbQuery {
            tenant_id: "t".to_string(),
            worker_id: None,
            database: "main.db".to_string(),
            sql: "select 1".to_string(),
            params: Vec::new(),
        };
        let result: Result<DbOutcome> = client.query_db(query).await;

        let error = result.unwrap_err();
        assert!(matches!(error, Error::Remote { .. }));
        assert!(error.is_retryable());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_calls_fail_after_server_goes_away() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rpc.sock");
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(bind(&path).unwrap(), Arc::new(EchoHandler), shutdown.clone()));

        let client = SocketClient::connect(&path).await.unwrap();
        client.notify_ready(1).await.unwrap();

        shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(client.list_current_executions().await.is_err());
    }
}
