//! Starting worker processes.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::info;

use crate::types::{Error, Result, WorkerId};

/// Where a new worker listens and whom it reports to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub worker_id: WorkerId,
    pub socket: PathBuf,
    pub server_socket: PathBuf,
}

/// Starts a worker that binds `spec.socket` and then sends
/// `NotifyWorkerReady` to `spec.server_socket`.
#[async_trait]
pub trait WorkerLauncher: Send + Sync + 'static {
    /// Returns the child process, if the worker runs in one.
    async fn launch(&self, spec: &LaunchSpec) -> Result<Option<Child>>;
}

/// Re-executes a binary in `worker` mode.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    config: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            config: None,
        }
    }

    /// Launch copies of the running executable.
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Pass a config file through to the children.
    pub fn with_config(mut self, path: Option<PathBuf>) -> Self {
        self.config = path;
        self
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Option<Child>> {
        info!(
            worker_id = spec.worker_id,
            socket = %spec.socket.display(),
            "Spawning worker process: {}",
            self.program.display()
        );

        let mut cmd = Command::new(&self.program);
        if let Some(config) = &self.config {
            cmd.arg("--config").arg(config);
        }
        cmd.arg("worker")
            .arg("--worker-id")
            .arg(spec.worker_id.to_string())
            .arg("--socket")
            .arg(&spec.socket)
            .arg("--server-socket")
            .arg(&spec.server_socket)
            // Stdin stays open for the child's lifetime; EOF means the parent is gone.
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            Error::Spawn(format!(
                "Failed to spawn {}: {}",
                self.program.display(),
                e
            ))
        })?;

        Ok(Some(child))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> LaunchSpec {
        LaunchSpec {
            worker_id: 3,
            socket: PathBuf::from("/tmp/sandpool.3.sock"),
            server_socket: PathBuf::from("/tmp/sandpool.sock"),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let launcher = ProcessLauncher::new("/nonexistent/sandpool-binary");
        let result = launcher.launch(&spec()).await;
        assert!(matches!(result, Err(Error::Spawn(_))));
    }

    #[tokio::test]
    async fn test_spawned_child_can_be_awaited() {
        // `cat` rejects the worker flags and exits on its own.
        let launcher = ProcessLauncher::new("cat");
        let mut child = launcher.launch(&spec()).await.unwrap().unwrap();
        drop(child.stdin.take());

        let status = tokio::time::timeout(std::time::Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
    }
}
