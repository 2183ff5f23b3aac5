//! sandpool
//!
//! Multi-tenant script server, its worker processes and a small client.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use sandpool::config::{DispatchMode, ExecutionSettings, LogSettings, Settings};
use sandpool::execution::{ExecutionCoordinator, InterruptGovernor};
use sandpool::process::{exit_on_stdin_eof, serve_worker, WorkerEndpoint};
use sandpool::rpc::{self, CancelReply, SocketClient, WorkerRpc};
use sandpool::types::{WorkOrder, WorkerId};
use sandpool::worker::{
    DispatcherConfig, HandleContext, LogMetrics, MetricsClock, ObserverList, ProcessLauncher,
    TracingObserver, WorkerDispatcher,
};
use sandpool::SchedulerService;
use sandpool_js_runtime::DenoHost;

/// Multi-tenant script execution pool
#[derive(Parser, Debug)]
#[command(name = "sandpool", version)]
#[command(about = "Multi-tenant script execution pool", long_about = None)]
struct Cli {
    /// TOML settings file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server
    Serve,

    /// Run as a worker child (started by the server)
    Worker {
        #[arg(long)]
        worker_id: WorkerId,
        #[arg(long)]
        socket: PathBuf,
        #[arg(long)]
        server_socket: PathBuf,
    },

    /// Submit one script to a running server
    Run {
        #[arg(long)]
        tenant: String,
        /// Path to the script source
        #[arg(long)]
        script: PathBuf,
        #[arg(long, default_value = "main")]
        entry: String,
        /// JSON arguments; an array is spread
        #[arg(long, default_value = "[]")]
        args: String,
        /// Logical worker id
        #[arg(long)]
        worker: Option<String>,
        #[arg(long)]
        execution_id: Option<String>,
    },

    /// List executions in flight on a running server
    List,

    /// Cancel every execution of a logical worker
    Cancel { worker_id: String },
}

fn main() -> Result<()> {
    // V8 must come up on the main thread before any runtime thread exists.
    sandpool_js_runtime::init_platform();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;
    init_tracing(&settings.log);

    match cli.command {
        Command::Serve => serve(settings, cli.config).await,
        Command::Worker {
            worker_id,
            socket,
            server_socket,
        } => {
            let endpoint = WorkerEndpoint {
                worker_id,
                socket,
                server_socket,
            };
            work(settings, endpoint).await
        }
        Command::Run {
            tenant,
            script,
            entry,
            args,
            worker,
            execution_id,
        } => {
            let source = tokio::fs::read_to_string(&script)
                .await
                .with_context(|| format!("Failed to read {}", script.display()))?;
            let args: serde_json::Value =
                serde_json::from_str(&args).context("--args must be valid JSON")?;

            let execution_id = execution_id.unwrap_or_else(|| Uuid::new_v4().to_string());
            let mut order = WorkOrder::new(execution_id, tenant, entry, source)
                .with_args(args)
                .with_limits(settings.execution.default_limits);
            if let Some(worker) = worker {
                order = order.with_worker(worker);
            }

            let result = connect(&settings).await?.execute(order).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.is_success() {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::List => {
            let listing = connect(&settings).await?.list_current_executions().await?;
            println!("{}", serde_json::to_string_pretty(&listing)?);
            Ok(())
        }
        Command::Cancel { worker_id } => {
            let cancelled_execution_ids = connect(&settings)
                .await?
                .cancel_worker_executions(&worker_id)
                .await?;
            let reply = CancelReply {
                cancelled_execution_ids,
            };
            println!("{}", serde_json::to_string_pretty(&reply)?);
            Ok(())
        }
    }
}

/// Logs go to stderr; stdout carries command output.
fn init_tracing(log: &LogSettings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.filter));
    let registry = tracing_subscriber::registry().with(filter);

    if log.json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn coordinator(settings: &ExecutionSettings) -> ExecutionCoordinator {
    let mut host = DenoHost::new();
    if let Some(mb) = settings.heap_limit_mb {
        host = host.with_heap_limit(mb * 1024 * 1024);
    }
    ExecutionCoordinator::new(Arc::new(host))
        .with_governor(InterruptGovernor::new(settings.retry_interval()))
}

async fn connect(settings: &Settings) -> Result<SocketClient> {
    SocketClient::connect(&settings.socket)
        .await
        .with_context(|| format!("No server at {}", settings.socket.display()))
}

async fn serve(settings: Settings, config_path: Option<PathBuf>) -> Result<()> {
    info!("Starting sandpool v{}", env!("CARGO_PKG_VERSION"));

    // Bound first so prewarmed workers can announce themselves right away.
    let listener = rpc::bind(&settings.socket)?;

    let ctx = HandleContext {
        observers: ObserverList::new().with(Arc::new(TracingObserver)),
        metrics: Arc::new(LogMetrics),
        clock: Arc::new(MetricsClock::new()),
        storage_root: settings.storage_root.clone(),
    };
    let config = DispatcherConfig {
        max_workers: settings.dispatcher.max_workers,
        prewarm: settings.dispatcher.prewarm,
        readiness_timeout: settings.dispatcher.readiness_timeout(),
        metrics_interval: settings.dispatcher.metrics_interval(),
        server_socket: settings.socket.clone(),
    };

    let dispatcher = match settings.dispatcher.mode {
        DispatchMode::Single => WorkerDispatcher::single(
            Arc::new(coordinator(&settings.execution)),
            ctx,
            &config,
        ),
        DispatchMode::Pooled => {
            let launcher = ProcessLauncher::current_exe()?.with_config(config_path);
            WorkerDispatcher::pooled(Arc::new(launcher), ctx, &config)?
        }
    };

    info!(
        mode = ?settings.dispatcher.mode,
        max_workers = config.max_workers,
        "Server listening on {}",
        settings.socket.display()
    );

    let shutdown = CancellationToken::new();
    let service = Arc::new(SchedulerService::new(dispatcher.clone()));
    let server = tokio::spawn(rpc::serve(listener, service, shutdown.clone()));

    shutdown_signal().await;

    shutdown.cancel();
    dispatcher.shutdown().await;
    server.await??;
    if let Err(e) = std::fs::remove_file(&settings.socket) {
        error!("Failed to remove {}: {}", settings.socket.display(), e);
    }

    info!("Server shutdown complete");
    Ok(())
}

async fn work(settings: Settings, endpoint: WorkerEndpoint) -> Result<()> {
    let shutdown = CancellationToken::new();
    exit_on_stdin_eof(shutdown.clone());
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }

    let coordinator = Arc::new(coordinator(&settings.execution));
    serve_worker(endpoint, coordinator, shutdown).await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }
}
