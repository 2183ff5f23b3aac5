//! sandpool - multi-tenant script execution pool
//!
//! This crate schedules tenant scripts onto isolated worker processes:
//! - Bounded keyed pool of workers, one per tenant, with pre-warming
//! - Framed RPC over Unix sockets between the server and its workers
//! - Per-execution deadlines enforced by repeatedly interrupting the host
//! - Execution tracking, bulk cancellation and metrics snapshots

pub mod config;
pub mod execution;
pub mod pool;
pub mod process;
pub mod rpc;
pub mod service;
pub mod types;
pub mod worker;

pub use config::Settings;
pub use execution::ExecutionCoordinator;
pub use service::SchedulerService;
pub use types::{Error, Result};
pub use worker::WorkerDispatcher;
