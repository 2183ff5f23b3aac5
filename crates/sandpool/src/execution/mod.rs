//! Running work orders inside a worker process

mod coordinator;
mod database;
mod governor;

pub use coordinator::ExecutionCoordinator;
pub(crate) use database::is_path_segment;
pub use database::{NoDatabase, TenantDatabase};
pub use governor::{CancellationScope, InterruptGovernor, DEFAULT_RETRY_INTERVAL};
