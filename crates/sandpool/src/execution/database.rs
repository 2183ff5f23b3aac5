//! Access to tenant worker databases.

use async_trait::async_trait;

use crate::types::{DbOutcome, DbQuery};

/// Runs queries against a worker's databases
#[async_trait]
pub trait TenantDatabase: Send + Sync + 'static {
    async fn query(&self, query: DbQuery) -> DbOutcome;
}

/// Backend for deployments without database support
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDatabase;

#[async_trait]
impl TenantDatabase for NoDatabase {
    async fn query(&self, query: DbQuery) -> DbOutcome {
        DbOutcome::Error {
            code: "DatabaseUnavailable".to_string(),
            message: format!("No database backend for {}", query.database),
        }
    }
}

/// A single directory entry name that cannot climb out of its parent.
pub(crate) fn is_path_segment(name: &str) -> bool {
    !(name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0'))
}

/// Reject names that would leave the worker's storage directory.
pub(crate) fn check_database_name(name: &str) -> Option<DbOutcome> {
    (!is_path_segment(name)).then(|| DbOutcome::Error {
        code: "InvalidPath".to_string(),
        message: format!("Invalid database name: {:?}", name),
    })
}
