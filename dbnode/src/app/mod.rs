//! Cluster application contract
//!
//! A cluster application is the running database engine for this node.
//! The orchestrator starts one through an [`AppFactory`], waits for it to
//! become ready, opens namespaces on it and hands its responsibilities
//! over before closing it.

mod pool;
mod sqlite;

pub use pool::{Pool, PooledConnection};
pub use sqlite::{SqliteApp, SqliteAppFactory};

use crate::error::Result;
use crate::node::AppOption;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// Handle to the running database engine
#[async_trait]
pub trait ClusterApp: Send + Sync {
    /// Open a namespace as a connection pool
    async fn open(&self, namespace: &str) -> Result<Pool>;

    /// Block until the engine can serve requests
    async fn ready(&self) -> Result<()>;

    /// Transfer leadership and voting responsibilities to a peer
    async fn handover(&self) -> Result<()>;

    /// Stable numeric identifier of this node
    fn id(&self) -> u64;

    /// Stop the engine
    async fn close(&self) -> Result<()>;
}

/// Constructs cluster applications
#[async_trait]
pub trait AppFactory: Send + Sync {
    async fn new_app(&self, data_dir: &Path, options: Vec<AppOption>)
        -> Result<Arc<dyn ClusterApp>>;
}

/// Whether a namespace name is safe to use as a database file name
pub fn is_valid_namespace(namespace: &str) -> bool {
    !namespace.is_empty()
        && namespace.len() <= 128
        && !namespace.starts_with('.')
        && namespace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_validation() {
        assert!(is_valid_namespace("controller"));
        assert!(is_valid_namespace("model-0b7d_x.1"));
        assert!(!is_valid_namespace(""));
        assert!(!is_valid_namespace("../etc"));
        assert!(!is_valid_namespace("a/b"));
        assert!(!is_valid_namespace(".hidden"));
    }
}
