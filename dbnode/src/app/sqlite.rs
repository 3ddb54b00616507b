//! Single-host cluster application backed by SQLite files

use super::{is_valid_namespace, AppFactory, ClusterApp, Pool};
use crate::error::{NodeError, Result};
use crate::node::{AppOption, NodeInfo};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Cluster application storing each namespace in `<data_dir>/<namespace>.db`
pub struct SqliteApp {
    id: u64,
    data_dir: PathBuf,
    address: Option<String>,
    tls: bool,
    pools: Mutex<Vec<Pool>>,
    closed: AtomicBool,
}

impl SqliteApp {
    pub fn new(id: u64, data_dir: impl Into<PathBuf>, options: &[AppOption]) -> Self {
        let mut address = None;
        let mut tls = false;
        for option in options {
            match option {
                AppOption::Address(addr) => address = Some(addr.clone()),
                AppOption::Tls { .. } => tls = true,
                AppOption::LogLevel(level) => debug!(level = %level, "Engine log level"),
                AppOption::Cluster(peers) => debug!(?peers, "Engine peers"),
            }
        }
        Self {
            id,
            data_dir: data_dir.into(),
            address,
            tls,
            pools: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(NodeError::Cluster(format!("node {} is closed", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterApp for SqliteApp {
    async fn open(&self, namespace: &str) -> Result<Pool> {
        self.check_open()?;
        if !is_valid_namespace(namespace) {
            return Err(NodeError::Config(format!(
                "invalid namespace {:?}",
                namespace
            )));
        }
        let path = self.data_dir.join(format!("{}.db", namespace));
        let pool = Pool::open(namespace, &path)?;

        let mut pools = self.pools.lock();
        pools.retain(|p| !p.is_closed());
        pools.push(pool.clone());
        debug!(namespace, path = %path.display(), "Opened namespace");
        Ok(pool)
    }

    async fn ready(&self) -> Result<()> {
        self.check_open()
    }

    async fn handover(&self) -> Result<()> {
        self.check_open()?;
        // Single host: there is no peer to take over
        debug!(node_id = self.id, "No peers to hand over to");
        Ok(())
    }

    fn id(&self) -> u64 {
        self.id
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for pool in self.pools.lock().drain(..) {
            pool.close();
        }
        info!(node_id = self.id, "Closed database node");
        Ok(())
    }
}

/// Builds [`SqliteApp`]s, taking the node id from `info.yaml`
#[derive(Debug, Default, Clone)]
pub struct SqliteAppFactory;

#[async_trait]
impl AppFactory for SqliteAppFactory {
    async fn new_app(
        &self,
        data_dir: &Path,
        options: Vec<AppOption>,
    ) -> Result<Arc<dyn ClusterApp>> {
        let info_path = data_dir.join("info.yaml");
        let content = match tokio::fs::read_to_string(&info_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(NodeError::NotFound(format!(
                    "node identity {}",
                    info_path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let info: NodeInfo = serde_yaml::from_str(&content)?;

        info!(node_id = info.id, address = %info.address, "Starting database node");
        Ok(Arc::new(SqliteApp::new(info.id, data_dir, &options)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_open_namespace_and_close() {
        let temp = tempdir().unwrap();
        let app = SqliteApp::new(42, temp.path(), &[]);

        app.ready().await.unwrap();
        let pool = app.open("controller").await.unwrap();
        pool.ping().unwrap();
        assert!(temp.path().join("controller.db").exists());

        app.close().await.unwrap();
        assert!(pool.is_closed());
        assert!(app.ready().await.is_err());
        assert!(matches!(
            app.open("controller").await,
            Err(NodeError::Cluster(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_path_like_namespace() {
        let temp = tempdir().unwrap();
        let app = SqliteApp::new(1, temp.path(), &[]);
        assert!(matches!(
            app.open("../escape").await,
            Err(NodeError::Config(_))
        ));
    }

    #[test]
    fn test_options_are_applied() {
        let app = SqliteApp::new(
            1,
            "/tmp",
            &[
                AppOption::Address("10.0.0.5:9000".to_string()),
                AppOption::Tls {
                    cert_path: "cert.pem".into(),
                    key_path: "key.pem".into(),
                    ca_cert_path: None,
                },
            ],
        );
        assert_eq!(app.address(), Some("10.0.0.5:9000"));
        assert!(app.tls_enabled());
    }

    #[tokio::test]
    async fn test_factory_requires_node_identity() {
        let temp = tempdir().unwrap();
        let result = SqliteAppFactory.new_app(temp.path(), vec![]).await;
        assert!(matches!(result, Err(NodeError::NotFound(_))));
    }
}
