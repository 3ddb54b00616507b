//! File-backed node manager
//!
//! Layout of the data directory:
//!
//! ```text
//! <data_dir>/
//!   info.yaml      local node identity (id, address, role)
//!   cluster.yaml   known cluster members
//!   <namespace>.db one database file per namespace
//! ```

use super::{join_host_port, split_host_port, AppOption, NodeInfo, NodeManager, NodeRole};
use crate::config::NodeSettings;
use crate::error::{NodeError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const INFO_FILE: &str = "info.yaml";
const CLUSTER_FILE: &str = "cluster.yaml";

/// Node manager persisting identity and membership as YAML
pub struct LocalNodeManager {
    settings: NodeSettings,
}

impl LocalNodeManager {
    pub fn new(settings: NodeSettings) -> Self {
        Self { settings }
    }

    pub fn data_dir(&self) -> &Path {
        &self.settings.data_dir
    }

    fn info_path(&self) -> PathBuf {
        self.settings.data_dir.join(INFO_FILE)
    }

    fn cluster_path(&self) -> PathBuf {
        self.settings.data_dir.join(CLUSTER_FILE)
    }

    /// Local node identity
    pub async fn node_info(&self) -> Result<NodeInfo> {
        read_yaml(&self.info_path()).await
    }

    /// Initialise a brand new single-member cluster bound to loopback.
    ///
    /// Returns the existing identity untouched if this host already
    /// has node state.
    pub async fn bootstrap(&self) -> Result<NodeInfo> {
        if self.is_existing_node().await? {
            return self.node_info().await;
        }

        self.ensure_data_dir().await?;
        let (_, port) = split_host_port(&self.settings.bind_addr)?;
        let node = NodeInfo {
            id: new_node_id(),
            address: join_host_port("127.0.0.1", port),
            role: NodeRole::Voter,
        };

        self.set_cluster_servers(std::slice::from_ref(&node)).await?;
        self.set_node_info(&node).await?;
        info!(node_id = node.id, address = %node.address, "Bootstrapped database node");
        Ok(node)
    }
}

/// Random node id in `1..=i64::MAX`, so it fits an SQLite integer
fn new_node_id() -> u64 {
    // Zero is reserved by the engine
    let (high, low) = uuid::Uuid::new_v4().as_u64_pair();
    ((high ^ low) >> 1).max(1)
}

async fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(NodeError::NotFound(path.display().to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    Ok(serde_yaml::from_str(&content)?)
}

async fn write_yaml<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let content = serde_yaml::to_string(value)?;
    let tmp = path.with_extension("yaml.tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    debug!(path = %path.display(), "Wrote node state");
    Ok(())
}

#[async_trait]
impl NodeManager for LocalNodeManager {
    async fn is_existing_node(&self) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.info_path()).await?)
    }

    async fn is_bootstrapped_node(&self) -> Result<bool> {
        let servers = self.cluster_servers().await?;
        Ok(servers.len() == 1 && servers[0].is_loopback())
    }

    async fn ensure_data_dir(&self) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.settings.data_dir).await?;
        Ok(self.settings.data_dir.clone())
    }

    async fn cluster_servers(&self) -> Result<Vec<NodeInfo>> {
        read_yaml(&self.cluster_path()).await
    }

    async fn set_cluster_servers(&self, servers: &[NodeInfo]) -> Result<()> {
        write_yaml(&self.cluster_path(), servers).await
    }

    async fn set_node_info(&self, info: &NodeInfo) -> Result<()> {
        write_yaml(&self.info_path(), info).await
    }

    fn with_log_option(&self) -> AppOption {
        AppOption::LogLevel(self.settings.logging.level.clone())
    }

    fn with_address_option(&self) -> AppOption {
        AppOption::Address(self.settings.bind_addr.clone())
    }

    fn with_tls_option(&self) -> AppOption {
        let tls = &self.settings.tls;
        AppOption::Tls {
            cert_path: tls.cert_path.clone(),
            key_path: tls.key_path.clone(),
            ca_cert_path: tls.ca_cert_path.clone(),
        }
    }

    fn with_cluster_option(&self, peers: Vec<String>) -> AppOption {
        AppOption::Cluster(peers)
    }
}
