//! Node manager contract
//!
//! The node manager answers questions about this host's database node
//! (has it run before, is it still the lone loopback bootstrap member,
//! where does it keep its data) and owns the persisted cluster membership
//! and local node identity.
//!
//! # Backends
//!
//! - **Local**: YAML files in the node data directory ([`LocalNodeManager`])

mod local;

pub use local::LocalNodeManager;

use crate::error::{NodeError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

/// Role of a member in the database cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    #[default]
    Voter,
    StandBy,
    Spare,
}

/// A cluster member, also used as the local node identity record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: u64,
    /// Advertised address (host:port)
    pub address: String,
    #[serde(default)]
    pub role: NodeRole,
}

impl NodeInfo {
    /// Whether the member is bound to a loopback address
    pub fn is_loopback(&self) -> bool {
        split_host_port(&self.address)
            .ok()
            .and_then(|(host, _)| host.parse::<IpAddr>().ok())
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
    }
}

/// Startup option handed to the cluster application factory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppOption {
    /// Route engine logs at this level
    LogLevel(String),
    /// Bind and advertise this address
    Address(String),
    /// Secure inter-node traffic
    Tls {
        cert_path: PathBuf,
        key_path: PathBuf,
        ca_cert_path: Option<PathBuf>,
    },
    /// Peers to contact when joining
    Cluster(Vec<String>),
}

impl AppOption {
    pub fn is_tls(&self) -> bool {
        matches!(self, AppOption::Tls { .. })
    }
}

/// Source of node state and startup options
#[async_trait]
pub trait NodeManager: Send + Sync {
    /// Whether this host has run a database node before
    async fn is_existing_node(&self) -> Result<bool>;

    /// Whether this host is the original bootstrap member, still bound
    /// to loopback as the only member of its cluster
    async fn is_bootstrapped_node(&self) -> Result<bool>;

    /// Resolve (creating if needed) the node data directory
    async fn ensure_data_dir(&self) -> Result<PathBuf>;

    /// Current cluster members
    async fn cluster_servers(&self) -> Result<Vec<NodeInfo>>;

    /// Replace the persisted cluster members
    async fn set_cluster_servers(&self, servers: &[NodeInfo]) -> Result<()>;

    /// Replace the persisted local node identity
    async fn set_node_info(&self, info: &NodeInfo) -> Result<()>;

    fn with_log_option(&self) -> AppOption;

    fn with_address_option(&self) -> AppOption;

    fn with_tls_option(&self) -> AppOption;

    fn with_cluster_option(&self, peers: Vec<String>) -> AppOption;
}

/// Split `host:port`, accepting bracketed IPv6 hosts
pub fn split_host_port(address: &str) -> Result<(String, u16)> {
    let invalid = || NodeError::Config(format!("invalid address {:?}", address));

    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    let host = if host.starts_with('[') {
        host.strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .ok_or_else(invalid)?
    } else {
        host
    };
    if host.is_empty()
        || host.contains(['[', ']'])
        || (host.contains(':') && !address.starts_with('['))
    {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host.to_string(), port))
}

/// Join a host and port, bracketing IPv6 hosts
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
