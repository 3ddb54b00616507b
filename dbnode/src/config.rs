//! Node configuration
//!
//! Two layers:
//! - [`NodeSettings`]: the on-disk TOML file read by the server binary
//! - [`NodeConfig`]: the validated runtime wiring handed to the orchestrator

use crate::app::AppFactory;
use crate::error::{NodeError, Result};
use crate::hub::Hub;
use crate::node::NodeManager;
use crate::tracked_db::DbWorkerFactory;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Main node settings file
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct NodeSettings {
    /// Stable identifier of the controller hosting this node
    #[serde(default = "default_controller_id")]
    pub controller_id: String,

    /// Directory holding the database state and node identity files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Address the database node binds to
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default)]
    pub tls: TlsSettings,

    #[serde(default)]
    pub db: TrackedDbSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub runner: RunnerSettings,

    #[serde(default)]
    pub logging: LoggingSettings,

    #[serde(default)]
    pub metrics: MetricsSettings,

    /// Internal addresses of every controller, keyed by controller id.
    /// Served in reply to topology requests.
    #[serde(default)]
    pub controllers: BTreeMap<String, String>,
}

fn default_controller_id() -> String {
    "0".to_string()
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".dbnode")
}

fn default_bind_addr() -> String {
    "127.0.0.1:17666".to_string()
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            controller_id: default_controller_id(),
            data_dir: default_data_dir(),
            bind_addr: default_bind_addr(),
            tls: TlsSettings::default(),
            db: TrackedDbSettings::default(),
            retry: RetrySettings::default(),
            runner: RunnerSettings::default(),
            logging: LoggingSettings::default(),
            metrics: MetricsSettings::default(),
            controllers: BTreeMap::new(),
        }
    }
}

/// TLS material used for inter-node traffic once a node leaves its
/// loopback bootstrap binding
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TlsSettings {
    #[serde(default = "default_cert_path")]
    pub cert_path: PathBuf,

    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,

    /// CA used to verify peers
    pub ca_cert_path: Option<PathBuf>,
}

fn default_cert_path() -> PathBuf {
    PathBuf::from("./conf/tls/node-cert.pem")
}

fn default_key_path() -> PathBuf {
    PathBuf::from("./conf/tls/node-key.pem")
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            cert_path: default_cert_path(),
            key_path: default_key_path(),
            ca_cert_path: None,
        }
    }
}

/// Connection verification tuning for tracked databases
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TrackedDbSettings {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_verify_attempts")]
    pub verify_attempts: u32,

    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_ms: u64,
}

fn default_poll_interval() -> u64 {
    10_000
}

fn default_verify_attempts() -> u32 {
    3
}

fn default_ping_timeout() -> u64 {
    10_000
}

impl Default for TrackedDbSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            verify_attempts: default_verify_attempts(),
            ping_timeout_ms: default_ping_timeout(),
        }
    }
}

/// Retry tuning for transient (busy/locked) database errors
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    250
}

fn default_initial_delay() -> u64 {
    1
}

fn default_max_delay() -> u64 {
    100
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

/// Namespace worker supervisor tuning
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RunnerSettings {
    #[serde(default = "default_restart_delay")]
    pub restart_delay_ms: u64,
}

fn default_restart_delay() -> u64 {
    10_000
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            restart_delay_ms: default_restart_delay(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `text` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MetricsSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_addr")]
    pub bind_addr: String,
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9466".to_string()
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: default_metrics_addr(),
        }
    }
}

impl NodeSettings {
    /// Load settings from `path`, writing defaults there first if it is missing
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            let mut settings: NodeSettings = toml::from_str(&content)?;
            settings.data_dir = expand_tilde(&settings.data_dir)?;
            Ok(settings)
        } else {
            let settings = NodeSettings::default();
            settings.save(path)?;
            Ok(settings)
        }
    }

    /// Write settings as TOML
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Create the data directory
    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.db.poll_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.db.ping_timeout_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.runner.restart_delay_ms)
    }
}

/// Expand a leading `~` to the home directory
pub fn expand_tilde(path: &Path) -> Result<PathBuf> {
    let Ok(rest) = path.strip_prefix("~") else {
        return Ok(path.to_path_buf());
    };
    let home = dirs::home_dir()
        .ok_or_else(|| NodeError::Config("cannot resolve home directory".to_string()))?;
    Ok(home.join(rest))
}

/// Validated runtime configuration for a node orchestrator.
///
/// Built once through [`NodeConfig::builder`]; every collaborator is
/// required. Time comes from tokio and logging goes through `tracing`.
#[derive(Clone)]
pub struct NodeConfig {
    pub node_manager: Arc<dyn NodeManager>,
    pub hub: Arc<dyn Hub>,
    pub app_factory: Arc<dyn AppFactory>,
    pub db_factory: Arc<dyn DbWorkerFactory>,
    pub controller_id: String,
    /// Delay before a non-fatal namespace worker failure is restarted
    pub restart_delay: Duration,
}

impl fmt::Debug for NodeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeConfig")
            .field("controller_id", &self.controller_id)
            .field("restart_delay", &self.restart_delay)
            .finish_non_exhaustive()
    }
}

impl NodeConfig {
    pub fn builder() -> NodeConfigBuilder {
        NodeConfigBuilder::default()
    }
}

#[derive(Default)]
pub struct NodeConfigBuilder {
    node_manager: Option<Arc<dyn NodeManager>>,
    hub: Option<Arc<dyn Hub>>,
    app_factory: Option<Arc<dyn AppFactory>>,
    db_factory: Option<Arc<dyn DbWorkerFactory>>,
    controller_id: Option<String>,
    restart_delay: Option<Duration>,
}

impl NodeConfigBuilder {
    pub fn node_manager(mut self, node_manager: Arc<dyn NodeManager>) -> Self {
        self.node_manager = Some(node_manager);
        self
    }

    pub fn hub(mut self, hub: Arc<dyn Hub>) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn app_factory(mut self, factory: Arc<dyn AppFactory>) -> Self {
        self.app_factory = Some(factory);
        self
    }

    pub fn db_factory(mut self, factory: Arc<dyn DbWorkerFactory>) -> Self {
        self.db_factory = Some(factory);
        self
    }

    pub fn controller_id(mut self, id: impl Into<String>) -> Self {
        self.controller_id = Some(id.into());
        self
    }

    pub fn restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = Some(delay);
        self
    }

    /// Validate and freeze the configuration
    pub fn build(self) -> Result<NodeConfig> {
        let missing = |field: &str| NodeError::Config(format!("missing {}", field));

        let controller_id = self
            .controller_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| missing("controller id"))?;

        Ok(NodeConfig {
            node_manager: self.node_manager.ok_or_else(|| missing("node manager"))?,
            hub: self.hub.ok_or_else(|| missing("hub"))?,
            app_factory: self.app_factory.ok_or_else(|| missing("app factory"))?,
            db_factory: self.db_factory.ok_or_else(|| missing("db worker factory"))?,
            controller_id,
            restart_delay: self
                .restart_delay
                .unwrap_or_else(|| Duration::from_millis(default_restart_delay())),
        })
    }
}
