//! dbnode - Lifecycle management for a host's replicated database node
//!
//! This crate starts, supervises and reconfigures the embedded database
//! node of a controller host and hands out verified per-namespace
//! database handles.
//!
//! # Architecture
//!
//! - **Orchestrator**: single control loop deciding when the node starts,
//!   which namespaces are open and when the node must be rebound
//! - **Tracked DB**: per-namespace handle that re-verifies its connection
//!   pool on an interval and fails fatally after repeated failures
//! - **Runner**: named worker supervisor with a fatal-error policy
//! - **Node manager**: persisted node identity and cluster membership
//! - **Cluster app**: the running database engine behind a trait
//! - **Hub**: publish/subscribe bus carrying controller topology
//!
//! # Key Operations
//!
//! - `NodeOrchestrator::get_db`: verified handle for a namespace
//! - `run_supervised`: rebuild the orchestrator after a rebind
//! - `LocalNodeManager::bootstrap`: create a loopback single-member cluster

pub mod app;
pub mod config;
pub mod error;
pub mod hub;
pub mod metrics;
pub mod node;
pub mod orchestrator;
pub mod retry;
pub mod runner;
pub mod tracked_db;

pub use app::{AppFactory, ClusterApp, Pool, SqliteApp, SqliteAppFactory};
pub use config::{NodeConfig, NodeConfigBuilder, NodeSettings};
pub use error::{NodeError, Result};
pub use hub::{spawn_details_responder, ApiDetails, ApiServer, DetailsRequest, Hub, HubMessage, LocalHub};
pub use node::{AppOption, LocalNodeManager, NodeInfo, NodeManager, NodeRole};
pub use orchestrator::{
    run_supervised, NodeOrchestrator, NodeOutcome, NodeReport, CONTROLLER_NAMESPACE,
};
pub use retry::RetryStrategy;
pub use runner::{RunnerParams, StartFn, Worker, WorkerRunner};
pub use tracked_db::{DbWorkerFactory, PingProbe, PoolProbe, TrackedDb, TrackedDbFactory, TrackedDbOptions};
