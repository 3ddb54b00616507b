//! Node orchestrator
//!
//! Owns the cluster application of this host and a [`WorkerRunner`] of
//! [`TrackedDb`]s, one per namespace. A single control task makes every
//! initialisation, shutdown and reconfiguration decision:
//!
//! ```text
//! startup:
//!   existing node?  ── yes → bootstrapped? ── no → add TLS option
//!        │                         └───────────────→ initialise
//!        └── no → publish details request, wait for topology
//!
//! loop:
//!   db request      → start tracked db for namespace, complete request
//!   api details     → rebind loopback bootstrap node, request restart
//!   runner died     → exit with the runner's error
//!   dying           → exit
//! ```
//!
//! Rebinding ends with [`NodeOutcome::RestartRequired`]; the supervising
//! layer (see [`run_supervised`]) then builds a fresh orchestrator that
//! starts the node on its new address.

use crate::app::ClusterApp;
use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::hub::{ApiDetails, DetailsRequest, HubMessage};
use crate::metrics;
use crate::node::{join_host_port, split_host_port, AppOption};
use crate::runner::{RunnerParams, StartFn, WorkerRunner};
use crate::tracked_db::TrackedDb;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Namespace holding the controller's own bookkeeping, opened eagerly
pub const CONTROLLER_NAMESPACE: &str = "controller";

/// Upper bound for handing over responsibilities before closing the node
pub const HANDOVER_TIMEOUT: Duration = Duration::from_secs(30);

const REQUESTER: &str = "db-accessor";
const REQUEST_QUEUE: usize = 16;

/// How an orchestrator finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOutcome {
    /// Killed or dropped
    Stopped,
    /// The node was reconfigured and the orchestrator must be rebuilt
    RestartRequired,
}

/// Point-in-time view of an orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeReport {
    pub initialised: bool,
    pub node_id: Option<u64>,
    pub namespaces: Vec<String>,
}

enum LoopControl {
    Continue,
    Restart,
}

struct DbRequest {
    namespace: String,
    done: oneshot::Sender<()>,
}

/// Lifecycle manager for this host's database node
pub struct NodeOrchestrator {
    shared: Arc<Shared>,
    requests: mpsc::Sender<DbRequest>,
    done: watch::Receiver<Option<Result<NodeOutcome>>>,
}

struct Shared {
    config: NodeConfig,
    app: Mutex<Option<Arc<dyn ClusterApp>>>,
    runner: WorkerRunner<TrackedDb>,
    dying: CancellationToken,
}

impl NodeOrchestrator {
    /// Spawn the control task. Must be called within a tokio runtime.
    pub fn start(config: NodeConfig) -> Self {
        let runner = WorkerRunner::new(RunnerParams::always_fatal(config.restart_delay));
        // Subscribe before anything is published so no reply is missed
        let topology = config.hub.subscribe();
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE);
        let (done_tx, done_rx) = watch::channel(None);

        let shared = Arc::new(Shared {
            config,
            app: Mutex::new(None),
            runner,
            dying: CancellationToken::new(),
        });

        let control = Arc::clone(&shared);
        tokio::spawn(async move {
            let result = control.run(requests_rx, topology).await;
            match &result {
                Ok(outcome) => info!(?outcome, "Node orchestrator stopped"),
                Err(e) => error!(error = %e, "Node orchestrator failed"),
            }
            let _ = done_tx.send(Some(result));
        });

        Self {
            shared,
            requests: requests_tx,
            done: done_rx,
        }
    }

    /// Get the tracked database for `namespace`, starting it if needed
    pub async fn get_db(&self, namespace: &str) -> Result<Arc<TrackedDb>> {
        let result = self.request_db(namespace).await;
        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.error_type(),
        };
        metrics::record_get_db(namespace, status);
        result
    }

    async fn request_db(&self, namespace: &str) -> Result<Arc<TrackedDb>> {
        let dying = &self.shared.dying;
        let (done_tx, done_rx) = oneshot::channel();
        let request = DbRequest {
            namespace: namespace.to_string(),
            done: done_tx,
        };

        tokio::select! {
            _ = dying.cancelled() => return Err(NodeError::ShuttingDown),
            sent = self.requests.send(request) => sent.map_err(|_| NodeError::ShuttingDown)?,
        }

        tokio::select! {
            _ = dying.cancelled() => return Err(NodeError::ShuttingDown),
            done = done_rx => done.map_err(|_| NodeError::ShuttingDown)?,
        }

        self.shared.runner.worker(namespace).await.map_err(|e| match e {
            NodeError::NotFound(_) => NodeError::NotFound(format!("database {}", namespace)),
            other => other,
        })
    }

    /// Current state of the node
    pub async fn report(&self) -> NodeReport {
        let node_id = self.shared.app.lock().await.as_ref().map(|app| app.id());
        NodeReport {
            initialised: node_id.is_some(),
            node_id,
            namespaces: self.shared.runner.names().await,
        }
    }

    /// Ask the orchestrator to stop
    pub fn kill(&self) {
        self.shared.dying.cancel();
    }

    /// Wait for the control task to finish
    pub async fn wait(&self) -> Result<NodeOutcome> {
        let mut done = self.done.clone();
        let outcome = done
            .wait_for(Option::is_some)
            .await
            .map(|r| (*r).clone())
            .map_err(|_| NodeError::Internal("orchestrator exited without a result".to_string()))?;
        outcome.unwrap_or(Ok(NodeOutcome::Stopped))
    }
}

impl Drop for NodeOrchestrator {
    fn drop(&mut self) {
        self.shared.dying.cancel();
    }
}

impl Shared {
    async fn run(
        &self,
        mut requests: mpsc::Receiver<DbRequest>,
        mut topology: broadcast::Receiver<HubMessage>,
    ) -> Result<NodeOutcome> {
        let result = self.run_loop(&mut requests, &mut topology).await;

        // Unblock callers before tearing down
        self.dying.cancel();
        requests.close();
        self.runner.kill();
        if let Err(e) = self.runner.wait().await {
            debug!(error = %e, "Namespace runner stopped with error");
        }
        self.shutdown_app().await;
        result
    }

    async fn run_loop(
        &self,
        requests: &mut mpsc::Receiver<DbRequest>,
        topology: &mut broadcast::Receiver<HubMessage>,
    ) -> Result<NodeOutcome> {
        tokio::select! {
            _ = self.dying.cancelled() => return Ok(NodeOutcome::Stopped),
            started = self.startup() => started?,
        }

        let runner_dying = self.runner.dying();
        loop {
            tokio::select! {
                _ = self.dying.cancelled() => return Ok(NodeOutcome::Stopped),
                _ = runner_dying.cancelled() => {
                    return match self.runner.wait().await {
                        Err(e) => Err(e),
                        Ok(()) => Err(NodeError::Internal("namespace runner stopped".to_string())),
                    };
                }
                request = requests.recv() => {
                    let Some(request) = request else {
                        return Ok(NodeOutcome::Stopped);
                    };
                    self.handle_request(request).await;
                }
                message = topology.recv() => match message {
                    Ok(HubMessage::ApiDetails(details)) => {
                        if let LoopControl::Restart = self.process_api_server_change(&details).await? {
                            return Ok(NodeOutcome::RestartRequired);
                        }
                    }
                    Ok(HubMessage::DetailsRequest(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed topology messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(NodeError::Internal("hub closed".to_string()));
                    }
                },
            }
        }
    }

    async fn startup(&self) -> Result<()> {
        let node_manager = &self.config.node_manager;

        if node_manager.is_existing_node().await? {
            let mut options = Vec::new();
            if !node_manager.is_bootstrapped_node().await? {
                // Peers are known; traffic between them must be secured
                options.push(node_manager.with_tls_option());
            }
            return self.initialise(options).await;
        }

        info!("No existing database node, requesting controller details");
        self.config
            .hub
            .publish(HubMessage::DetailsRequest(DetailsRequest {
                requester: REQUESTER.to_string(),
                local_only: true,
            }))
            .await?;
        Ok(())
    }

    async fn initialise(&self, mut options: Vec<AppOption>) -> Result<()> {
        let mut slot = self.app.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let node_manager = &self.config.node_manager;
        let data_dir = node_manager.ensure_data_dir().await?;
        options.push(node_manager.with_log_option());

        let app = self.config.app_factory.new_app(&data_dir, options).await?;
        if let Err(e) = app.ready().await {
            if let Err(close_err) = app.close().await {
                warn!(error = %close_err, "Closing unready database node failed");
            }
            return Err(e);
        }
        info!(node_id = app.id(), data_dir = %data_dir.display(), "Database node ready");
        *slot = Some(app);
        drop(slot);

        match self.open_database(CONTROLLER_NAMESPACE).await {
            Ok(()) | Err(NodeError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn handle_request(&self, request: DbRequest) {
        match self.open_database(&request.namespace).await {
            Ok(()) | Err(NodeError::AlreadyExists(_)) => {}
            Err(e) => {
                error!(namespace = %request.namespace, error = %e, "Opening database failed");
            }
        }
        let _ = request.done.send(());
    }

    async fn open_database(&self, namespace: &str) -> Result<()> {
        let app = self
            .app
            .lock()
            .await
            .clone()
            .ok_or_else(|| NodeError::NotFound("database node not initialised".to_string()))?;

        let factory = Arc::clone(&self.config.db_factory);
        let name = namespace.to_string();
        let start: StartFn<TrackedDb> = Arc::new(move || {
            let app = Arc::clone(&app);
            let factory = Arc::clone(&factory);
            let name = name.clone();
            async move { factory.new_db_worker(app, &name).await }.boxed()
        });

        self.runner.start_worker(namespace, start).await
    }

    async fn process_api_server_change(&self, details: &ApiDetails) -> Result<LoopControl> {
        let node_manager = &self.config.node_manager;

        if !node_manager.is_existing_node().await? {
            // Joining an existing cluster from a fresh host is not supported yet
            debug!("Ignoring controller details on a host without a database node");
            return Ok(LoopControl::Continue);
        }

        if !node_manager.is_bootstrapped_node().await? {
            debug!("Database node is already clustered");
            return Ok(LoopControl::Continue);
        }

        // Still the lone loopback bootstrap member: bind to a reachable
        // address before anyone can join.
        let controller_id = &self.config.controller_id;
        let address = details.internal_address(controller_id).ok_or_else(|| {
            NodeError::NotFound(format!("internal address for controller {}", controller_id))
        })?;
        let (host, _) = split_host_port(address)?;
        info!(controller_id = %controller_id, host = %host, "Rebinding database node");

        self.shutdown_app().await;

        let mut servers = node_manager.cluster_servers().await?;
        if servers.len() != 1 {
            warn!(members = servers.len(), "Not rebinding a node that is not a singular cluster");
            return Ok(LoopControl::Restart);
        }

        let (_, port) = split_host_port(&servers[0].address)?;
        servers[0].address = join_host_port(&host, port);
        node_manager.set_cluster_servers(&servers).await?;
        node_manager.set_node_info(&servers[0]).await?;

        info!(address = %servers[0].address, "Database node rebound, restart required");
        Ok(LoopControl::Restart)
    }

    /// Hand over and close the cluster application. Best-effort: failures
    /// are logged and the application is always released.
    async fn shutdown_app(&self) {
        let Some(app) = self.app.lock().await.take() else {
            return;
        };

        match tokio::time::timeout(HANDOVER_TIMEOUT, app.handover()).await {
            Ok(Ok(())) => debug!(node_id = app.id(), "Handed over responsibilities"),
            Ok(Err(e)) => warn!(node_id = app.id(), error = %e, "Handover failed"),
            Err(_) => warn!(node_id = app.id(), "Handover timed out"),
        }
        if let Err(e) = app.close().await {
            warn!(node_id = app.id(), error = %e, "Closing database node failed");
        }
    }
}

/// Run orchestrators until stopped, rebuilding on [`NodeOutcome::RestartRequired`].
///
/// `make_config` is called for every (re)start and `on_start` receives each
/// new orchestrator. Returns when `shutdown` fires or an orchestrator fails.
pub async fn run_supervised<F, S>(
    mut make_config: F,
    mut on_start: S,
    shutdown: CancellationToken,
) -> Result<()>
where
    F: FnMut() -> Result<NodeConfig>,
    S: FnMut(Arc<NodeOrchestrator>),
{
    loop {
        if shutdown.is_cancelled() {
            return Ok(());
        }

        let orchestrator = Arc::new(NodeOrchestrator::start(make_config()?));
        on_start(Arc::clone(&orchestrator));

        let outcome = tokio::select! {
            _ = shutdown.cancelled() => {
                orchestrator.kill();
                orchestrator.wait().await
            }
            outcome = orchestrator.wait() => outcome,
        };

        match outcome? {
            NodeOutcome::RestartRequired => {
                info!("Restarting node orchestrator");
                metrics::record_restart("rebind");
            }
            NodeOutcome::Stopped => return Ok(()),
        }
    }
}
