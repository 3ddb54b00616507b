use anyhow::{Context, Result};
use clap::Parser;
use dbnode::config::{expand_tilde, LoggingSettings, NodeConfig, NodeSettings};
use dbnode::hub::{spawn_details_responder, ApiDetails, Hub, HubMessage, LocalHub};
use dbnode::node::LocalNodeManager;
use dbnode::orchestrator::{run_supervised, NodeOrchestrator, CONTROLLER_NAMESPACE};
use dbnode::tracked_db::{TrackedDbFactory, TrackedDbOptions};
use dbnode::{NodeError, SqliteAppFactory};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "dbnode-server")]
#[command(about = "Database node for a controller host")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "dbnode.toml", env = "DBNODE_CONFIG")]
    config: PathBuf,

    /// Override the data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Override the controller id of this host
    #[arg(long)]
    controller_id: Option<String>,

    /// Create a loopback single-member cluster if this host has no node yet
    #[arg(long)]
    bootstrap: bool,
}

fn init_tracing(logging: &LoggingSettings) {
    let filter = EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| logging.level.clone()),
    );
    let json = logging.format.eq_ignore_ascii_case("json");

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();
}

/// Record this start in the controller database
async fn record_start(orchestrator: &NodeOrchestrator) -> dbnode::Result<()> {
    let db = orchestrator.get_db(CONTROLLER_NAMESPACE).await?;
    let node_id = orchestrator
        .report()
        .await
        .node_id
        .ok_or_else(|| NodeError::NotFound("node id".to_string()))?;
    let node_id = i64::try_from(node_id)
        .map_err(|_| NodeError::Internal(format!("node id {} out of range", node_id)))?;

    db.with_transaction(|tx| {
        tx.execute_batch(
            "CREATE TABLE IF NOT EXISTS node_starts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                node_id INTEGER NOT NULL,
                started_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )",
        )?;
        tx.execute("INSERT INTO node_starts (node_id) VALUES (?1)", [node_id])?;
        Ok(())
    })
    .await
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut settings = NodeSettings::load_or_create(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(data_dir) = &args.data_dir {
        settings.data_dir = expand_tilde(data_dir)?;
    }
    if let Some(id) = args.controller_id {
        settings.controller_id = id;
    }

    init_tracing(&settings.logging);
    info!(
        config = %args.config.display(),
        data_dir = %settings.data_dir.display(),
        controller_id = %settings.controller_id,
        "Starting database node server"
    );
    settings.ensure_dirs()?;

    if settings.metrics.enabled {
        let addr: SocketAddr = settings
            .metrics
            .bind_addr
            .parse()
            .with_context(|| format!("invalid metrics address {}", settings.metrics.bind_addr))?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("installing metrics exporter")?;
        info!(%addr, "Serving metrics");
    }

    let manager = Arc::new(LocalNodeManager::new(settings.clone()));
    if args.bootstrap {
        let node = manager.bootstrap().await?;
        info!(node_id = node.id, address = %node.address, "Node identity ready");
    }

    let hub = Arc::new(LocalHub::default());
    let shutdown = CancellationToken::new();
    let details = ApiDetails::from_addresses(settings.controllers.clone());
    let responder = spawn_details_responder(hub.clone(), details.clone(), shutdown.clone());

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                signal.cancel();
            }
            Err(e) => warn!(error = %e, "Unable to listen for shutdown signal"),
        }
    });

    let make_config = {
        let manager = manager.clone();
        let hub = hub.clone();
        let app_factory = Arc::new(SqliteAppFactory);
        let db_factory = Arc::new(TrackedDbFactory::new(TrackedDbOptions::from(&settings)));
        let controller_id = settings.controller_id.clone();
        let restart_delay = settings.restart_delay();
        move || {
            NodeConfig::builder()
                .controller_id(controller_id.clone())
                .node_manager(manager.clone())
                .hub(hub.clone())
                .app_factory(app_factory.clone())
                .db_factory(db_factory.clone())
                .restart_delay(restart_delay)
                .build()
        }
    };

    // Announce the configured topology once, as an API server would on startup
    let mut announce = !details.servers.is_empty();
    let on_start = {
        let hub = hub.clone();
        move |orchestrator: Arc<NodeOrchestrator>| {
            let hub = hub.clone();
            let details = details.clone();
            let publish = std::mem::take(&mut announce);
            tokio::spawn(async move {
                match record_start(&orchestrator).await {
                    Ok(()) => info!("Controller database ready"),
                    Err(NodeError::NotFound(_)) => {
                        info!("No database node on this host yet, run with --bootstrap to create one")
                    }
                    Err(e) => warn!(error = %e, "Controller database unavailable"),
                }
                if publish {
                    if let Err(e) = hub.publish(HubMessage::ApiDetails(details)).await {
                        warn!(error = %e, "Publishing controller details failed");
                    }
                }
            });
        }
    };

    let result = run_supervised(make_config, on_start, shutdown.clone()).await;
    shutdown.cancel();

    match responder.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Details responder failed"),
        Err(e) => warn!(error = %e, "Details responder panicked"),
    }

    result?;
    info!("Database node server stopped");
    Ok(())
}
