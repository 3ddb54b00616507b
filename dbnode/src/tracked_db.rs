//! Verified connection handle for one namespace
//!
//! A [`TrackedDb`] owns the connection pool of a namespace and proves it is
//! usable on a fixed interval:
//!
//! ```text
//! every poll_interval:
//!   attempt 1..=verify_attempts:
//!     probe(pool) under ping_timeout, transient errors retried
//!     ok            → adopt pool, clear error, done
//!     failed, more  → reopen pool from the cluster application
//!   all failed      → close pool, record sticky error, terminate
//! ```
//!
//! Once the error is recorded every call fails with it without touching
//! the database. A fresh handle needs a fresh supervised start.

use crate::app::{ClusterApp, Pool};
use crate::config::NodeSettings;
use crate::error::{NodeError, Result};
use crate::metrics;
use crate::retry::RetryStrategy;
use crate::runner::Worker;
use async_trait::async_trait;
use parking_lot::RwLock;
use rusqlite::{Connection, Transaction};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Interval between verification cycles
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Probes per verification cycle before the handle gives up
pub const DEFAULT_VERIFY_ATTEMPTS: u32 = 3;

/// Upper bound for a single probe
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Proves that a pool can reach its database
#[async_trait]
pub trait PoolProbe: Send + Sync {
    async fn ping(&self, pool: &Pool) -> Result<()>;
}

/// Default probe running `SELECT 1`
#[derive(Debug, Default, Clone, Copy)]
pub struct PingProbe;

#[async_trait]
impl PoolProbe for PingProbe {
    async fn ping(&self, pool: &Pool) -> Result<()> {
        let pool = pool.clone();
        tokio::task::spawn_blocking(move || pool.ping())
            .await
            .map_err(|e| NodeError::Internal(format!("ping task failed: {}", e)))?
    }
}

/// Tuning for a tracked database
#[derive(Clone)]
pub struct TrackedDbOptions {
    pub poll_interval: Duration,
    pub verify_attempts: u32,
    pub ping_timeout: Duration,
    pub retry: RetryStrategy,
    pub probe: Arc<dyn PoolProbe>,
}

impl Default for TrackedDbOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            verify_attempts: DEFAULT_VERIFY_ATTEMPTS,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            retry: RetryStrategy::default(),
            probe: Arc::new(PingProbe),
        }
    }
}

impl From<&NodeSettings> for TrackedDbOptions {
    fn from(settings: &NodeSettings) -> Self {
        Self {
            poll_interval: settings.poll_interval(),
            verify_attempts: settings.db.verify_attempts.max(1),
            ping_timeout: settings.ping_timeout(),
            retry: RetryStrategy::from(&settings.retry),
            probe: Arc::new(PingProbe),
        }
    }
}

impl fmt::Debug for TrackedDbOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedDbOptions")
            .field("poll_interval", &self.poll_interval)
            .field("verify_attempts", &self.verify_attempts)
            .field("ping_timeout", &self.ping_timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

struct DbState {
    pool: Pool,
    err: Option<NodeError>,
}

/// Long-lived handle to one namespace
pub struct TrackedDb {
    namespace: String,
    app: Arc<dyn ClusterApp>,
    options: TrackedDbOptions,
    state: RwLock<DbState>,
    dying: CancellationToken,
    done: watch::Receiver<Option<Result<()>>>,
}

impl fmt::Debug for TrackedDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedDb")
            .field("namespace", &self.namespace)
            .field("err", &self.err())
            .finish_non_exhaustive()
    }
}

impl TrackedDb {
    /// Open the namespace and start verifying it in the background
    pub async fn start(
        app: Arc<dyn ClusterApp>,
        namespace: impl Into<String>,
        options: TrackedDbOptions,
    ) -> Result<Arc<Self>> {
        let namespace = namespace.into();
        let pool = app.open(&namespace).await?;
        let (done_tx, done_rx) = watch::channel(None);

        let db = Arc::new(Self {
            namespace,
            app,
            options,
            state: RwLock::new(DbState { pool, err: None }),
            dying: CancellationToken::new(),
            done: done_rx,
        });

        info!(namespace = %db.namespace, "Tracking database");
        let tracked = Arc::clone(&db);
        tokio::spawn(async move {
            let result = tracked.run_loop().await;
            tracked.state.read().pool.close();
            let _ = done_tx.send(Some(result));
        });

        Ok(db)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Sticky fatal error, if verification has given up
    pub fn err(&self) -> Option<NodeError> {
        self.state.read().err.clone()
    }

    fn current_pool(&self) -> Result<Pool> {
        let state = self.state.read();
        match &state.err {
            Some(err) => Err(err.clone()),
            None => Ok(state.pool.clone()),
        }
    }

    /// Run `f` on a connection from the current pool
    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let pool = self.current_pool()?;
        let conn = pool.get()?;
        f(&conn)
    }

    /// Run `f` inside a transaction, retrying transient failures.
    ///
    /// The transaction commits when `f` succeeds and rolls back otherwise.
    pub async fn with_transaction<F, T>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&Transaction<'_>) -> Result<T>,
    {
        let pool = self.current_pool()?;
        self.options
            .retry
            .run(|| {
                let conn = pool.get()?;
                let tx = conn.unchecked_transaction()?;
                let value = f(&tx)?;
                tx.commit()?;
                Ok(value)
            })
            .await
    }

    async fn run_loop(&self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.dying.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.options.poll_interval) => {}
            }

            tokio::select! {
                _ = self.dying.cancelled() => return Ok(()),
                result = self.verify() => result?,
            }
        }
    }

    /// Run one verification cycle. A handle that has given up stays
    /// failed: the recorded error is returned without pinging.
    pub(crate) async fn verify(&self) -> Result<()> {
        let started = Instant::now();
        let attempts = self.options.verify_attempts.max(1);
        let mut current = self.current_pool()?;
        let mut last_err = None;

        for attempt in 1..=attempts {
            match self.probe(&current).await {
                Ok(()) => {
                    self.adopt(current);
                    metrics::record_verify(&self.namespace, true, started.elapsed());
                    return Ok(());
                }
                Err(e) => {
                    warn!(namespace = %self.namespace, attempt, error = %e, "Database verification failed");
                    last_err = Some(e);
                }
            }

            if attempt == attempts {
                break;
            }

            metrics::record_reopen(&self.namespace);
            match self.app.open(&self.namespace).await {
                Ok(pool) => {
                    if !current.ptr_eq(&self.state.read().pool) {
                        current.close();
                    }
                    current = pool;
                    debug!(namespace = %self.namespace, "Reopened database pool");
                }
                Err(e) => {
                    warn!(namespace = %self.namespace, error = %e, "Reopening database pool failed");
                }
            }
        }

        let cause = last_err.map(|e| e.to_string()).unwrap_or_default();
        let err = NodeError::Connection(format!(
            "unable to verify database {}: {}",
            self.namespace, cause
        ));
        {
            let mut state = self.state.write();
            if !current.ptr_eq(&state.pool) {
                current.close();
            }
            state.pool.close();
            state.err = Some(err.clone());
        }
        error!(namespace = %self.namespace, error = %err, "Giving up on database");
        metrics::record_verify(&self.namespace, false, started.elapsed());
        Err(err)
    }

    async fn probe(&self, pool: &Pool) -> Result<()> {
        let timeout = self.options.ping_timeout;
        let probe = &self.options.probe;
        self.options
            .retry
            .run_async(|| async move {
                match tokio::time::timeout(timeout, probe.ping(pool)).await {
                    Ok(result) => result,
                    Err(elapsed) => Err(elapsed.into()),
                }
            })
            .await
    }

    fn adopt(&self, pool: Pool) {
        let mut state = self.state.write();
        if !state.pool.ptr_eq(&pool) {
            state.pool.close();
            state.pool = pool;
            info!(namespace = %self.namespace, "Switched to reopened database pool");
        }
        state.err = None;
    }
}

#[async_trait]
impl Worker for TrackedDb {
    fn kill(&self) {
        self.dying.cancel();
    }

    async fn wait(&self) -> Result<()> {
        let mut done = self.done.clone();
        let outcome = done
            .wait_for(Option::is_some)
            .await
            .map(|r| (*r).clone())
            .map_err(|_| NodeError::Internal(format!("{} exited without a result", self.namespace)))?;
        outcome.unwrap_or(Ok(()))
    }
}

/// Constructs the tracked database for a namespace
#[async_trait]
pub trait DbWorkerFactory: Send + Sync {
    async fn new_db_worker(
        &self,
        app: Arc<dyn ClusterApp>,
        namespace: &str,
    ) -> Result<Arc<TrackedDb>>;
}

/// Factory starting [`TrackedDb`]s with fixed options
#[derive(Debug, Clone, Default)]
pub struct TrackedDbFactory {
    options: TrackedDbOptions,
}

impl TrackedDbFactory {
    pub fn new(options: TrackedDbOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl DbWorkerFactory for TrackedDbFactory {
    async fn new_db_worker(
        &self,
        app: Arc<dyn ClusterApp>,
        namespace: &str,
    ) -> Result<Arc<TrackedDb>> {
        TrackedDb::start(app, namespace, self.options.clone()).await
    }
}
