//! Named worker supervisor
//!
//! Runs at most one worker per name. When a worker exits with an error the
//! runner consults [`RunnerParams::is_fatal`]:
//!
//! ```text
//! fatal     → runner dies, every worker is killed, wait() returns the error
//! non-fatal → worker restarted after restart_delay
//! ```

use crate::error::{NodeError, Result};
use crate::metrics;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A supervised background task
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// Ask the worker to stop
    fn kill(&self);

    /// Wait for the worker to stop, returning why it stopped
    async fn wait(&self) -> Result<()>;
}

/// Starts (or restarts) a worker
pub type StartFn<W> = Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<W>>> + Send + Sync>;

/// Failure policy of a runner
#[derive(Clone)]
pub struct RunnerParams {
    pub is_fatal: Arc<dyn Fn(&NodeError) -> bool + Send + Sync>,
    pub restart_delay: Duration,
}

impl RunnerParams {
    /// Every worker error brings the runner down
    pub fn always_fatal(restart_delay: Duration) -> Self {
        Self {
            is_fatal: Arc::new(|_: &NodeError| true),
            restart_delay,
        }
    }
}

impl fmt::Debug for RunnerParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerParams")
            .field("restart_delay", &self.restart_delay)
            .finish_non_exhaustive()
    }
}

/// Supervisor for named workers
pub struct WorkerRunner<W: Worker> {
    inner: Arc<RunnerInner<W>>,
}

struct RunnerInner<W: Worker> {
    params: RunnerParams,
    workers: Mutex<HashMap<String, Arc<W>>>,
    dying: CancellationToken,
    failure: parking_lot::Mutex<Option<NodeError>>,
    done: watch::Sender<bool>,
}

impl<W: Worker> WorkerRunner<W> {
    /// Create a runner. Must be called within a tokio runtime.
    pub fn new(params: RunnerParams) -> Self {
        let (done, _) = watch::channel(false);
        let inner = Arc::new(RunnerInner {
            params,
            workers: Mutex::new(HashMap::new()),
            dying: CancellationToken::new(),
            failure: parking_lot::Mutex::new(None),
            done,
        });

        let reaper = Arc::clone(&inner);
        tokio::spawn(async move {
            reaper.dying.cancelled().await;
            reaper.stop_all().await;
            reaper.done.send_replace(true);
        });

        Self { inner }
    }

    /// Start a worker under `name`.
    ///
    /// Fails with `AlreadyExists` when a worker of that name is running and
    /// with `ShuttingDown` once the runner is dying.
    pub async fn start_worker(&self, name: &str, start: StartFn<W>) -> Result<()> {
        if self.inner.dying.is_cancelled() {
            return Err(NodeError::ShuttingDown);
        }

        let mut workers = self.inner.workers.lock().await;
        if workers.contains_key(name) {
            return Err(NodeError::AlreadyExists(name.to_string()));
        }

        let worker = start().await?;
        if self.inner.dying.is_cancelled() {
            worker.kill();
            return Err(NodeError::ShuttingDown);
        }
        workers.insert(name.to_string(), Arc::clone(&worker));
        metrics::set_tracked_dbs(workers.len());
        drop(workers);

        debug!(worker = name, "Started worker");
        RunnerInner::monitor(Arc::clone(&self.inner), name.to_string(), worker, start);
        Ok(())
    }

    /// Look up a running worker
    pub async fn worker(&self, name: &str) -> Result<Arc<W>> {
        if self.inner.dying.is_cancelled() {
            return Err(NodeError::ShuttingDown);
        }
        self.inner
            .workers
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| NodeError::NotFound(format!("worker {}", name)))
    }

    /// Names of running workers, sorted
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.workers.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop the runner and every worker
    pub fn kill(&self) {
        self.inner.dying.cancel();
    }

    /// Cancelled once the runner starts dying
    pub fn dying(&self) -> CancellationToken {
        self.inner.dying.clone()
    }

    /// Wait until every worker has stopped. Returns the fatal worker
    /// error that brought the runner down, if any.
    pub async fn wait(&self) -> Result<()> {
        let mut done = self.inner.done.subscribe();
        // The sender lives in `inner`, which we hold
        let _ = done.wait_for(|stopped| *stopped).await;
        match self.inner.failure.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl<W: Worker> Drop for WorkerRunner<W> {
    fn drop(&mut self) {
        self.inner.dying.cancel();
    }
}

impl<W: Worker> RunnerInner<W> {
    fn monitor(inner: Arc<Self>, name: String, worker: Arc<W>, start: StartFn<W>) {
        tokio::spawn(async move {
            let mut worker = worker;
            loop {
                let result = worker.wait().await;
                inner.remove_if_current(&name, &worker).await;

                let err = match result {
                    Ok(()) => {
                        debug!(worker = %name, "Worker stopped");
                        return;
                    }
                    Err(_) if inner.dying.is_cancelled() => return,
                    Err(e) => e,
                };

                match inner.restart(&name, err, &start).await {
                    Some(next) => worker = next,
                    None => return,
                }
            }
        });
    }

    /// Handle a failed worker; returns its replacement if it was restarted
    async fn restart(&self, name: &str, err: NodeError, start: &StartFn<W>) -> Option<Arc<W>> {
        let mut err = err;
        loop {
            let fatal = (self.params.is_fatal)(&err);
            metrics::record_worker_failure(name, fatal);
            if fatal {
                error!(worker = %name, error = %err, "Fatal worker error, stopping runner");
                self.fail(err);
                return None;
            }

            warn!(
                worker = %name,
                error = %err,
                delay_ms = self.params.restart_delay.as_millis() as u64,
                "Worker failed, restarting"
            );
            tokio::select! {
                _ = self.dying.cancelled() => return None,
                _ = tokio::time::sleep(self.params.restart_delay) => {}
            }

            let mut workers = self.workers.lock().await;
            if self.dying.is_cancelled() || workers.contains_key(name) {
                return None;
            }
            match start().await {
                Ok(worker) => {
                    workers.insert(name.to_string(), Arc::clone(&worker));
                    metrics::set_tracked_dbs(workers.len());
                    info!(worker = %name, "Restarted worker");
                    return Some(worker);
                }
                Err(e) => err = e,
            }
        }
    }

    async fn remove_if_current(&self, name: &str, worker: &Arc<W>) {
        let mut workers = self.workers.lock().await;
        if workers.get(name).is_some_and(|w| Arc::ptr_eq(w, worker)) {
            workers.remove(name);
            metrics::set_tracked_dbs(workers.len());
        }
    }

    fn fail(&self, err: NodeError) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(err);
        }
        drop(failure);
        self.dying.cancel();
    }

    async fn stop_all(&self) {
        let workers: Vec<(String, Arc<W>)> = self.workers.lock().await.drain().collect();
        for (_, worker) in &workers {
            worker.kill();
        }
        for (name, worker) in workers {
            if let Err(e) = worker.wait().await {
                debug!(worker = %name, error = %e, "Worker stopped with error during shutdown");
            }
        }
        metrics::set_tracked_dbs(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Worker that runs until killed or failed by the test
    struct TestWorker {
        stop: CancellationToken,
        outcome: parking_lot::Mutex<Option<NodeError>>,
    }

    impl TestWorker {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                stop: CancellationToken::new(),
                outcome: parking_lot::Mutex::new(None),
            })
        }

        fn fail(&self, err: NodeError) {
            *self.outcome.lock() = Some(err);
            self.stop.cancel();
        }
    }

    #[async_trait]
    impl Worker for TestWorker {
        fn kill(&self) {
            self.stop.cancel();
        }

        async fn wait(&self) -> Result<()> {
            self.stop.cancelled().await;
            match self.outcome.lock().clone() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    fn starter(starts: Arc<AtomicU32>) -> StartFn<TestWorker> {
        Arc::new(move || {
            starts.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, NodeError>(TestWorker::new()) }.boxed()
        })
    }

    #[tokio::test]
    async fn test_start_is_idempotent_per_name() {
        let runner = WorkerRunner::new(RunnerParams::always_fatal(Duration::from_millis(10)));
        let starts = Arc::new(AtomicU32::new(0));

        runner.start_worker("a", starter(starts.clone())).await.unwrap();
        let err = runner.start_worker("a", starter(starts.clone())).await.unwrap_err();
        assert_eq!(err, NodeError::AlreadyExists("a".to_string()));
        runner.start_worker("b", starter(starts.clone())).await.unwrap();

        assert_eq!(starts.load(Ordering::SeqCst), 2);
        assert_eq!(runner.names().await, vec!["a".to_string(), "b".to_string()]);

        let a = runner.worker("a").await.unwrap();
        let b = runner.worker("b").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(matches!(runner.worker("c").await, Err(NodeError::NotFound(_))));

        runner.kill();
        runner.wait().await.unwrap();
        assert!(a.stop.is_cancelled());
        assert!(b.stop.is_cancelled());
    }

    #[tokio::test]
    async fn test_fatal_worker_error_stops_runner() {
        let runner = WorkerRunner::new(RunnerParams::always_fatal(Duration::from_millis(10)));
        let starts = Arc::new(AtomicU32::new(0));
        runner.start_worker("a", starter(starts.clone())).await.unwrap();
        runner.start_worker("b", starter(starts.clone())).await.unwrap();

        let a = runner.worker("a").await.unwrap();
        let b = runner.worker("b").await.unwrap();
        a.fail(NodeError::Connection("gone".to_string()));

        let result = tokio::time::timeout(Duration::from_secs(5), runner.wait())
            .await
            .unwrap();
        assert_eq!(result, Err(NodeError::Connection("gone".to_string())));
        assert!(b.stop.is_cancelled());
        assert_eq!(starts.load(Ordering::SeqCst), 2);
        assert!(matches!(
            runner.start_worker("c", starter(starts)).await,
            Err(NodeError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_non_fatal_error_restarts_worker() {
        let params = RunnerParams {
            is_fatal: Arc::new(|_: &NodeError| false),
            restart_delay: Duration::from_millis(5),
        };
        let runner = WorkerRunner::new(params);
        let starts = Arc::new(AtomicU32::new(0));
        runner.start_worker("a", starter(starts.clone())).await.unwrap();

        let first = runner.worker("a").await.unwrap();
        first.fail(NodeError::Connection("blip".to_string()));

        let second = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(w) = runner.worker("a").await {
                    if !Arc::ptr_eq(&w, &first) {
                        return w;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(starts.load(Ordering::SeqCst), 2);
        runner.kill();
        runner.wait().await.unwrap();
        assert!(second.stop.is_cancelled());
    }

    #[tokio::test]
    async fn test_clean_exit_removes_worker() {
        let runner = WorkerRunner::new(RunnerParams::always_fatal(Duration::from_millis(10)));
        let starts = Arc::new(AtomicU32::new(0));
        runner.start_worker("a", starter(starts.clone())).await.unwrap();
        runner.worker("a").await.unwrap().kill();

        tokio::time::timeout(Duration::from_secs(5), async {
            while runner.worker("a").await.is_ok() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // The name is free again and the runner is still alive
        runner.start_worker("a", starter(starts.clone())).await.unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 2);
        runner.kill();
        runner.wait().await.unwrap();
    }
}
