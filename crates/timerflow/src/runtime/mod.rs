//! Runtime that delivers persisted timer tasks to the executors.
//!
//! - [`TimerRuntime`]: spawns timer workers and coordinates shutdown
//! - [`RuntimeConfig`]: polling intervals, deadlines and concurrency
//! - [`RetryPolicy`]: backoff for failed attempts
//!
//! # Example
//!
//! ```ignore
//! use timerflow::runtime::{RuntimeConfig, TimerRuntime};
//!
//! let router = TimerTaskRouter::new(store.clone(), clock, metadata, resender, config, ["west"])?;
//! let runtime = TimerRuntime::new(router, store, RuntimeConfig::default());
//!
//! runtime.run(shutdown_signal).await?;
//! ```

mod config;
mod retry;
mod timer_worker;

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

pub use config::RuntimeConfig;
pub use retry::RetryPolicy;

use crate::executor::TimerTaskRouter;
use crate::store::{ExecutionStore, TimerTaskQueue};
use timer_worker::TimerWorker;

/// Runs timer workers over a [`TimerTaskQueue`] until shut down.
pub struct TimerRuntime<S, Q> {
    router: Arc<TimerTaskRouter<S>>,
    queue: Q,
    config: RuntimeConfig,
    worker_id: String,
}

impl<S, Q> TimerRuntime<S, Q>
where
    S: ExecutionStore,
    Q: TimerTaskQueue,
{
    pub fn new(router: TimerTaskRouter<S>, queue: Q, config: RuntimeConfig) -> Self {
        let worker_id = config
            .worker_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self {
            router: Arc::new(router),
            queue,
            config,
            worker_id,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn router(&self) -> &TimerTaskRouter<S> {
        &self.router
    }

    /// Claim and process a single due task on the calling task.
    ///
    /// Returns `true` if a task was claimed.
    pub async fn process_one(&self) -> crate::Result<bool> {
        self.worker(format!("{}-timer", self.worker_id))
            .process_one()
            .await
    }

    fn worker(&self, worker_id: String) -> TimerWorker<S, Q> {
        TimerWorker::new(
            Arc::clone(&self.router),
            self.queue.clone(),
            self.config.clone(),
            worker_id,
        )
    }

    /// Run workers until `shutdown` completes, then wait for them to finish
    /// for at most `shutdown_timeout`.
    pub async fn run<F>(self, shutdown: F) -> crate::Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker_count = self.config.timer_workers.max(1);

        info!(
            worker_id = %self.worker_id,
            timer_workers = worker_count,
            "Timer runtime starting"
        );

        let mut worker_handles = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let worker_id = if worker_count == 1 {
                format!("{}-timer", self.worker_id)
            } else {
                format!("{}-timer-{}", self.worker_id, i)
            };
            let worker = self.worker(worker_id);
            let worker_shutdown_rx = shutdown_rx.clone();
            worker_handles.push(tokio::spawn(async move {
                worker.run(worker_shutdown_rx).await;
            }));
        }

        shutdown.await;
        let _ = shutdown_tx.send(true);

        let shutdown_timeout = self.config.shutdown_timeout;
        let all_workers = async {
            for handle in worker_handles {
                let _ = handle.await;
            }
        };

        match tokio::time::timeout(shutdown_timeout, all_workers).await {
            Ok(()) => {
                info!(worker_id = %self.worker_id, "Timer runtime stopped gracefully");
            }
            Err(_) => {
                warn!(
                    worker_id = %self.worker_id,
                    timeout_secs = shutdown_timeout.as_secs(),
                    "Shutdown timeout exceeded, forcing stop"
                );
            }
        }

        Ok(())
    }
}
