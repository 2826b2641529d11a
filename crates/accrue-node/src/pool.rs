//! Long-lived worker tasks sharing one shutdown signal.

use std::future::Future;

use accrue_core::error::AccrueError;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::error;

pub struct WorkerPool {
    tasks: JoinSet<Result<(), AccrueError>>,
    shutdown: watch::Sender<bool>,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerPool {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self { tasks: JoinSet::new(), shutdown }
    }

    /// Receiver that flips to `true` once [`shutdown`](Self::shutdown) is called.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn spawn<F>(&mut self, worker: F)
    where
        F: Future<Output = Result<(), AccrueError>> + Send + 'static,
    {
        self.tasks.spawn(worker);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Ask every worker to stop after its current iteration.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Wait until every worker has exited, or return the first error.
    ///
    /// Callers treat an `Err` as fatal for the process.
    pub async fn join(&mut self) -> Result<(), AccrueError> {
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(e) if e.is_cancelled() => return Err(AccrueError::Cancelled),
                Err(e) => {
                    error!("worker panicked: {}", e);
                    return Err(AccrueError::Cancelled);
                }
            }
        }
        Ok(())
    }
}
