//! Shutdown coordination for background loops.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Coordinator for graceful shutdown.
///
/// Background loops subscribe to a broadcast channel and exit when it fires;
/// tasks spawned through the coordinator are awaited on `shutdown`.
#[derive(Debug)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Spawn a named background task that `shutdown` will wait for.
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::debug!(task = name, "Background task starting");
        self.tasks.lock().push((name, tokio::spawn(task)));
    }

    /// Fire the shutdown signal.
    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    /// Number of subscribed loops still running.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Fire the signal and wait up to `timeout` for every spawned task.
    ///
    /// Returns the names of tasks that were still running at the deadline.
    pub async fn shutdown(&self, timeout: Duration) -> Vec<&'static str> {
        self.trigger();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let deadline = tokio::time::Instant::now() + timeout;
        let mut stragglers = Vec::new();
        for (name, handle) in tasks {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(())) => tracing::debug!(task = name, "Background task stopped"),
                Ok(Err(e)) => tracing::error!(task = name, error = %e, "Background task failed"),
                Err(_) => {
                    tracing::warn!(task = name, "Background task did not stop before the deadline");
                    stragglers.push(name);
                }
            }
        }
        stragglers
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
