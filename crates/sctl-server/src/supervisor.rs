//! # Supervised Tasks
//!
//! Every long-running part of the process (servers, sweeper, elector,
//! coordinators, event forwarder) is spawned here under one
//! [`CancellationToken`]. Shutdown cancels the token and waits for every
//! task to return; nothing is detached.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Owner of the process's background tasks.
pub struct Supervisor {
    cancel: CancellationToken,
    tasks: JoinSet<&'static str>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    /// An empty supervisor with a fresh token.
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Token every supervised task must observe.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn `task` under `name`. A task that returns before shutdown
    /// is logged; the others keep running.
    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::debug!(task = name, "spawning supervised task");
        self.tasks.spawn(async move {
            task.await;
            name
        });
    }

    /// Number of tasks still running.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no tasks are running.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait until `shutdown` resolves or any task exits on its own, then
    /// shut everything down.
    pub async fn run_until<S>(mut self, shutdown: S, grace: Duration)
    where
        S: Future<Output = ()>,
    {
        tokio::select! {
            _ = shutdown => tracing::info!("shutdown requested"),
            _ = self.cancel.cancelled() => {}
            Some(joined) = self.tasks.join_next() => match joined {
                Ok(name) => tracing::error!(task = name, "supervised task exited early"),
                Err(e) => tracing::error!(error = %e, "supervised task panicked"),
            },
        }
        self.shutdown_and_join(grace).await;
    }

    /// Cancel every task and wait for them, aborting whatever is still
    /// running after `grace`.
    pub async fn shutdown_and_join(mut self, grace: Duration) {
        self.cancel.cancel();
        let drain = async {
            while let Some(joined) = self.tasks.join_next().await {
                match joined {
                    Ok(name) => tracing::debug!(task = name, "task stopped"),
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => tracing::error!(error = %e, "supervised task panicked"),
                }
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            tracing::warn!(
                remaining = self.tasks.len(),
                grace_secs = grace.as_secs(),
                "tasks did not stop in time, aborting"
            );
            self.tasks.shutdown().await;
        }
    }
}
