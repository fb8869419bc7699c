use tokio::task::JoinHandle;
use std::collections::HashMap;
use std::time::Duration;
use crate::error::{Error, Result};
use tracing::{info, error, warn};

/// Task Supervisor - Monitors the relay's background tasks
///
/// ## Purpose
/// Tracks the poller, broadcaster, status ticker and idle pruner so the relay
/// can report unexpected exits and shut everything down in one place.
///
/// ## Usage
/// ```rust,ignore
/// let mut supervisor = TaskSupervisor::new();
///
/// supervisor.spawn("price_poller", async move {
///     poller.run(shutdown).await;
/// });
///
/// if let Err(e) = supervisor.check_health() {
///     error!("Task failure detected: {:?}", e);
/// }
///
/// supervisor.shutdown_all(Duration::from_secs(5)).await;
/// ```
pub struct TaskSupervisor {
    tasks: HashMap<String, JoinHandle<()>>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        TaskSupervisor {
            tasks: HashMap::new(),
        }
    }

    /// Spawn a new background task and register it for monitoring
    pub fn spawn<F>(&mut self, name: impl Into<String>, future: F) -> &mut Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let handle = tokio::spawn(future);

        info!("Spawned background task: {}", name);
        if let Some(previous) = self.tasks.insert(name.clone(), handle) {
            warn!("Replaced running task {}, aborting previous instance", name);
            previous.abort();
        }
        self
    }

    /// Returns error if any task has terminated while the relay is running
    pub fn check_health(&mut self) -> Result<()> {
        let failed_tasks: Vec<String> = self.tasks.iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(name, _)| name.clone())
            .collect();

        if !failed_tasks.is_empty() {
            let error_msg = format!("Tasks terminated unexpectedly: {:?}", failed_tasks);
            error!("{}", error_msg);

            for name in &failed_tasks {
                self.tasks.remove(name);
            }

            return Err(Error::TaskError(error_msg));
        }

        Ok(())
    }

    pub fn active_task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_tracking(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Waits up to `grace` for every task to finish after cancellation has
    /// been signalled, then aborts whatever is still running.
    pub async fn shutdown_all(&mut self, grace: Duration) {
        info!("Shutting down {} background tasks", self.tasks.len());

        for (name, mut handle) in self.tasks.drain() {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => info!("Task {} stopped", name),
                Ok(Err(e)) => warn!("Task {} ended with error: {:?}", name, e),
                Err(_) => {
                    handle.abort();
                    warn!("Task {} did not stop within {:?}, aborted", name, grace);
                }
            }
        }
    }
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
