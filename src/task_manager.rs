//! In-memory registry of running workflow futures
//!
//! Each run is registered before it is spawned and removed when it ends, so the
//! registry answers "what is running right now" independently of the database.

use crate::types::TaskId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Handle given to a registered run
#[derive(Debug, Clone)]
pub struct RunTicket {
    /// Task being run
    pub task_id: TaskId,
    /// Distinguishes this run from later runs of the same task
    pub run_id: u64,
    /// Cancelled when the run should stop
    pub token: CancellationToken,
}

struct RunEntry {
    run_id: u64,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// Registry of in-flight task runs
#[derive(Default)]
pub struct TaskManager {
    runs: Mutex<HashMap<TaskId, RunEntry>>,
    next_run_id: AtomicU64,
}

impl TaskManager {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run of `task_id`
    ///
    /// Returns `None` if the task already has a run in flight.
    pub async fn register(&self, task_id: TaskId) -> Option<RunTicket> {
        let mut runs = self.runs.lock().await;
        if runs.contains_key(&task_id) {
            return None;
        }

        let run_id = self.next_run_id.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        runs.insert(
            task_id,
            RunEntry {
                run_id,
                token: token.clone(),
                handle: None,
            },
        );

        Some(RunTicket {
            task_id,
            run_id,
            token,
        })
    }

    /// Attach the spawned future's handle; ignored if the run already ended
    pub async fn attach(&self, ticket: &RunTicket, handle: JoinHandle<()>) {
        let mut runs = self.runs.lock().await;
        if let Some(entry) = runs.get_mut(&ticket.task_id) {
            if entry.run_id == ticket.run_id {
                entry.handle = Some(handle);
            }
        }
    }

    /// Remove a finished run; a newer run of the same task is left alone
    pub async fn complete(&self, ticket: &RunTicket) {
        let mut runs = self.runs.lock().await;
        if runs
            .get(&ticket.task_id)
            .is_some_and(|entry| entry.run_id == ticket.run_id)
        {
            runs.remove(&ticket.task_id);
        }
    }

    /// Signal the run of `task_id` to stop; returns whether one was active
    ///
    /// The entry stays registered until the run calls [`TaskManager::complete`], so
    /// the task counts as active until it has actually unwound.
    pub async fn cancel(&self, task_id: TaskId) -> bool {
        let runs = self.runs.lock().await;
        match runs.get(&task_id) {
            Some(entry) => {
                entry.token.cancel();
                tracing::debug!(task_id = %task_id, run_id = entry.run_id, "run cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel every run and wait for the futures to unwind
    pub async fn cancel_all_and_wait(&self) -> usize {
        let drained: Vec<(TaskId, RunEntry)> = self.runs.lock().await.drain().collect();
        for (_, entry) in &drained {
            entry.token.cancel();
        }
        let count = drained.len();
        for (task_id, entry) in drained {
            if let Some(handle) = entry.handle {
                if let Err(e) = handle.await {
                    tracing::warn!(task_id = %task_id, error = %e, "task run ended abnormally");
                }
            }
        }
        count
    }

    /// Whether `task_id` has a run in flight
    pub async fn is_active(&self, task_id: TaskId) -> bool {
        self.runs.lock().await.contains_key(&task_id)
    }

    /// Ids of tasks with a run in flight, ascending
    pub async fn active_task_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.runs.lock().await.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Number of runs in flight
    pub async fn active_count(&self) -> usize {
        self.runs.lock().await.len()
    }
}
