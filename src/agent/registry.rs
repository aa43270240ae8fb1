use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::tasks::{Task, TaskOwner, TaskReport};

#[derive(Default)]
struct Entries {
    live: HashMap<String, (Arc<Task>, TaskReport)>,
    finished: Vec<TaskReport>,
}

/// Agent-level owner of every top-level task.
///
/// Keeps the latest report of each running task and the final report of
/// each finished one.
#[derive(Default)]
pub struct TaskRegistry {
    entries: Mutex<Entries>,
}

impl TaskRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Latest report of every running task, ordered by id.
    pub fn live(&self) -> Vec<TaskReport> {
        let mut reports: Vec<TaskReport> = self.entries().live.values().map(|(_, r)| r.clone()).collect();
        reports.sort_by(|a, b| a.id.cmp(&b.id));
        reports
    }

    /// Final reports, in the order tasks finished.
    pub fn finished(&self) -> Vec<TaskReport> {
        self.entries().finished.clone()
    }

    /// Stop every running task. Used on agent shutdown.
    pub fn stop_all(&self) {
        let tasks: Vec<Arc<Task>> = self
            .entries()
            .live
            .values()
            .map(|(task, _)| Arc::clone(task))
            .collect();
        if !tasks.is_empty() {
            info!(count = tasks.len(), "stopping running tasks");
        }
        for task in tasks {
            task.stop();
        }
    }
}

impl TaskOwner for TaskRegistry {
    fn register_task(&self, task: &Arc<Task>) {
        debug!(task_id = %task.id(), task_name = %task.name(), "task registered");
        self.entries()
            .live
            .insert(task.id().to_string(), (Arc::clone(task), task.report()));
    }

    fn update_task_status(&self, report: TaskReport) {
        if let Some((_, latest)) = self.entries().live.get_mut(&report.id) {
            *latest = report;
        }
    }

    fn finish_task(&self, report: TaskReport) {
        info!(
            task_id = %report.id,
            state = ?report.state,
            percent = report.percent,
            "task finished"
        );
        let mut entries = self.entries();
        entries.live.remove(&report.id);
        entries.finished.push(report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{TaskState, SHUTDOWN_MESSAGE};
    use std::time::Duration;

    fn idle() -> impl Fn(Arc<Task>) + Send + Sync + 'static {
        |_task: Arc<Task>| {}
    }

    #[tokio::test(start_paused = true)]
    async fn tracks_live_and_finished_tasks() {
        let registry = TaskRegistry::new();
        let a = Task::new(&registry, "task-a", "cache", Duration::from_secs(10), idle());
        let b = Task::new(&registry, "task-b", "cache", Duration::from_secs(10), idle());
        a.run();
        b.run();

        a.set_percent(40.0);
        tokio::time::sleep(Duration::from_secs(10)).await;
        let live = registry.live();
        assert_eq!(live.len(), 2);
        assert_eq!(live[0].id, "task-a");
        assert_eq!(live[0].percent, 40.0);

        a.complete();
        assert_eq!(registry.live().len(), 1);
        assert_eq!(registry.finished()[0].state, TaskState::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_fails_running_tasks() {
        let registry = TaskRegistry::new();
        let a = Task::new(&registry, "task-a", "cache", Duration::from_secs(10), idle());
        a.run();

        registry.stop_all();

        assert!(registry.live().is_empty());
        let finished = registry.finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].error_message.as_deref(), Some(SHUTDOWN_MESSAGE));
    }
}
