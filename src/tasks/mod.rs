//! Long-running units of work that report their progress periodically.
//!
//! A [`Task`] reports `(state, percent)` to its [`TaskOwner`] every
//! `reporting_interval` while it runs and tells the owner exactly once when it
//! finishes. A [`MultiTask`] runs several child tasks at once and reports the
//! mean of their progress.

mod multi;
mod task;

use serde::Serialize;
use std::sync::Arc;

pub use multi::{ChildFailurePolicy, MultiTask};
pub use task::Task;

/// Error message recorded when a task is stopped before it finished on its own.
pub const SHUTDOWN_MESSAGE: &str = "service being shutdown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Starting,
    Running,
    Error,
    Complete,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Error | TaskState::Complete)
    }
}

/// Point-in-time status of a task as seen by its owner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskReport {
    pub id: String,
    pub name: String,
    pub state: TaskState,
    pub percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Receives status from the tasks it owns.
pub trait TaskOwner: Send + Sync {
    /// A parentless task started running under this owner.
    fn register_task(&self, task: &Arc<Task>);

    fn update_task_status(&self, report: TaskReport);

    /// Called exactly once per task, after it reached a terminal state.
    fn finish_task(&self, report: TaskReport);
}

/// The task-specific part of a [`Task`].
///
/// `start` must not block: kick the work off (thread, tokio task, ...) and
/// drive the task through `set_percent`, `complete` and `error`.
pub trait TaskWork: Send + Sync {
    fn start(&self, task: Arc<Task>);
}

impl<F> TaskWork for F
where
    F: Fn(Arc<Task>) + Send + Sync,
{
    fn start(&self, task: Arc<Task>) {
        self(task)
    }
}
