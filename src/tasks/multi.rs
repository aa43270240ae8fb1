use std::ops::Deref;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, info, trace};

use super::{Task, TaskOwner, TaskReport, TaskState, TaskWork};

/// What the aggregate does when a child ends in `error`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChildFailurePolicy {
    /// The aggregate completes once every child finished, whatever their outcome.
    #[default]
    Ignore,
    /// The aggregate errors if any child errored.
    Propagate,
}

#[derive(Debug, Default)]
struct Tally {
    finished: usize,
    first_failure: Option<TaskReport>,
}

pub(super) struct Aggregate {
    policy: ChildFailurePolicy,
    tally: Mutex<Tally>,
}

/// Runs its children concurrently and finishes when all of them have.
///
/// Children report to the aggregate, not to the aggregate's owner.
#[derive(Debug, Clone)]
pub struct MultiTask {
    task: Arc<Task>,
}

impl MultiTask {
    pub fn new<O>(
        owner: &Arc<O>,
        id: &str,
        name: &str,
        reporting_interval: Duration,
        policy: ChildFailurePolicy,
    ) -> Self
    where
        O: TaskOwner + 'static,
    {
        let owner: Weak<O> = Arc::downgrade(owner);
        let aggregate = Aggregate {
            policy,
            tally: Mutex::new(Tally::default()),
        };
        Self {
            task: Arc::new(Task::build(
                owner,
                false,
                id,
                name,
                reporting_interval,
                None,
                Some(aggregate),
            )),
        }
    }

    /// Add a child. Children added after the aggregate started run immediately.
    pub fn add_task<W>(&self, id: &str, name: &str, work: W) -> Arc<Task>
    where
        W: TaskWork + 'static,
    {
        let parent: Weak<Task> = Arc::downgrade(&self.task);
        let child = Arc::new(Task::build(
            parent,
            true,
            id,
            name,
            self.task.reporting_interval(),
            Some(Arc::new(work)),
            None,
        ));
        self.task
            .children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::clone(&child));

        if self.task.state() == TaskState::Running {
            child.run();
        }
        child
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    pub fn run(&self) {
        self.task.run();
    }
}

impl Deref for MultiTask {
    type Target = Task;

    fn deref(&self) -> &Task {
        &self.task
    }
}

impl Task {
    pub(super) fn run_children(&self) {
        let children = self.children_snapshot();
        if children.is_empty() {
            debug!(task_id = %self.id(), "no child tasks, completing");
            self.complete();
            return;
        }
        for child in children {
            child.run();
        }
    }

    pub(super) fn refresh_aggregate_percent(&self) {
        let children = self.children_snapshot();
        let percent = if children.is_empty() {
            0.0
        } else {
            children.iter().map(|c| c.percent()).sum::<f64>() / children.len() as f64
        };
        self.set_percent(percent);
    }
}

impl TaskOwner for Task {
    fn register_task(&self, task: &Arc<Task>) {
        trace!(parent = %self.id(), child = %task.id(), "child registered");
    }

    fn update_task_status(&self, report: TaskReport) {
        trace!(parent = %self.id(), child = %report.id, percent = report.percent, "child status");
    }

    fn finish_task(&self, report: TaskReport) {
        let Some(aggregate) = &self.aggregate else {
            return;
        };

        let total = self.children_snapshot().len();
        let (done, failure) = {
            let mut tally = aggregate
                .tally
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            tally.finished += 1;
            if report.state == TaskState::Error && tally.first_failure.is_none() {
                tally.first_failure = Some(report.clone());
            }
            (tally.finished >= total, tally.first_failure.clone())
        };

        debug!(
            parent = %self.id(),
            child = %report.id,
            child_state = ?report.state,
            total,
            "child task finished"
        );

        if !done {
            return;
        }

        match (aggregate.policy, failure) {
            (ChildFailurePolicy::Propagate, Some(failed)) => {
                info!(task_id = %self.id(), failed_child = %failed.id, "child task failed, failing aggregate");
                self.error(format!(
                    "child task {} failed: {}",
                    failed.id,
                    failed.error_message.unwrap_or_default()
                ));
            }
            _ => self.complete(),
        }
    }
}
