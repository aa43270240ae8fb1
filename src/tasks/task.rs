use std::fmt;
use std::ops::ControlFlow;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::multi::Aggregate;
use super::{TaskOwner, TaskReport, TaskState, TaskWork, SHUTDOWN_MESSAGE};

const MIN_REPORTING_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug)]
struct Progress {
    state: TaskState,
    percent: f64,
    error_message: Option<String>,
    finished: bool,
}

pub struct Task {
    id: String,
    name: String,
    reporting_interval: Duration,
    owner: Weak<dyn TaskOwner>,
    has_parent: bool,
    work: Option<Arc<dyn TaskWork>>,
    pub(super) children: Mutex<Vec<Arc<Task>>>,
    pub(super) aggregate: Option<Aggregate>,
    progress: Mutex<Progress>,
    finished: Condvar,
    timer: CancellationToken,
}

impl Task {
    /// A standalone task reporting to `owner`.
    pub fn new<O, W>(
        owner: &Arc<O>,
        id: &str,
        name: &str,
        reporting_interval: Duration,
        work: W,
    ) -> Arc<Self>
    where
        O: TaskOwner + 'static,
        W: TaskWork + 'static,
    {
        let owner: Weak<O> = Arc::downgrade(owner);
        Arc::new(Self::build(
            owner,
            false,
            id,
            name,
            reporting_interval,
            Some(Arc::new(work)),
            None,
        ))
    }

    pub(super) fn build(
        owner: Weak<dyn TaskOwner>,
        has_parent: bool,
        id: &str,
        name: &str,
        reporting_interval: Duration,
        work: Option<Arc<dyn TaskWork>>,
        aggregate: Option<Aggregate>,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            reporting_interval: reporting_interval.max(MIN_REPORTING_INTERVAL),
            owner,
            has_parent,
            work,
            children: Mutex::new(Vec::new()),
            aggregate,
            progress: Mutex::new(Progress {
                state: TaskState::Starting,
                percent: 0.0,
                error_message: None,
                finished: false,
            }),
            finished: Condvar::new(),
            timer: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reporting_interval(&self) -> Duration {
        self.reporting_interval
    }

    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> TaskState {
        self.progress().state
    }

    pub fn percent(&self) -> f64 {
        self.progress().percent
    }

    pub fn set_percent(&self, percent: f64) {
        self.progress().percent = percent.clamp(0.0, 100.0);
    }

    pub fn report(&self) -> TaskReport {
        let progress = self.progress();
        self.report_of(&progress)
    }

    fn report_of(&self, progress: &Progress) -> TaskReport {
        TaskReport {
            id: self.id.clone(),
            name: self.name.clone(),
            state: progress.state,
            percent: progress.percent,
            error_message: progress.error_message.clone(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.progress().finished
    }

    /// Start the task. Registers with the owner when parentless, arms the
    /// reporting timer and kicks off the work. Never blocks.
    pub fn run(self: &Arc<Self>) {
        {
            let mut progress = self.progress();
            if progress.state != TaskState::Starting {
                warn!(task_id = %self.id, state = ?progress.state, "task already started");
                return;
            }
            progress.state = TaskState::Running;
        }

        if !self.has_parent {
            match self.owner.upgrade() {
                Some(owner) => owner.register_task(self),
                None => warn!(task_id = %self.id, "task owner dropped before run"),
            }
        }

        debug!(task_id = %self.id, task_name = %self.name, "task running");
        self.arm_timer();

        if self.aggregate.is_some() {
            self.run_children();
        } else if let Some(work) = &self.work {
            work.start(Arc::clone(self));
        }
    }

    fn arm_timer(self: &Arc<Self>) {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(task_id = %self.id, "no async runtime, periodic status reports disabled");
                return;
            }
        };

        let task = Arc::downgrade(self);
        let stopped = self.timer.clone();
        let period = self.reporting_interval;
        handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = stopped.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(task) = task.upgrade() else { break };
                        if task.tick().is_break() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// One timer firing: refresh aggregate progress, report, and latch the
    /// timer off once the state is terminal.
    pub(super) fn tick(&self) -> ControlFlow<()> {
        if self.timer.is_cancelled() {
            return ControlFlow::Break(());
        }

        if self.aggregate.is_some() {
            self.refresh_aggregate_percent();
        }

        let report = self.report();
        let terminal = report.state.is_terminal();
        if let Some(owner) = self.owner.upgrade() {
            owner.update_task_status(report);
        }

        if terminal {
            self.stop();
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    pub fn complete(&self) {
        self.finish(TaskState::Complete, None);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.finish(TaskState::Error, Some(message.into()));
    }

    fn finish(&self, state: TaskState, message: Option<String>) {
        {
            let mut progress = self.progress();
            if progress.state.is_terminal() {
                debug!(task_id = %self.id, state = ?progress.state, "task already terminal");
            } else {
                progress.state = state;
                progress.error_message = message;
            }
        }
        self.stop();
    }

    /// Tear the task down. A task that has not reached a terminal state is
    /// marked as failed. Idempotent: the owner hears about it once.
    pub fn stop(&self) {
        self.timer.cancel();

        let report = {
            let mut progress = self.progress();
            if progress.finished {
                return;
            }
            if !progress.state.is_terminal() {
                warn!(task_id = %self.id, "told to shutdown before task could complete, marking as error");
                progress.state = TaskState::Error;
                progress.error_message = Some(SHUTDOWN_MESSAGE.to_string());
            }
            progress.finished = true;
            self.report_of(&progress)
        };
        self.finished.notify_all();

        debug!(task_id = %self.id, state = ?report.state, "task finished");
        match self.owner.upgrade() {
            Some(owner) => owner.finish_task(report),
            None => debug!(task_id = %self.id, "task owner gone, completion not delivered"),
        }

        for child in self.children_snapshot() {
            child.stop();
        }
    }

    pub(super) fn children_snapshot(&self) -> Vec<Arc<Task>> {
        self.children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Block the calling thread until the task has finished.
    pub fn wait(&self) -> TaskReport {
        let mut progress = self.progress();
        while !progress.finished {
            progress = self
                .finished
                .wait(progress)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        self.report_of(&progress)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
