use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::AgentError;

pub type CommandParams = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Running,
    Succeeded,
    Failed,
}

/// Consistent view of a command result, taken under its lock.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandSnapshot {
    pub id: String,
    pub command_name: String,
    pub command_params: CommandParams,
    pub command_status: CommandStatus,
    pub command_error: Option<AgentError>,
    pub command_result: Option<Value>,
}

#[derive(Debug)]
struct Outcome {
    status: CommandStatus,
    result: Option<Value>,
    error: Option<AgentError>,
}

#[derive(Debug)]
struct Inner {
    id: String,
    name: String,
    params: CommandParams,
    outcome: Mutex<Outcome>,
    settled: Condvar,
}

/// Outcome of one command, shared between the executor store, status readers
/// and (for async commands) the worker thread that produces it.
#[derive(Debug, Clone)]
pub struct CommandResult {
    inner: Arc<Inner>,
}

impl CommandResult {
    fn with_outcome(name: &str, params: CommandParams, outcome: Outcome) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4().to_string(),
                name: name.to_string(),
                params,
                outcome: Mutex::new(outcome),
                settled: Condvar::new(),
            }),
        }
    }

    /// A result that has not settled yet. Pair with [`CommandResult::start`].
    pub fn pending(name: &str, params: CommandParams) -> Self {
        Self::with_outcome(
            name,
            params,
            Outcome {
                status: CommandStatus::Running,
                result: None,
                error: None,
            },
        )
    }

    pub fn succeeded(name: &str, params: CommandParams, result: Value) -> Self {
        Self::with_outcome(
            name,
            params,
            Outcome {
                status: CommandStatus::Succeeded,
                result: Some(result),
                error: None,
            },
        )
    }

    pub fn failed(name: &str, params: CommandParams, error: AgentError) -> Self {
        Self::with_outcome(
            name,
            params,
            Outcome {
                status: CommandStatus::Failed,
                result: None,
                error: Some(error),
            },
        )
    }

    /// Run `job` on a dedicated worker thread and settle this result with its outcome.
    ///
    /// Returns immediately. If the worker cannot be spawned the result fails
    /// straight away instead.
    pub fn start<F>(self, job: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<Value> + Send + 'static,
    {
        let worker = self.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("agent-command-{}", self.id()))
            .spawn(move || {
                debug!(command_id = %worker.id(), command = %worker.name(), "async command started");
                let outcome = match catch_unwind(AssertUnwindSafe(job)) {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(classify_failure(e)),
                    Err(_) => Err(AgentError::CommandExecution(
                        "command handler panicked".to_string(),
                    )),
                };
                worker.settle(outcome);
            });

        if let Err(e) = spawned {
            error!(command_id = %self.id(), error = %e, "failed to spawn command worker");
            self.settle(Err(AgentError::CommandExecution(format!(
                "failed to spawn worker: {e}"
            ))));
        }
        self
    }

    fn lock(&self) -> MutexGuard<'_, Outcome> {
        self.inner
            .outcome
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move RUNNING into its terminal state. Later calls are ignored.
    fn settle(&self, outcome: Result<Value, AgentError>) {
        let mut guard = self.lock();
        if guard.status != CommandStatus::Running {
            warn!(command_id = %self.id(), "command result already settled");
            return;
        }
        match outcome {
            Ok(value) => {
                guard.result = Some(value);
                guard.status = CommandStatus::Succeeded;
            }
            Err(err) => {
                guard.error = Some(err);
                guard.status = CommandStatus::Failed;
            }
        }
        debug!(command_id = %self.id(), status = ?guard.status, "command settled");
        drop(guard);
        self.inner.settled.notify_all();
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn params(&self) -> &CommandParams {
        &self.inner.params
    }

    pub fn status(&self) -> CommandStatus {
        self.lock().status
    }

    pub fn is_done(&self) -> bool {
        self.lock().status != CommandStatus::Running
    }

    pub fn snapshot(&self) -> CommandSnapshot {
        let guard = self.lock();
        self.snapshot_of(&guard)
    }

    fn snapshot_of(&self, outcome: &Outcome) -> CommandSnapshot {
        CommandSnapshot {
            id: self.inner.id.clone(),
            command_name: self.inner.name.clone(),
            command_params: self.inner.params.clone(),
            command_status: outcome.status,
            command_error: outcome.error.clone(),
            command_result: outcome.result.clone(),
        }
    }

    /// Block the calling thread until the command settles.
    pub fn join(&self) -> CommandSnapshot {
        let mut guard = self.lock();
        while guard.status == CommandStatus::Running {
            guard = self
                .inner
                .settled
                .wait(guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        self.snapshot_of(&guard)
    }
}

impl Serialize for CommandResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.snapshot().serialize(serializer)
    }
}

/// Structured agent errors pass through untouched; anything else becomes a
/// `CommandExecution` error carrying the original message.
pub fn classify_failure(err: anyhow::Error) -> AgentError {
    match err.downcast::<AgentError>() {
        Ok(agent_err) => agent_err,
        Err(other) => AgentError::CommandExecution(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::mpsc;
    use std::time::Duration;

    fn params(v: Value) -> CommandParams {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn serialized_shape_keeps_field_order() {
        let result = CommandResult::succeeded("ping", params(json!({"b": 1, "a": 2})), json!("pong"));
        let encoded = serde_json::to_string(&result).unwrap();
        let expected = format!(
            r#"{{"id":"{}","command_name":"ping","command_params":{{"b":1,"a":2}},"command_status":"SUCCEEDED","command_error":null,"command_result":"pong"}}"#,
            result.id()
        );
        assert_eq!(encoded, expected);
    }

    #[test]
    fn async_success_settles_after_join() {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let result = CommandResult::pending("foo_command", params(json!({"fail": false}))).start(
            move || {
                release_rx.recv().ok();
                Ok(json!("command execution succeeded"))
            },
        );

        assert_eq!(result.status(), CommandStatus::Running);
        assert!(!result.is_done());
        let running = result.snapshot();
        assert!(running.command_result.is_none());
        assert!(running.command_error.is_none());

        release_tx.send(()).unwrap();
        let first = result.join();
        let second = result.join();

        assert_eq!(first.command_status, CommandStatus::Succeeded);
        assert_eq!(first.command_result, Some(json!("command execution succeeded")));
        assert_eq!(first, second);
        assert!(result.is_done());
    }

    #[test]
    fn async_failure_wraps_message() {
        let result = CommandResult::pending("foo_command", params(json!({"fail": true})))
            .start(|| Err(anyhow::anyhow!("command execution failed")));

        let snapshot = result.join();
        assert_eq!(snapshot.command_status, CommandStatus::Failed);
        assert_eq!(
            snapshot.command_error,
            Some(AgentError::CommandExecution("command execution failed".into()))
        );
        assert!(snapshot.command_result.is_none());
    }

    #[test]
    fn async_structured_error_passes_through() {
        let result = CommandResult::pending("foo_command", CommandParams::new())
            .start(|| Err(AgentError::InvalidParams("bad image".into()).into()));

        assert_eq!(
            result.join().command_error,
            Some(AgentError::InvalidParams("bad image".into()))
        );
    }

    #[test]
    fn panicking_handler_fails_the_command() {
        let result = CommandResult::pending("explode", CommandParams::new())
            .start(|| -> anyhow::Result<Value> { panic!("kaboom") });

        let snapshot = result.join();
        assert_eq!(snapshot.command_status, CommandStatus::Failed);
    }

    #[test]
    fn status_can_be_polled_from_another_thread() {
        let result = CommandResult::pending("slow", CommandParams::new()).start(|| {
            std::thread::sleep(Duration::from_millis(20));
            Ok(json!(42))
        });

        let observer = result.clone();
        let handle = std::thread::spawn(move || {
            let snapshot = observer.snapshot();
            // status and payload must agree
            match snapshot.command_status {
                CommandStatus::Running => assert!(snapshot.command_result.is_none()),
                CommandStatus::Succeeded => assert_eq!(snapshot.command_result, Some(json!(42))),
                CommandStatus::Failed => panic!("unexpected failure"),
            }
        });
        handle.join().unwrap();
        assert_eq!(result.join().command_result, Some(json!(42)));
    }

    #[test]
    fn settle_is_one_shot() {
        let result = CommandResult::pending("once", CommandParams::new());
        result.settle(Ok(json!(1)));
        result.settle(Err(AgentError::CommandExecution("late".into())));

        let snapshot = result.snapshot();
        assert_eq!(snapshot.command_status, CommandStatus::Succeeded);
        assert!(snapshot.command_error.is_none());
    }
}
