use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::commands::result::{classify_failure, CommandParams, CommandResult};
use crate::error::{AgentError, Result};

/// What a handler hands back: a plain value for synchronous commands, or a
/// `CommandResult` that manages its own (async) lifecycle.
#[derive(Debug)]
pub enum HandlerOutput {
    Value(Value),
    Command(CommandResult),
}

impl From<Value> for HandlerOutput {
    fn from(value: Value) -> Self {
        HandlerOutput::Value(value)
    }
}

impl From<CommandResult> for HandlerOutput {
    fn from(result: CommandResult) -> Self {
        HandlerOutput::Command(result)
    }
}

pub type CommandHandler =
    Arc<dyn Fn(&str, &CommandParams) -> anyhow::Result<HandlerOutput> + Send + Sync>;

#[derive(Default)]
struct ResultStore {
    order: Vec<String>,
    by_id: HashMap<String, CommandResult>,
}

impl ResultStore {
    fn insert(&mut self, result: CommandResult) {
        let id = result.id().to_string();
        if self.by_id.insert(id.clone(), result).is_none() {
            self.order.push(id);
        }
    }

    fn last(&self) -> Option<&CommandResult> {
        self.order.last().and_then(|id| self.by_id.get(id))
    }
}

/// Maps command names to handlers and keeps every result it produced.
///
/// `running` serializes the busy check and handler calls; `results` is only
/// held for inserts and lookups so status queries never wait on a handler.
pub struct CommandExecutor {
    handlers: HashMap<String, CommandHandler>,
    running: Mutex<()>,
    results: Mutex<ResultStore>,
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            running: Mutex::new(()),
            results: Mutex::new(ResultStore::default()),
        }
    }

    /// Register a handler under `name`, replacing any previous one.
    pub fn with_handler<F>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(&str, &CommandParams) -> anyhow::Result<HandlerOutput> + Send + Sync + 'static,
    {
        self.register(name, Arc::new(handler));
        self
    }

    pub fn register(&mut self, name: &str, handler: CommandHandler) {
        if self.handlers.insert(name.to_string(), handler).is_some() {
            warn!(command = %name, "replacing existing command handler");
        }
    }

    pub fn supports(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn command_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    fn store(&self) -> MutexGuard<'_, ResultStore> {
        self.results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Execute `name` with `params`.
    ///
    /// Client-input errors (`InvalidCommand`, `InvalidParams`) and the busy
    /// guard come back as `Err`; every other outcome, including handler
    /// failures, is recorded and returned as a `CommandResult`.
    pub fn execute(&self, name: &str, params: CommandParams) -> Result<CommandResult> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| AgentError::InvalidCommand(name.to_string()))?;

        let _running = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(last) = self.store().last().filter(|last| !last.is_done()) {
            warn!(command = %name, running = %last.name(), "rejecting command, agent is busy");
            return Err(AgentError::CommandExecution("agent is busy".to_string()));
        }

        info!(command = %name, "executing command");
        let result = match handler(name, &params) {
            Ok(HandlerOutput::Command(result)) => result,
            Ok(HandlerOutput::Value(value)) => CommandResult::succeeded(name, params, value),
            Err(e) => match classify_failure(e) {
                err @ (AgentError::InvalidParams(_) | AgentError::InvalidCommand(_)) => {
                    debug!(command = %name, error = %err, "command rejected");
                    return Err(err);
                }
                err => {
                    warn!(command = %name, error = %err, "command failed");
                    CommandResult::failed(name, params, err)
                }
            },
        };

        self.store().insert(result.clone());
        Ok(result)
    }

    pub fn get(&self, id: &str) -> Result<CommandResult> {
        self.store()
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| AgentError::not_found("Command Result", id))
    }

    /// All results, oldest first.
    pub fn list(&self) -> Vec<CommandResult> {
        let store = self.store();
        store
            .order
            .iter()
            .filter_map(|id| store.by_id.get(id).cloned())
            .collect()
    }
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new()
    }
}
