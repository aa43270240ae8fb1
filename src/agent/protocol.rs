use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::agent::status::AgentStatus;
use crate::commands::executor::CommandExecutor;
use crate::error::AgentError;
use crate::transport::connection::{ConnectionHandle, ConnectionHandler, Responder};
use crate::transport::message::RpcCommand;

pub const STATUS: &str = "status";
pub const LIST_RESULTS: &str = "command_results.list";
pub const GET_RESULT: &str = "command_results.get";

const BUILTIN: [&str; 3] = [STATUS, LIST_RESULTS, GET_RESULT];
const MIN_PING_INTERVAL: Duration = Duration::from_millis(100);

/// Agent-side behaviour of an RPC connection: handshake, keepalive and
/// command dispatch into the executor.
pub struct AgentProtocol {
    node_id: String,
    status: AgentStatus,
    executor: Arc<CommandExecutor>,
    ping_interval: Duration,
}

impl AgentProtocol {
    pub fn new(
        node_id: impl Into<String>,
        status: AgentStatus,
        executor: Arc<CommandExecutor>,
        ping_interval: Duration,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            status,
            executor,
            ping_interval: ping_interval.max(MIN_PING_INTERVAL),
        }
    }

    fn builtin(&self, command: &RpcCommand) -> std::result::Result<Value, AgentError> {
        match command.method.as_str() {
            STATUS => Ok(self.status.to_json()),
            LIST_RESULTS => {
                let commands: Vec<_> = self.executor.list().iter().map(|r| r.snapshot()).collect();
                Ok(json!({ "commands": commands }))
            }
            other => Err(AgentError::InvalidCommand(other.to_string())),
        }
    }
}

fn error_value(err: &AgentError) -> Value {
    serde_json::to_value(err).unwrap_or_else(|_| Value::String(err.to_string()))
}

/// Send the handshake, then ping every `interval` until the connection ends.
async fn handshake_and_ping(connection: ConnectionHandle, node_id: String, interval: Duration) {
    let mut params = Map::new();
    params.insert("id".into(), Value::String(node_id));
    params.insert("version".into(), Value::String(crate::VERSION.to_string()));

    let pending = match connection.send_command("handshake", params).await {
        Ok(pending) => pending,
        Err(e) => {
            debug!(peer = %connection.peer(), error = %e, "could not send handshake");
            return;
        }
    };
    let response = tokio::select! {
        _ = connection.closed() => return,
        response = pending => response,
    };
    match response {
        Ok(result) => {
            let connection_id = result.get("id").cloned().unwrap_or(Value::Null);
            info!(peer = %connection.peer(), connection_id = %connection_id, "handshake successful");
        }
        Err(e) => {
            warn!(peer = %connection.peer(), error = %e, "handshake failed");
            return;
        }
    }

    info!(peer = %connection.peer(), ping_interval_secs = interval.as_secs_f64(), "beginning pinging endpoint");
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = connection.closed() => break,
            _ = ticker.tick() => {}
        }
        debug!(peer = %connection.peer(), "pinging agent endpoint");
        let sent_at = Instant::now();
        let pending = match connection.send_command("ping", Map::new()).await {
            Ok(pending) => pending,
            Err(_) => break,
        };
        let connection = connection.clone();
        tokio::spawn(async move {
            if pending.await.is_ok() {
                let seconds = sent_at.elapsed().as_secs_f64();
                info!(peer = %connection.peer(), response_time = seconds, "received ping response");
            }
        });
    }
}

impl ConnectionHandler for AgentProtocol {
    fn on_connect(&self, connection: ConnectionHandle) {
        tokio::spawn(handshake_and_ping(
            connection,
            self.node_id.clone(),
            self.ping_interval,
        ));
    }

    fn supports(&self, command: &RpcCommand) -> bool {
        BUILTIN.contains(&command.method.as_str()) || self.executor.supports(&command.method)
    }

    fn on_command(&self, command: RpcCommand, responder: Responder) {
        if command.method == GET_RESULT {
            let executor = Arc::clone(&self.executor);
            tokio::spawn(get_result(executor, command.params, responder));
            return;
        }

        if BUILTIN.contains(&command.method.as_str()) {
            let outcome = self.builtin(&command);
            tokio::spawn(async move {
                match outcome {
                    Ok(value) => responder.send_result(value).await,
                    Err(e) => responder.send_error(error_value(&e)).await,
                }
            });
            return;
        }

        let executor = Arc::clone(&self.executor);
        tokio::spawn(async move {
            let RpcCommand { method, params, .. } = command;
            let outcome = tokio::task::spawn_blocking(move || {
                executor.execute(&method, params).map(|result| result.snapshot())
            })
            .await
            .unwrap_or_else(|e| Err(AgentError::CommandExecution(e.to_string())));

            match outcome {
                Ok(snapshot) => match serde_json::to_value(&snapshot) {
                    Ok(value) => responder.send_result(value).await,
                    Err(e) => {
                        let err = AgentError::CommandExecution(format!("unable to encode result: {e}"));
                        responder.send_error(error_value(&err)).await
                    }
                },
                Err(e) => responder.send_error(error_value(&e)).await,
            }
        });
    }
}

/// `command_results.get {id, wait?}`; with `wait: true` the reply is held
/// until the command finished.
async fn get_result(executor: Arc<CommandExecutor>, params: Map<String, Value>, responder: Responder) {
    let Some(id) = params.get("id").and_then(Value::as_str).map(str::to_string) else {
        let err = AgentError::InvalidParams(format!("missing parameter \"id\" in \"{GET_RESULT}\" command"));
        return responder.send_error(error_value(&err)).await;
    };
    let wait = params.get("wait").and_then(Value::as_bool).unwrap_or(false);

    let result = match executor.get(&id) {
        Ok(result) => result,
        Err(e) => return responder.send_error(error_value(&e)).await,
    };
    let snapshot = if wait {
        match tokio::task::spawn_blocking(move || result.join()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let err = AgentError::CommandExecution(e.to_string());
                return responder.send_error(error_value(&err)).await;
            }
        }
    } else {
        result.snapshot()
    };

    match serde_json::to_value(&snapshot) {
        Ok(value) => responder.send_result(value).await,
        Err(e) => {
            let err = AgentError::CommandExecution(format!("unable to encode result: {e}"));
            responder.send_error(error_value(&err)).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::status::OperationMode;
    use crate::transport::connection::tests::connect;
    use crate::transport::connection::ConnectionConfig;
    use serde_json::json;

    fn protocol() -> Arc<AgentProtocol> {
        let executor = CommandExecutor::new()
            .with_handler("echo", |_, params| Ok(Value::Object(params.clone()).into()))
            .with_handler("reject", |_, _| {
                Err(AgentError::InvalidParams("no".into()).into())
            });
        Arc::new(AgentProtocol::new(
            "a4:bf:01:02:03:04",
            AgentStatus::new(OperationMode::Standby),
            Arc::new(executor),
            Duration::from_secs(20),
        ))
    }

    #[tokio::test]
    async fn sends_handshake_on_connect() {
        let (_task, _handle, mut peer) = connect(protocol(), ConnectionConfig::default());

        let handshake = peer.recv().await.unwrap();
        assert_eq!(handshake["method"], json!("handshake"));
        assert_eq!(handshake["version"], json!("v1"));
        assert_eq!(
            handshake["params"],
            json!({"id": "a4:bf:01:02:03:04", "version": crate::VERSION})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pings_after_handshake() {
        let (_task, _handle, mut peer) = connect(protocol(), ConnectionConfig::default());

        let handshake = peer.recv().await.unwrap();
        peer.send(json!({"id": handshake["id"], "version": "v1", "result": {"id": "conn-1"}}))
            .await;

        let ping = peer.recv().await.unwrap();
        assert_eq!(ping["method"], json!("ping"));
        assert_eq!(ping["params"], json!({}));
        peer.send(json!({"id": ping["id"], "version": "v1", "result": {}})).await;

        let ping = peer.recv().await.unwrap();
        assert_eq!(ping["method"], json!("ping"));
    }

    #[tokio::test]
    async fn dispatches_commands_to_the_executor() {
        let (_task, _handle, mut peer) = connect(protocol(), ConnectionConfig::default());
        let _handshake = peer.recv().await.unwrap();

        peer.send(json!({"id": "c1", "version": "v1", "method": "echo", "params": {"b": 2, "a": 1}}))
            .await;
        let reply = peer.recv().await.unwrap();
        assert_eq!(reply["id"], json!("c1"));
        assert_eq!(reply["result"]["command_name"], json!("echo"));
        assert_eq!(reply["result"]["command_status"], json!("SUCCEEDED"));
        assert_eq!(reply["result"]["command_result"], json!({"b": 2, "a": 1}));
        let command_id = reply["result"]["id"].clone();

        peer.send(json!({"id": "c2", "version": "v1", "method": "reject", "params": {}}))
            .await;
        let reply = peer.recv().await.unwrap();
        assert_eq!(reply["error"]["type"], json!("InvalidCommandParamsError"));
        assert_eq!(reply["error"]["code"], json!(400));

        peer.send(json!({"id": "c3", "version": "v1", "method": "command_results.get", "params": {"id": command_id, "wait": true}}))
            .await;
        let reply = peer.recv().await.unwrap();
        assert_eq!(reply["result"]["id"], command_id);

        peer.send(json!({"id": "c4", "version": "v1", "method": "command_results.list", "params": {}}))
            .await;
        let reply = peer.recv().await.unwrap();
        assert_eq!(reply["result"]["commands"].as_array().unwrap().len(), 1);

        peer.send(json!({"id": "c5", "version": "v1", "method": "command_results.get", "params": {"id": "nope"}}))
            .await;
        let reply = peer.recv().await.unwrap();
        assert_eq!(reply["error"]["type"], json!("RequestedObjectNotFoundError"));
    }

    #[tokio::test]
    async fn answers_status() {
        let (_task, _handle, mut peer) = connect(protocol(), ConnectionConfig::default());
        let _handshake = peer.recv().await.unwrap();

        peer.send(json!({"id": "s1", "version": "v1", "method": "status", "params": {}}))
            .await;
        let reply = peer.recv().await.unwrap();
        assert_eq!(reply["result"]["mode"], json!("STANDBY"));
        assert_eq!(reply["result"]["version"], json!(crate::VERSION));
    }
}
