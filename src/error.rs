use serde::ser::{Serialize, SerializeStruct, Serializer};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Every failure the agent core can surface.
///
/// Protocol and transport variants are fatal to the connection that raised
/// them. Command-level variants end up inside a `CommandResult` or are handed
/// back to the caller. Controller variants are retried by the heartbeat loop.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    #[error("{0}")]
    ProtocolViolation(String),

    #[error("connection idle for {0:?}, aborting")]
    TransportTimeout(Duration),

    #[error("connection closed before a response arrived")]
    ConnectionClosed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Invalid command parameters: {0}")]
    InvalidParams(String),

    #[error("Command execution failed: {0}")]
    CommandExecution(String),

    #[error("{kind} with id {id} not found.")]
    NotFound { kind: &'static str, id: String },

    #[error("Error heartbeating to agent API: {0}")]
    Heartbeat(String),

    #[error("Error in call to controller API: {0}")]
    ControllerApi(String),

    #[error("remote error: {0}")]
    Remote(Value),
}

pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    pub fn protocol(message: impl Into<String>) -> Self {
        AgentError::ProtocolViolation(message.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        AgentError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Stable type tag used in the serialized form.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::ProtocolViolation(_) => "ProtocolViolation",
            AgentError::TransportTimeout(_) => "TransportTimeout",
            AgentError::ConnectionClosed => "ConnectionClosed",
            AgentError::Transport(_) => "TransportError",
            AgentError::InvalidCommand(_) => "InvalidCommandError",
            AgentError::InvalidParams(_) => "InvalidCommandParamsError",
            AgentError::CommandExecution(_) => "CommandExecutionError",
            AgentError::NotFound { .. } => "RequestedObjectNotFoundError",
            AgentError::Heartbeat(_) => "HeartbeatError",
            AgentError::ControllerApi(_) => "ControllerAPIError",
            AgentError::Remote(_) => "RemoteError",
        }
    }

    /// HTTP-flavoured status code, kept for consumers that expose results over REST.
    pub fn code(&self) -> u16 {
        match self {
            AgentError::InvalidCommand(_) | AgentError::InvalidParams(_) => 400,
            AgentError::NotFound { .. } => 404,
            _ => 500,
        }
    }

    pub fn summary(&self) -> &'static str {
        match self {
            AgentError::ProtocolViolation(_) => "Protocol violation",
            AgentError::TransportTimeout(_) => "Connection timed out",
            AgentError::ConnectionClosed => "Connection closed",
            AgentError::Transport(_) => "Transport error",
            AgentError::InvalidCommand(_) => "Invalid command",
            AgentError::InvalidParams(_) => "Invalid command parameters",
            AgentError::CommandExecution(_) => "Command execution failed",
            AgentError::NotFound { .. } => "Requested object not found",
            AgentError::Heartbeat(_) => "Error heartbeating to agent API",
            AgentError::ControllerApi(_) => "Error in call to controller API",
            AgentError::Remote(_) => "Remote error",
        }
    }

    pub fn details(&self) -> String {
        match self {
            AgentError::ProtocolViolation(d)
            | AgentError::Transport(d)
            | AgentError::InvalidCommand(d)
            | AgentError::InvalidParams(d)
            | AgentError::CommandExecution(d)
            | AgentError::Heartbeat(d)
            | AgentError::ControllerApi(d) => d.clone(),
            AgentError::NotFound { .. } | AgentError::TransportTimeout(_) => self.to_string(),
            AgentError::ConnectionClosed => String::new(),
            AgentError::Remote(v) => v.to_string(),
        }
    }

    /// Connection-fatal errors never produce a per-message response.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::ProtocolViolation(_) | AgentError::TransportTimeout(_)
        )
    }
}

impl Serialize for AgentError {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("AgentError", 4)?;
        s.serialize_field("type", self.kind())?;
        s.serialize_field("code", &self.code())?;
        s.serialize_field("message", self.summary())?;
        s.serialize_field("details", &self.details())?;
        s.end()
    }
}
