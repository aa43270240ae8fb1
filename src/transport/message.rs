use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{AgentError, Result};

pub const PROTOCOL_VERSION: &str = "v1";

pub const DECODE_ERROR: &str = "protocol error: unable to decode message";
pub const MALFORMED_MESSAGE: &str = "protocol error: malformed message";
pub const MISSING_VERSION: &str = "protocol violation: missing message version";
pub const MISSING_ID: &str = "protocol violation: missing message id";
pub const MISSING_PARAMS: &str = "protocol violation: missing message params";
pub const PARAMS_NOT_OBJECT: &str = "protocol violation: message params must be an object";
pub const UNSUPPORTED_COMMAND: &str = "protocol violation: unsupported command";
pub const UNKNOWN_MESSAGE_ID: &str = "protocol violation: unknown message id referenced";

/// A request from either side: `{id, version, method, params}`.
///
/// `id` and `version` are opaque: any truthy JSON value is accepted and
/// echoed back unchanged in the reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcCommand {
    pub id: Value,
    pub version: Value,
    pub method: String,
    pub params: Map<String, Value>,
}

impl RpcCommand {
    /// A new outbound command with a fresh correlation id.
    pub fn new(method: &str, params: Map<String, Value>) -> Self {
        Self {
            id: Value::String(Uuid::new_v4().to_string()),
            version: Value::String(PROTOCOL_VERSION.to_string()),
            method: method.to_string(),
            params,
        }
    }
}

/// Key for the pending-request table. Uses the JSON text so `"7"` and `7`
/// stay distinct.
pub fn id_key(id: &Value) -> String {
    id.to_string()
}

/// A decoded inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Command(RpcCommand),
    Result {
        id: Value,
        version: Value,
        result: Value,
    },
    Error {
        id: Value,
        version: Value,
        error: Value,
    },
    Fatal(Value),
}

/// Everything this side can put on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    Command(RpcCommand),
    Result {
        id: Value,
        version: Value,
        result: Value,
    },
    Error {
        id: Value,
        version: Value,
        error: Value,
    },
    Fatal {
        fatal_error: String,
    },
}

impl Outbound {
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| AgentError::protocol(format!("protocol error: unable to encode message: {e}")))
    }
}

/// Python-style truthiness, which is what peers use to decide "missing".
fn is_falsy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => true,
        Some(Value::Number(n)) => n.as_f64() == Some(0.0),
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        Some(Value::Object(o)) => o.is_empty(),
        Some(Value::Bool(true)) => false,
    }
}

fn token(message: &mut Map<String, Value>, key: &str, missing: &str) -> Result<Value> {
    match message.remove(key) {
        Some(value) if !is_falsy(Some(&value)) => Ok(value),
        _ => Err(AgentError::protocol(missing)),
    }
}

/// Decode and validate one line. `Ok(None)` for blank lines.
///
/// Checks run in a fixed order: JSON, `fatal_error`, `version`, `id`, then
/// the command/result/error shape. Every `Err` is connection-fatal.
pub fn decode(line: &str) -> Result<Option<Inbound>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(line).map_err(|_| AgentError::protocol(DECODE_ERROR))?;
    let Value::Object(mut message) = value else {
        return Err(AgentError::protocol(MALFORMED_MESSAGE));
    };

    if let Some(fatal) = message.remove("fatal_error") {
        return Ok(Some(Inbound::Fatal(fatal)));
    }

    let version = token(&mut message, "version", MISSING_VERSION)?;
    let id = token(&mut message, "id", MISSING_ID)?;

    if let Some(method) = message.get("method") {
        let Value::String(method) = method else {
            return Err(AgentError::protocol(MALFORMED_MESSAGE));
        };
        let params = match message.get("params") {
            None | Some(Value::Null) => return Err(AgentError::protocol(MISSING_PARAMS)),
            Some(Value::Object(params)) => params.clone(),
            Some(_) => return Err(AgentError::protocol(PARAMS_NOT_OBJECT)),
        };
        return Ok(Some(Inbound::Command(RpcCommand {
            id,
            version,
            method: method.clone(),
            params,
        })));
    }

    match (message.remove("result"), message.remove("error")) {
        (Some(result), None) => Ok(Some(Inbound::Result {
            id,
            version,
            result,
        })),
        (None, Some(error)) => Ok(Some(Inbound::Error { id, version, error })),
        _ => Err(AgentError::protocol(MALFORMED_MESSAGE)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode_err(line: &str) -> String {
        match decode(line) {
            Err(AgentError::ProtocolViolation(msg)) => msg,
            other => panic!("expected protocol violation, got {other:?}"),
        }
    }

    #[test]
    fn command_round_trip_preserves_fields() {
        let params = json!({"z": [1, 2, {"nested": true}], "a": "x", "m": 1.5})
            .as_object()
            .cloned()
            .unwrap();
        let command = RpcCommand::new("standby.cache_images", params.clone());
        let line = Outbound::Command(command.clone()).encode().unwrap();

        let decoded = decode(&line).unwrap().unwrap();
        let Inbound::Command(decoded) = decoded else {
            panic!("expected a command");
        };
        assert_eq!(decoded, command);
        assert_eq!(
            serde_json::to_string(&decoded.params).unwrap(),
            serde_json::to_string(&params).unwrap()
        );
        assert!(!line.contains('\n'));
    }

    #[test]
    fn blank_lines_are_ignored() {
        assert_eq!(decode("").unwrap(), None);
        assert_eq!(decode("   \r").unwrap(), None);
    }

    #[test]
    fn validation_order() {
        assert_eq!(decode_err("{not json"), DECODE_ERROR);
        assert_eq!(decode_err(r#"{"id": "1", "result": 1}"#), MISSING_VERSION);
        assert_eq!(decode_err(r#"{"version": "", "id": "1", "result": 1}"#), MISSING_VERSION);
        assert_eq!(decode_err(r#"{"version": "v1", "result": 1}"#), MISSING_ID);
        assert_eq!(decode_err(r#"{"version": "v1", "id": "1", "method": "ping"}"#), MISSING_PARAMS);
        assert_eq!(
            decode_err(r#"{"version": "v1", "id": "1", "method": "ping", "params": null}"#),
            MISSING_PARAMS
        );
        assert_eq!(
            decode_err(r#"{"version": "v1", "id": "1", "method": "ping", "params": [1]}"#),
            PARAMS_NOT_OBJECT
        );
        assert_eq!(decode_err(r#"{"version": "v1", "id": "1"}"#), MALFORMED_MESSAGE);
        assert_eq!(
            decode_err(r#"{"version": "v1", "id": "1", "result": 1, "error": 2}"#),
            MALFORMED_MESSAGE
        );
        assert_eq!(decode_err("[1, 2]"), MALFORMED_MESSAGE);
    }

    #[test]
    fn fatal_error_wins_over_everything_else() {
        let decoded = decode(r#"{"fatal_error": "go away"}"#).unwrap();
        assert_eq!(decoded, Some(Inbound::Fatal(json!("go away"))));
    }

    #[test]
    fn empty_params_object_is_a_valid_command() {
        let decoded = decode(r#"{"version": "v1", "id": "1", "method": "ping", "params": {}}"#)
            .unwrap()
            .unwrap();
        assert!(matches!(decoded, Inbound::Command(ref c) if c.params.is_empty()));
    }

    #[test]
    fn results_and_errors() {
        assert_eq!(
            decode(r#"{"version": "v1", "id": "7", "result": {"ok": true}}"#).unwrap(),
            Some(Inbound::Result {
                id: json!("7"),
                version: json!("v1"),
                result: json!({"ok": true}),
            })
        );
        assert_eq!(
            decode(r#"{"version": "v1", "id": "7", "error": "nope"}"#).unwrap(),
            Some(Inbound::Error {
                id: json!("7"),
                version: json!("v1"),
                error: json!("nope"),
            })
        );
        // a null result is still a result
        assert!(matches!(
            decode(r#"{"version": "v1", "id": "7", "result": null}"#).unwrap(),
            Some(Inbound::Result { .. })
        ));
    }

    #[test]
    fn outbound_shapes() {
        let fatal = Outbound::Fatal {
            fatal_error: UNSUPPORTED_COMMAND.into(),
        };
        assert_eq!(
            fatal.encode().unwrap(),
            r#"{"fatal_error":"protocol violation: unsupported command"}"#
        );

        let result = Outbound::Result {
            id: json!("1"),
            version: json!("v1"),
            result: json!(3),
        };
        assert_eq!(result.encode().unwrap(), r#"{"id":"1","version":"v1","result":3}"#);
    }

    #[test]
    fn non_string_ids_are_kept_as_sent() {
        let decoded = decode(r#"{"version":"v1","id":7,"method":"ping","params":{"a":1}}"#)
            .unwrap()
            .unwrap();
        let Inbound::Command(command) = decoded else {
            panic!("expected a command");
        };
        assert_eq!(command.id, json!(7));
        assert_eq!(command.params, json!({"a": 1}).as_object().cloned().unwrap());

        assert_eq!(
            decode(r#"{"version": 2, "id": [1], "result": null}"#).unwrap(),
            Some(Inbound::Result {
                id: json!([1]),
                version: json!(2),
                result: Value::Null,
            })
        );
        assert_eq!(decode_err(r#"{"version": "v1", "id": 0, "result": 1}"#), MISSING_ID);
        assert_ne!(id_key(&json!(7)), id_key(&json!("7")));
    }
}
