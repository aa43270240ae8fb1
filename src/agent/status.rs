use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

/// What the node is being kept around for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationMode {
    #[default]
    Standby,
    Decom,
}

impl OperationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationMode::Standby => "STANDBY",
            OperationMode::Decom => "DECOM",
        }
    }
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "STANDBY" => Ok(OperationMode::Standby),
            "DECOM" => Ok(OperationMode::Decom),
            other => Err(format!("invalid operation mode {other:?}, expected STANDBY or DECOM")),
        }
    }
}

/// Process-level facts reported by the `status` command.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentStatus {
    pub mode: OperationMode,
    pub started_at: DateTime<Utc>,
    pub version: String,
}

impl AgentStatus {
    pub fn new(mode: OperationMode) -> Self {
        Self {
            mode,
            started_at: Utc::now(),
            version: crate::VERSION.to_string(),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "mode": self.mode,
            "started_at": self.started_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            "version": self.version,
        })
    }
}
