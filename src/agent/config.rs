use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::agent::heartbeat::HeartbeatSettings;
use crate::agent::status::OperationMode;
use crate::transport::client::Backoff;
use crate::transport::connection::{ConnectionConfig, DEFAULT_MAX_LINE_LENGTH};

fn default_api_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_max_line_length() -> usize {
    DEFAULT_MAX_LINE_LENGTH
}

fn default_reconnect_initial_delay_secs() -> f64 {
    1.0
}

fn default_reconnect_max_delay_secs() -> f64 {
    120.0
}

fn default_task_reporting_interval_secs() -> f64 {
    10.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Base URL of the controller API.
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// RPC endpoints (`host:port`) to keep a connection to.
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub mode: OperationMode,
    /// Identity token sent in the handshake. Defaults to the primary MAC.
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
    #[serde(default = "default_reconnect_initial_delay_secs")]
    pub reconnect_initial_delay_secs: f64,
    #[serde(default = "default_reconnect_max_delay_secs")]
    pub reconnect_max_delay_secs: f64,
    #[serde(default = "default_task_reporting_interval_secs")]
    pub task_reporting_interval_secs: f64,
    #[serde(default)]
    pub heartbeat: HeartbeatSettings,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            endpoints: Vec::new(),
            mode: OperationMode::default(),
            node_id: None,
            idle_timeout_secs: default_idle_timeout_secs(),
            max_line_length: default_max_line_length(),
            reconnect_initial_delay_secs: default_reconnect_initial_delay_secs(),
            reconnect_max_delay_secs: default_reconnect_max_delay_secs(),
            task_reporting_interval_secs: default_task_reporting_interval_secs(),
            heartbeat: HeartbeatSettings::default(),
        }
    }
}

fn secs(value: f64, name: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("{name} must be a non-negative number of seconds"))
}

impl AgentConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path).with_context(|| format!("reading config file {path}"))?;
        let config: AgentConfig = serde_json::from_str(&raw).context("parsing JSON")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.idle_timeout_secs == 0 {
            anyhow::bail!("idle_timeout_secs must be greater than zero");
        }
        if self.max_line_length == 0 {
            anyhow::bail!("max_line_length must be greater than zero");
        }
        secs(self.reconnect_initial_delay_secs, "reconnect_initial_delay_secs")?;
        secs(self.reconnect_max_delay_secs, "reconnect_max_delay_secs")?;
        secs(self.task_reporting_interval_secs, "task_reporting_interval_secs")?;
        let hb = &self.heartbeat;
        if !(hb.jitter_min > 0.0 && hb.jitter_min <= hb.jitter_max && hb.jitter_max <= 1.0) {
            anyhow::bail!("heartbeat jitter must satisfy 0 < jitter_min <= jitter_max <= 1");
        }
        if hb.backoff_factor < 1.0 || hb.initial_delay <= 0.0 || hb.max_delay < hb.initial_delay {
            anyhow::bail!("heartbeat backoff settings are inconsistent");
        }
        Ok(())
    }

    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            max_line_length: self.max_line_length,
        }
    }

    pub fn backoff(&self) -> Result<Backoff> {
        Ok(Backoff::new(
            secs(self.reconnect_initial_delay_secs, "reconnect_initial_delay_secs")?,
            secs(self.reconnect_max_delay_secs, "reconnect_max_delay_secs")?,
        ))
    }

    pub fn task_reporting_interval(&self) -> Result<Duration> {
        secs(self.task_reporting_interval_secs, "task_reporting_interval_secs")
    }

    /// Keepalive period: a third of the idle timeout.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs) / 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_parsing() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{
                "api_url": "https://controller.example.com",
                "endpoints": ["10.0.0.1:9999", "10.0.0.2:9999"],
                "mode": "DECOM",
                "node_id": "a4:bf:01:02:03:04",
                "idle_timeout_secs": 30,
                "heartbeat": {{"max_delay": 60.0}}
            }}"#
        )
        .unwrap();

        let config = AgentConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.api_url, "https://controller.example.com");
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.mode, OperationMode::Decom);
        assert_eq!(config.node_id.as_deref(), Some("a4:bf:01:02:03:04"));
        assert_eq!(config.ping_interval(), Duration::from_secs(10));
        assert_eq!(config.heartbeat.max_delay, 60.0);
        assert_eq!(config.heartbeat.backoff_factor, 2.7);
        assert_eq!(config.max_line_length, 512 * 1024);
    }

    #[test]
    fn empty_object_gives_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{{}}").unwrap();

        let config = AgentConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config, AgentConfig::default());
        assert_eq!(config.connection(), ConnectionConfig::default());
        let mut backoff = config.backoff().unwrap();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn rejects_bad_values() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"mode": "RESCUE"}}"#).unwrap();
        assert!(AgentConfig::from_file(file.path().to_str().unwrap()).is_err());

        let config = AgentConfig {
            idle_timeout_secs: 0,
            ..AgentConfig::default()
        };
        assert!(config.validate().is_err());

        let config = AgentConfig {
            reconnect_max_delay_secs: -1.0,
            ..AgentConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(AgentConfig::from_file("/nonexistent/agent.json").is_err());
    }
}
