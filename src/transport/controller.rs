use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, trace};

use crate::agent::status::OperationMode;
use crate::error::{AgentError, Result};

pub const HEARTBEAT_BEFORE_HEADER: &str = "Heartbeat-Before";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The liveness half of the controller API.
#[async_trait]
pub trait HeartbeatApi: Send + Sync {
    /// Announce liveness. Returns the epoch-seconds deadline before which the
    /// next heartbeat must arrive.
    async fn heartbeat(&self, hardware: &Value, mode: OperationMode, version: &str) -> Result<f64>;
}

#[derive(Serialize)]
struct HeartbeatBody<'a> {
    hardware: &'a Value,
    mode: OperationMode,
    version: &'a str,
}

/// HTTP client for the controller API.
#[derive(Debug, Clone)]
pub struct ControllerClient {
    client: Client,
    api_url: String,
}

impl ControllerClient {
    pub fn new(api_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AgentError::ControllerApi(format!("building http client: {e}")))?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Fetch the per-node configuration document, keyed by MAC address.
    pub async fn get_configuration(&self, mac: &str) -> Result<Value> {
        let url = format!("{}/v1/agents/{}/configuration", self.api_url, mac);
        debug!(url = %url, "fetching agent configuration");

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AgentError::ControllerApi(format!("GET {url}: {e}")))?;

        let status = resp.status();
        if status != StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            return Err(AgentError::ControllerApi(format!(
                "unexpected status {status} from {url}: {body}"
            )));
        }

        resp.json::<Value>()
            .await
            .map_err(|e| AgentError::ControllerApi(format!("invalid configuration body: {e}")))
    }
}

#[async_trait]
impl HeartbeatApi for ControllerClient {
    async fn heartbeat(&self, hardware: &Value, mode: OperationMode, version: &str) -> Result<f64> {
        let url = format!("{}/v1/agents", self.api_url);
        let body = HeartbeatBody {
            hardware,
            mode,
            version,
        };
        trace!(url = %url, mode = %mode, "sending heartbeat");

        let resp = self
            .client
            .put(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Heartbeat(e.to_string()))?;

        let status = resp.status();
        if status != StatusCode::NO_CONTENT {
            let body = resp.text().await.unwrap_or_default();
            return Err(AgentError::Heartbeat(format!(
                "unexpected status {status}: {body}"
            )));
        }

        resp.headers()
            .get(HEARTBEAT_BEFORE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|deadline| deadline.is_finite())
            .ok_or_else(|| {
                AgentError::Heartbeat(format!("missing or invalid {HEARTBEAT_BEFORE_HEADER} header"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::json;

    #[tokio::test]
    async fn heartbeat_returns_deadline_header() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PUT", "/v1/agents")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Json(json!({
                "hardware": {"interfaces": []},
                "mode": "STANDBY",
                "version": "0.4.0"
            })))
            .with_status(204)
            .with_header(HEARTBEAT_BEFORE_HEADER, "1700000100.5")
            .create_async()
            .await;

        let client = ControllerClient::new(&server.url()).unwrap();
        let deadline = client
            .heartbeat(&json!({"interfaces": []}), OperationMode::Standby, "0.4.0")
            .await
            .expect("heartbeat should succeed");

        assert_eq!(deadline, 1_700_000_100.5);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn heartbeat_rejects_unexpected_status() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("PUT", "/v1/agents")
            .with_status(500)
            .with_body("controller exploded")
            .create_async()
            .await;

        let client = ControllerClient::new(&server.url()).unwrap();
        let err = client
            .heartbeat(&json!({}), OperationMode::Decom, "0.4.0")
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::Heartbeat(ref msg) if msg.contains("controller exploded")));
    }

    #[tokio::test]
    async fn heartbeat_requires_deadline_header() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("PUT", "/v1/agents")
            .with_status(204)
            .create_async()
            .await;

        let client = ControllerClient::new(&format!("{}/", server.url())).unwrap();
        let err = client
            .heartbeat(&json!({}), OperationMode::Standby, "0.4.0")
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "HeartbeatError");
    }

    #[tokio::test]
    async fn heartbeat_rejects_non_finite_deadline() {
        let mut server = Server::new_async().await;
        for value in ["NaN", "inf", "-infinity"] {
            let mock = server
                .mock("PUT", "/v1/agents")
                .with_status(204)
                .with_header(HEARTBEAT_BEFORE_HEADER, value)
                .create_async()
                .await;

            let client = ControllerClient::new(&server.url()).unwrap();
            let err = client
                .heartbeat(&json!({}), OperationMode::Standby, "0.4.0")
                .await
                .unwrap_err();

            assert_eq!(err.kind(), "HeartbeatError", "{value}");
            mock.remove_async().await;
        }
    }

    #[tokio::test]
    async fn get_configuration_fetches_json() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/agents/a4:bf:01:02:03:04/configuration")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"mode": "STANDBY", "heartbeat": true}"#)
            .create_async()
            .await;

        let client = ControllerClient::new(&server.url()).unwrap();
        let config = client.get_configuration("a4:bf:01:02:03:04").await.unwrap();

        assert_eq!(config, json!({"mode": "STANDBY", "heartbeat": true}));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn get_configuration_maps_failures() {
        let mut server = Server::new_async().await;
        let _missing = server
            .mock("GET", "/v1/agents/aa/configuration")
            .with_status(404)
            .create_async()
            .await;
        let _garbled = server
            .mock("GET", "/v1/agents/bb/configuration")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let client = ControllerClient::new(&server.url()).unwrap();
        assert_eq!(
            client.get_configuration("aa").await.unwrap_err().kind(),
            "ControllerAPIError"
        );
        assert_eq!(
            client.get_configuration("bb").await.unwrap_err().kind(),
            "ControllerAPIError"
        );
    }
}
