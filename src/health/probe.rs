//! Agent node liveness probes

use async_trait::async_trait;
use serde::Deserialize;

use crate::Result;
use crate::db::AgentNode;

/// What a probe learned about a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub healthy: bool,
    /// Reason for an unhealthy report
    pub detail: Option<String>,
}

impl ProbeReport {
    /// A healthy report
    #[must_use]
    pub const fn healthy() -> Self {
        Self {
            healthy: true,
            detail: None,
        }
    }

    /// An unhealthy report with a reason
    #[must_use]
    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            detail: Some(detail.into()),
        }
    }
}

/// Checks whether an agent node is alive
#[async_trait]
pub trait AgentProbe: Send + Sync {
    /// Probe one node
    ///
    /// Transport failures are errors; answers that indicate trouble are
    /// unhealthy reports.
    async fn probe(&self, node: &AgentNode) -> Result<ProbeReport>;
}

#[derive(Deserialize)]
struct HealthPayload {
    healthy: bool,
    #[serde(default)]
    message: Option<String>,
}

/// Probes `GET http://{host}:{port}/health`, expecting `{"healthy": bool}`
#[derive(Clone, Default)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    /// Create a probe with its own HTTP client
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn url(node: &AgentNode) -> String {
        format!("http://{}:{}/health", node.host, node.port)
    }
}

#[async_trait]
impl AgentProbe for HttpProbe {
    async fn probe(&self, node: &AgentNode) -> Result<ProbeReport> {
        let response = self.client.get(Self::url(node)).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Ok(ProbeReport::unhealthy(format!("HTTP {status}")));
        }

        match response.json::<HealthPayload>().await {
            Ok(payload) if payload.healthy => Ok(ProbeReport::healthy()),
            Ok(payload) => Ok(ProbeReport::unhealthy(
                payload
                    .message
                    .unwrap_or_else(|| "agent reported unhealthy".to_string()),
            )),
            Err(e) => Ok(ProbeReport::unhealthy(format!("invalid health payload: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn probe_url() {
        let node = AgentNode {
            id: "n1".to_string(),
            name: "agent-1".to_string(),
            host: "10.0.0.5".to_string(),
            port: 7575,
            is_active: true,
            healthy: true,
            last_probe_at: None,
            last_probe_error: None,
            last_heartbeat: None,
            created_at: Utc::now(),
        };
        assert_eq!(HttpProbe::url(&node), "http://10.0.0.5:7575/health");
    }

    #[test]
    fn payload_message_is_optional() {
        let p: HealthPayload = serde_json::from_str(r#"{"healthy": false}"#).unwrap();
        assert!(!p.healthy);
        assert!(p.message.is_none());
    }
}
