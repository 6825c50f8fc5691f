// Pull client settings and the push server description returned by
// `pull.config.get`.

use crate::codec::SchemaVersion;
use b24_core::{ApiVersion, CallMethod, Paging};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::client::PullError;

/// REST method returning the push server description
pub const CONFIG_METHOD: &str = "pull.config.get";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullConfig {
    pub schema: SchemaVersion,
    /// First reconnect delay
    pub base_retry_interval: Duration,
    pub max_retry_interval: Duration,
    /// Random share added on top of each delay, 0.0..=1.0
    pub jitter: f64,
    /// Outbound frames held while not connected
    pub outbound_queue_limit: usize,
    /// Message ids remembered for duplicate suppression
    pub dedup_window: usize,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            schema: SchemaVersion::Protobuf,
            base_retry_interval: Duration::from_secs(1),
            max_retry_interval: Duration::from_secs(60),
            jitter: 0.2,
            outbound_queue_limit: 1000,
            dedup_window: 512,
        }
    }
}

impl PullConfig {
    /// Delay before reconnect attempt `attempt` (0-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        let base = self
            .base_retry_interval
            .saturating_mul(factor)
            .min(self.max_retry_interval);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let extra = base.mul_f64(rand::rng().random_range(0.0..=jitter));
        (base + extra).min(self.max_retry_interval)
    }
}

/// How the client reaches the push server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    WebSocket,
    LongPolling,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullChannel {
    pub id: String,
    pub end: Option<DateTime<Utc>>,
}

impl PullChannel {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.end.is_some_and(|end| end <= now)
    }
}

/// Parsed `pull.config.get` result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullServerConfig {
    pub server_version: u32,
    pub websocket_url: Option<String>,
    pub long_polling_url: Option<String>,
    pub publish_url: Option<String>,
    pub private_channel: Option<PullChannel>,
    pub shared_channel: Option<PullChannel>,
    pub revision: Option<u64>,
    pub client_id: Option<String>,
}

impl PullServerConfig {
    /// Ask the portal for the push server description
    pub async fn fetch(caller: &dyn CallMethod) -> Result<Self, PullError> {
        let envelope = caller
            .call_versioned(
                CONFIG_METHOD,
                serde_json::json!({"CACHE": "N"}),
                ApiVersion::V2,
                Paging::Default,
            )
            .await?;
        let result = envelope
            .into_result()?
            .ok_or_else(|| PullError::Configuration(format!("{} returned no result", CONFIG_METHOD)))?;
        Self::from_response(&result)
    }

    pub fn from_response(result: &Value) -> Result<Self, PullError> {
        let server = result
            .get("server")
            .ok_or_else(|| PullError::Configuration("missing server section".to_string()))?;

        let server_version = server
            .get("version")
            .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0);

        let enabled = |key: &str| server.get(key).and_then(Value::as_bool).unwrap_or(true);
        let url = |key: &str| {
            server
                .get(format!("{}_secure", key).as_str())
                .or_else(|| server.get(key))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let channels = result.get("channels");
        let channel = |kind: &str| {
            channels
                .and_then(|c| c.get(kind))
                .and_then(|c| {
                    let id = c.get("id")?.as_str()?.to_string();
                    let end = c
                        .get("end")
                        .and_then(Value::as_str)
                        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                        .map(|d| d.with_timezone(&Utc));
                    Some(PullChannel { id, end })
                })
        };

        let config = Self {
            server_version,
            websocket_url: url("websocket").filter(|_| enabled("websocket_enabled")),
            long_polling_url: url("long_polling"),
            publish_url: url("publish").filter(|_| enabled("publish_enabled")),
            private_channel: channel("private"),
            shared_channel: channel("shared"),
            revision: result
                .get("api")
                .and_then(|a| a.get("revision_web"))
                .and_then(Value::as_u64),
            client_id: result
                .get("clientId")
                .and_then(Value::as_str)
                .map(str::to_string),
        };

        if config.private_channel.is_none() {
            return Err(PullError::Configuration(
                "missing private channel".to_string(),
            ));
        }
        if config.websocket_url.is_none() && config.long_polling_url.is_none() {
            return Err(PullError::Configuration(
                "server offers neither websocket nor long polling".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn schema(&self) -> SchemaVersion {
        SchemaVersion::for_server(self.server_version)
    }

    /// Prefers websocket when the server offers it
    pub fn preferred_kind(&self) -> ConnectionKind {
        if self.websocket_url.is_some() {
            ConnectionKind::WebSocket
        } else {
            ConnectionKind::LongPolling
        }
    }

    pub fn channel_ids(&self) -> Vec<&str> {
        self.private_channel
            .iter()
            .chain(self.shared_channel.iter())
            .map(|c| c.id.as_str())
            .collect()
    }

    pub fn has_expired_channel(&self, now: DateTime<Utc>) -> bool {
        self.private_channel
            .iter()
            .chain(self.shared_channel.iter())
            .any(|c| c.is_expired(now))
    }

    pub fn connection_url(&self, kind: ConnectionKind, mid: Option<&str>) -> Result<String, PullError> {
        let base = match kind {
            ConnectionKind::WebSocket => self.websocket_url.as_deref(),
            ConnectionKind::LongPolling => self.long_polling_url.as_deref(),
        }
        .ok_or_else(|| PullError::Configuration(format!("no {:?} url", kind)))?;

        let mut url = Url::parse(base)
            .map_err(|e| PullError::Configuration(format!("invalid push url {}: {}", base, e)))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("CHANNEL_ID", &self.channel_ids().join("/"));
            if self.schema() == SchemaVersion::Protobuf {
                query.append_pair("binaryMode", "true");
            }
            if let Some(revision) = self.revision {
                query.append_pair("revision", &revision.to_string());
            }
            if let Some(client_id) = &self.client_id {
                query.append_pair("clientId", client_id);
            }
            if let Some(mid) = mid {
                query.append_pair("mid", mid);
            }
        }
        Ok(url.into())
    }
}
