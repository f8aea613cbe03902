//! Consul KV HTTP client.

use std::time::Duration;

use async_trait::async_trait;
use knockrd_core::{ConsulConfig, SinkError};
use reqwest::{Client, Response};

use super::kv::KvClient;

const SINK_NAME: &str = "consul";

/// [`KvClient`] writing to a Consul agent's KV store.
pub struct ConsulKvClient {
    client: Client,
    base_url: String,
    datacenter: Option<String>,
    timeout: Duration,
}

impl ConsulKvClient {
    /// Build a client for `config`. Each request is bounded by `timeout`.
    pub fn new(config: &ConsulConfig, timeout: Duration) -> Result<Self, SinkError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SinkError::Transport {
                sink: SINK_NAME,
                reason: format!("Failed to build HTTP client: {}", e),
            })?;
        Ok(Self {
            client,
            base_url: config.base_url(),
            datacenter: config
                .datacenter
                .clone()
                .filter(|dc| !dc.trim().is_empty()),
            timeout,
        })
    }

    /// `<base>/v1/kv/<key>`. The key is used as given; address segments are
    /// already percent-encoded.
    pub fn kv_url(&self, key: &str) -> String {
        format!("{}/v1/kv/{}", self.base_url, key.trim_start_matches('/'))
    }

    fn map_send_error(&self, operation: &'static str, e: reqwest::Error) -> SinkError {
        if e.is_timeout() {
            SinkError::Timeout {
                sink: SINK_NAME,
                operation,
                after: self.timeout,
            }
        } else {
            SinkError::Transport {
                sink: SINK_NAME,
                reason: e.to_string(),
            }
        }
    }

    async fn check(response: Response) -> Result<String, SinkError> {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_success() {
            Ok(body)
        } else {
            Err(SinkError::Rejected {
                sink: SINK_NAME,
                status: status.as_u16(),
                reason: body.trim().to_string(),
            })
        }
    }

    fn query(&self) -> Vec<(&'static str, String)> {
        self.datacenter
            .iter()
            .map(|dc| ("dc", dc.clone()))
            .collect()
    }
}

impl std::fmt::Debug for ConsulKvClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsulKvClient")
            .field("base_url", &self.base_url)
            .field("datacenter", &self.datacenter)
            .finish()
    }
}

#[async_trait]
impl KvClient for ConsulKvClient {
    fn name(&self) -> &'static str {
        SINK_NAME
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), SinkError> {
        let response = self
            .client
            .put(self.kv_url(key))
            .query(&self.query())
            .body(value.to_string())
            .send()
            .await
            .map_err(|e| self.map_send_error("put", e))?;
        let body = Self::check(response).await?;
        // Consul answers a plain `true` or `false`.
        if body.trim() == "false" {
            return Err(SinkError::Rejected {
                sink: SINK_NAME,
                status: 200,
                reason: format!("write of {} was not applied", key),
            });
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SinkError> {
        let response = self
            .client
            .delete(self.kv_url(key))
            .query(&self.query())
            .send()
            .await
            .map_err(|e| self.map_send_error("delete", e))?;
        Self::check(response).await?;
        Ok(())
    }
}
