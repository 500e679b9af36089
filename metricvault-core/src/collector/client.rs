//! HTTP client for the remote metrics API
//!
//! Two endpoints are used: `POST {endpoint}/metrics/hybrid-sync` to
//! replicate one event and `GET {endpoint}/health` to probe availability.
//! Failures are classified into [`RemoteError`] here, where the cause is
//! still known.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;

use crate::config::CollectorConfig;
use crate::error::{Error, RemoteError, Result};
use crate::types::MetricsEvent;

/// Source tag sent with every replicated event
pub const SOURCE_TAG: &str = "hybrid-collector";

/// Remote store the collector replicates into
#[async_trait]
pub trait RemoteSink: Send + Sync {
    /// Replicate one event
    async fn send(&self, event: &MetricsEvent) -> std::result::Result<(), RemoteError>;

    /// Probe availability
    async fn health(&self) -> std::result::Result<(), RemoteError>;
}

/// reqwest-backed [`RemoteSink`]
pub struct RemoteClient {
    http_client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl RemoteClient {
    /// Create a new client from configuration
    ///
    /// Returns an error if the endpoint, credential or tenant is missing.
    pub fn new(config: &CollectorConfig) -> Result<Self> {
        let base_url = config
            .endpoint
            .clone()
            .ok_or_else(|| Error::Config("collector.endpoint is required".to_string()))?
            .trim_end_matches('/')
            .to_string();
        let api_key = config
            .api_key
            .as_deref()
            .ok_or_else(|| Error::Config("collector.api_key is required".to_string()))?;
        let tenant_id = config
            .tenant_id
            .as_deref()
            .ok_or_else(|| Error::Config("collector.tenant_id is required".to_string()))?;

        // Build default headers
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|e| Error::Config(format!("invalid api_key: {}", e)))?,
        );
        headers.insert(
            "X-Tenant-ID",
            HeaderValue::from_str(tenant_id)
                .map_err(|e| Error::Config(format!("invalid tenant_id: {}", e)))?,
        );

        let timeout = config.sync_timeout();
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url,
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn classify(&self, err: reqwest::Error, started: Instant) -> RemoteError {
        match RemoteError::from(err) {
            RemoteError::Timeout { .. } => RemoteError::Timeout {
                elapsed_ms: started.elapsed().as_millis().max(self.timeout.as_millis()) as u64,
            },
            other => other,
        }
    }
}

/// Request body for POST /metrics/hybrid-sync
#[derive(Serialize)]
struct SyncRequest<'a> {
    event: &'a MetricsEvent,
    source: &'static str,
    timestamp: DateTime<Utc>,
}

#[async_trait]
impl RemoteSink for RemoteClient {
    async fn send(&self, event: &MetricsEvent) -> std::result::Result<(), RemoteError> {
        let url = format!("{}/metrics/hybrid-sync", self.base_url);
        let body = SyncRequest {
            event,
            source: SOURCE_TAG,
            timestamp: Utc::now(),
        };

        let started = Instant::now();
        let response = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.classify(e, started))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            Err(RemoteError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }

    async fn health(&self) -> std::result::Result<(), RemoteError> {
        let url = format!("{}/health", self.base_url);
        let started = Instant::now();

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.classify(e, started))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(RemoteError::Status {
                status: status.as_u16(),
                body: format!("health probe returned {}", status),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_config() -> CollectorConfig {
        CollectorConfig {
            enabled: true,
            endpoint: Some("https://metrics.example.com/api/".to_string()),
            api_key: Some("mv_live_test".to_string()),
            tenant_id: Some("tenant-a".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_client_requires_endpoint_and_credentials() {
        assert!(RemoteClient::new(&CollectorConfig::default()).is_err());

        let mut config = ready_config();
        config.tenant_id = None;
        assert!(RemoteClient::new(&config).is_err());
    }

    #[test]
    fn test_client_trims_trailing_slash() {
        let client = RemoteClient::new(&ready_config()).unwrap();
        assert_eq!(client.base_url(), "https://metrics.example.com/api");
    }

    #[test]
    fn test_header_values_are_validated() {
        let mut config = ready_config();
        config.api_key = Some("bad\nkey".to_string());
        assert!(RemoteClient::new(&config).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_retryable() {
        let mut config = ready_config();
        // Reserved port on loopback; nothing listens there
        config.endpoint = Some("http://127.0.0.1:9".to_string());
        config.sync_timeout_ms = 500;
        let client = RemoteClient::new(&config).unwrap();

        let err = client.health().await.unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {:?}", err);
    }
}
