// Pooled HTTP client for the upstream API

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::request::UpstreamRequest;
use crate::config::UpstreamConfig;
use crate::error::GatewayError;

#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    permits: Arc<Semaphore>,
    read_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .pool_max_idle_per_host(config.max_idle_per_host)
            .build()
            .map_err(|e| GatewayError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            permits: Arc::new(Semaphore::new(config.max_connections.max(1))),
            read_timeout: Duration::from_secs(config.read_timeout_secs),
        })
    }

    /// Issue the request and return once response headers are in, bounded by the
    /// read timeout. The returned response holds a connection permit until dropped.
    pub async fn send(&self, request: &UpstreamRequest) -> Result<UpstreamResponse, GatewayError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| GatewayError::Request("upstream client is shut down".to_string()))?;

        let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| GatewayError::Request(format!("invalid method {}", request.method)))?;

        let pending = self
            .http
            .request(method, &request.url)
            .headers(to_header_map(request))
            .json(&request.body)
            .send();
        let response = match tokio::time::timeout(self.read_timeout, pending).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(GatewayError::Request(format!(
                    "no response from upstream within {}s",
                    self.read_timeout.as_secs()
                )))
            }
        };

        Ok(UpstreamResponse {
            response,
            read_timeout: self.read_timeout,
            _permit: permit,
        })
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

fn to_header_map(request: &UpstreamRequest) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in &request.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::warn!("Skipping invalid header {}", name),
        }
    }
    headers
}

pub struct UpstreamResponse {
    response: reqwest::Response,
    read_timeout: Duration,
    _permit: OwnedSemaphorePermit,
}

impl UpstreamResponse {
    pub fn status(&self) -> u16 {
        self.response.status().as_u16()
    }

    pub fn is_success(&self) -> bool {
        self.response.status().is_success()
    }

    /// Next body chunk; `None` at end of stream. Each read is bounded by the read timeout.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, GatewayError> {
        match tokio::time::timeout(self.read_timeout, self.response.chunk()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(GatewayError::Request(format!(
                "no data from upstream for {}s",
                self.read_timeout.as_secs()
            ))),
        }
    }

    pub async fn text(self) -> String {
        self.response.text().await.unwrap_or_default()
    }
}
