//! Delivery of serialized batches to the server
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::header::{CONNECTION, CONTENT_TYPE};
use reqwest::Client;

use crate::error::{AgentError, Result};

/// Path accepting a single JSON record
pub const SINGLE_UPDATE_PATH: &str = "/update/";

/// Path accepting a JSON array of records
pub const BATCH_UPDATE_PATH: &str = "/updates/";

/// Sends serialized payloads to a network endpoint
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Deliver one payload. Errors are reported but never retried.
    async fn send(&self, payload: Vec<u8>) -> Result<()>;

    /// Get the transport name
    fn name(&self) -> &str;
}

/// HTTP transport posting JSON to a fixed path on the server
pub struct HttpTransport {
    client: Client,
    url: String,
}

impl HttpTransport {
    /// Create a transport posting to `http://{address}{path}`
    pub fn new(address: &str, path: &str) -> Result<Self> {
        // Every send is an independent connection
        let client = Client::builder()
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| AgentError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: format!("http://{}{}", address, path),
        })
    }

    /// Transport for array-of-records batches
    pub fn batch(address: &str) -> Result<Self> {
        Self::new(address, BATCH_UPDATE_PATH)
    }

    /// Transport for single records
    pub fn single(address: &str) -> Result<Self> {
        Self::new(address, SINGLE_UPDATE_PATH)
    }

    /// The URL payloads are posted to
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, payload: Vec<u8>) -> Result<()> {
        debug!("Sending {} bytes to {}", payload.len(), self.url);

        let request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(CONNECTION, "close")
            .body(payload)
            .build()
            .map_err(|e| AgentError::Transport(format!("Failed to build request: {}", e)))?;

        let response = self
            .client
            .execute(request)
            .await
            .map_err(|e| AgentError::Transport(format!("Failed to send to {}: {}", self.url, e)))?;

        let status = response.status();
        if !status.is_success() {
            warn!("Server at {} answered {}", self.url, status);
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let batch = HttpTransport::batch("127.0.0.1:8080").unwrap();
        assert_eq!(batch.url(), "http://127.0.0.1:8080/updates/");

        let single = HttpTransport::single("localhost:9000").unwrap();
        assert_eq!(single.url(), "http://localhost:9000/update/");
    }

    #[tokio::test]
    async fn test_send_to_unreachable_endpoint_is_an_error() {
        // Port 9 (discard) on localhost is essentially never listening
        let transport = HttpTransport::batch("127.0.0.1:9").unwrap();
        let result = transport.send(b"[]".to_vec()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_invalid_address_fails_request_construction() {
        let transport = HttpTransport::batch("not a host:port").unwrap();
        let err = transport.send(b"[]".to_vec()).await.unwrap_err();
        assert!(err.to_string().contains("Transport error"));
    }
}
