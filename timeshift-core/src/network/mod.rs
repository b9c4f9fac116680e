//! Network abstraction layer for production and simulation environments
//!
//! The backend control plane is a plain request/response exchange over HTTP.
//! Both the real client and the simulation speak through [`NetworkLayer`] so
//! the response handling in [`crate::backend`] is exercised identically.

pub mod simulation;

use std::time::Duration;

use async_trait::async_trait;
pub use simulation::SimulationNetworkLayer;

use crate::config::BackendConfig;

/// Errors from the HTTP exchange itself, before any response is interpreted.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("Request timed out: {url}")]
    Timeout { url: String },

    #[error("Failed to connect: {url}")]
    Connect { url: String },

    #[error("HTTP request failed: {reason}")]
    Request { reason: String },

    #[error("HTTP client setup failed: {0}")]
    Client(#[from] reqwest::Error),
}

/// HTTP response abstraction
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code (200, 404, 500, etc.)
    pub status_code: u16,
    /// Response body bytes
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Create new HTTP response with status code and body
    pub fn new(status_code: u16, body: Vec<u8>) -> Self {
        Self { status_code, body }
    }

    /// Returns true if the HTTP status code indicates success (2xx).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Response body as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Network layer abstraction for HTTP operations
#[async_trait]
pub trait NetworkLayer: Send + Sync {
    /// Performs HTTP GET request
    ///
    /// # Errors
    ///
    /// - `NetworkError::Timeout` - No response within the configured timeout
    /// - `NetworkError::Connect` - Backend unreachable
    /// - `NetworkError::Request` - Any other transport failure
    async fn http_get(&self, url: &str) -> Result<HttpResponse, NetworkError>;

    /// Returns current timeout setting
    fn timeout(&self) -> Duration;
}

/// Production HTTP client using reqwest
pub struct ProductionNetworkLayer {
    client: reqwest::Client,
    timeout: Duration,
}

impl ProductionNetworkLayer {
    /// Creates a network layer using the backend's timeout and user agent.
    ///
    /// # Errors
    ///
    /// - `NetworkError::Client` - TLS backend or client builder failed to initialise
    pub fn new(config: &BackendConfig) -> Result<Self, NetworkError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()?;

        Ok(Self {
            client,
            timeout: config.request_timeout,
        })
    }
}

#[async_trait]
impl NetworkLayer for ProductionNetworkLayer {
    async fn http_get(&self, url: &str) -> Result<HttpResponse, NetworkError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                NetworkError::Timeout {
                    url: url.to_string(),
                }
            } else if e.is_connect() {
                NetworkError::Connect {
                    url: url.to_string(),
                }
            } else {
                NetworkError::Request {
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| NetworkError::Request {
                reason: format!("Failed to read response body: {e}"),
            })?
            .to_vec();

        Ok(HttpResponse::new(status, body))
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_success_range() {
        assert!(HttpResponse::new(200, vec![]).is_success());
        assert!(HttpResponse::new(206, vec![]).is_success());
        assert!(!HttpResponse::new(404, vec![]).is_success());
        assert!(!HttpResponse::new(500, vec![]).is_success());
    }

    #[test]
    fn test_response_text_is_lossy() {
        let response = HttpResponse::new(200, vec![b'o', b'k', 0xff]);
        assert!(response.text().starts_with("ok"));
    }

    #[test]
    fn test_production_layer_uses_configured_timeout() {
        let config = BackendConfig {
            request_timeout: Duration::from_secs(3),
            ..Default::default()
        };
        let layer = ProductionNetworkLayer::new(&config).unwrap();
        assert_eq!(layer.timeout(), Duration::from_secs(3));
    }
}
