//! Simulation network layer for deterministic testing

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{HttpResponse, NetworkError, NetworkLayer};

/// Simulated network layer returning canned responses.
///
/// Responses are matched by exact URL first, then by the `method` query
/// parameter of the service URL. Every requested URL is recorded.
pub struct SimulationNetworkLayer {
    timeout: Duration,
    responses: HashMap<String, HttpResponse>,
    method_responses: Mutex<HashMap<String, Vec<HttpResponse>>>,
    requests: Mutex<Vec<String>>,
    offline: bool,
}

impl SimulationNetworkLayer {
    /// Creates new simulation network layer with default settings
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            responses: HashMap::new(),
            method_responses: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            offline: false,
        }
    }

    /// Creates a layer where every request fails to connect.
    pub fn offline() -> Self {
        Self {
            offline: true,
            ..Self::new()
        }
    }

    /// Add a predefined response for an exact URL
    pub fn add_response(&mut self, url: &str, response: HttpResponse) {
        self.responses.insert(url.to_string(), response);
    }

    /// Queue a response for a service method.
    ///
    /// Queued responses are served in order; the last one repeats.
    pub fn add_method_response(&self, method: &str, body: &str) {
        self.method_responses
            .lock()
            .entry(method.to_string())
            .or_default()
            .push(HttpResponse::new(200, body.as_bytes().to_vec()));
    }

    /// URLs requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    /// Number of requests made for a service method.
    pub fn method_count(&self, method: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|url| service_method(url).as_deref() == Some(method))
            .count()
    }
}

impl Default for SimulationNetworkLayer {
    fn default() -> Self {
        Self::new()
    }
}

fn service_method(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    parsed
        .query_pairs()
        .find(|(key, _)| key == "method")
        .map(|(_, value)| value.into_owned())
}

#[async_trait]
impl NetworkLayer for SimulationNetworkLayer {
    async fn http_get(&self, url: &str) -> Result<HttpResponse, NetworkError> {
        self.requests.lock().push(url.to_string());

        if self.offline {
            return Err(NetworkError::Connect {
                url: url.to_string(),
            });
        }

        if let Some(response) = self.responses.get(url) {
            tracing::debug!("Simulation: returning predefined response for {}", url);
            return Ok(response.clone());
        }

        if let Some(method) = service_method(url) {
            let mut queued = self.method_responses.lock();
            if let Some(responses) = queued.get_mut(&method)
                && !responses.is_empty()
            {
                let response = if responses.len() > 1 {
                    responses.remove(0)
                } else {
                    responses[0].clone()
                };
                return Ok(response);
            }
        }

        tracing::debug!(
            "Simulation: no response configured for {}, returning 404",
            url
        );
        Ok(HttpResponse::new(404, b"Not Found".to_vec()))
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_method_responses_are_served_in_order() {
        let layer = SimulationNetworkLayer::new();
        layer.add_method_response("channel.stream.info", "first");
        layer.add_method_response("channel.stream.info", "second");

        let url = "http://dvr:8866/services/service?method=channel.stream.info&sid=1";
        assert_eq!(layer.http_get(url).await.unwrap().text(), "first");
        assert_eq!(layer.http_get(url).await.unwrap().text(), "second");
        assert_eq!(layer.http_get(url).await.unwrap().text(), "second");
        assert_eq!(layer.method_count("channel.stream.info"), 3);
    }

    #[tokio::test]
    async fn test_unknown_url_is_not_found() {
        let layer = SimulationNetworkLayer::new();
        let response = layer.http_get("http://dvr/unknown").await.unwrap();
        assert_eq!(response.status_code, 404);
    }

    #[tokio::test]
    async fn test_offline_layer_fails_to_connect() {
        let layer = SimulationNetworkLayer::offline();
        assert!(matches!(
            layer.http_get("http://dvr/").await,
            Err(NetworkError::Connect { .. })
        ));
    }
}
