//! HTTP service client for the DVR backend.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use url::Url;

use super::response::{parse_ack, parse_capabilities, parse_stream_info, parse_transcode_status};
use super::{
    Backend, BackendError, BackendResult, Capabilities, LeaseKind, StreamInfo, TranscodeStatus,
};
use crate::config::BackendConfig;
use crate::network::NetworkLayer;

/// [`Backend`] implementation over the backend's `/services/service` API.
pub struct HttpBackend {
    base_url: String,
    session_id: String,
    network: Arc<dyn NetworkLayer>,
}

impl HttpBackend {
    /// Creates a client for the configured backend and session.
    pub fn new(config: &BackendConfig, network: Arc<dyn NetworkLayer>) -> Self {
        Self {
            base_url: config.base_url(),
            session_id: config.session_id.clone(),
            network,
        }
    }

    /// Builds a service URL with the session id and extra query parameters.
    pub(crate) fn service_url(&self, method: &str, params: &[(&str, &str)]) -> String {
        let raw = format!("{}/services/service", self.base_url);
        match Url::parse(&raw) {
            Ok(mut url) => {
                {
                    let mut query = url.query_pairs_mut();
                    query.append_pair("method", method);
                    for (key, value) in params {
                        query.append_pair(key, value);
                    }
                    if !self.session_id.is_empty() {
                        query.append_pair("sid", &self.session_id);
                    }
                }
                url.to_string()
            }
            Err(e) => {
                warn!("Invalid backend base URL {}: {}", self.base_url, e);
                raw
            }
        }
    }

    async fn call(&self, method: &str, params: &[(&str, &str)]) -> BackendResult<String> {
        let url = self.service_url(method, params);
        debug!("Backend request: {}", method);

        let response = self.network.http_get(&url).await?;
        if response.status_code == 404 {
            return Err(BackendError::NotFound {
                stream: params
                    .iter()
                    .find(|(key, _)| *key == "stream")
                    .map(|(_, value)| value.to_string())
                    .unwrap_or_default(),
            });
        }
        if !response.is_success() {
            return Err(BackendError::Http {
                method: method.to_string(),
                status: response.status_code,
            });
        }
        Ok(response.text())
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn capabilities(&self) -> BackendResult<Capabilities> {
        let method = "session.capabilities";
        let body = self.call(method, &[]).await?;
        parse_capabilities(method, &body)
    }

    async fn start_stream(&self, stream: &str) -> BackendResult<()> {
        let method = "channel.stream.start";
        let body = self.call(method, &[("stream", stream)]).await?;
        parse_ack(method, &body)
    }

    async fn stop_stream(&self, stream: &str) -> BackendResult<()> {
        let method = "channel.stream.stop";
        let body = self.call(method, &[("stream", stream)]).await?;
        parse_ack(method, &body)
    }

    async fn stream_info(&self, stream: &str) -> BackendResult<StreamInfo> {
        let method = "channel.stream.info";
        let body = self.call(method, &[("stream", stream)]).await?;
        parse_stream_info(method, &body)
    }

    fn segment_url(&self, stream: &str, filename: &str) -> String {
        let raw = format!("{}/stream", self.base_url);
        match Url::parse(&raw) {
            Ok(mut url) => {
                url.query_pairs_mut()
                    .append_pair("f", filename)
                    .append_pair("stream", stream)
                    .append_pair("mode", "http")
                    .append_pair("sid", &self.session_id);
                url.to_string()
            }
            Err(_) => raw,
        }
    }

    async fn start_transcode(&self, stream: &str, profile: &str) -> BackendResult<()> {
        let method = "channel.transcode.initiate";
        let body = self
            .call(method, &[("stream", stream), ("profile", profile), ("force", "true")])
            .await?;
        parse_ack(method, &body)
    }

    async fn transcode_status(&self, stream: &str) -> BackendResult<TranscodeStatus> {
        let method = "channel.transcode.status";
        let body = self.call(method, &[("stream", stream)]).await?;
        parse_transcode_status(method, &body)
    }

    fn transcode_url(&self, stream: &str) -> String {
        self.service_url("channel.transcode.m3u8", &[("stream", stream)])
    }

    async fn stop_transcode(&self, stream: &str) -> BackendResult<()> {
        let method = "channel.transcode.stop";
        let body = self.call(method, &[("stream", stream)]).await?;
        parse_ack(method, &body)
    }

    async fn lease(&self, stream: &str, kind: LeaseKind) -> BackendResult<()> {
        let method = kind.method();
        let body = self.call(method, &[("stream", stream)]).await?;
        parse_ack(method, &body)
    }
}
