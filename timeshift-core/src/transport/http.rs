//! Ranged HTTP transport over reqwest.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use tracing::debug;

use super::{MediaReader, MediaTransport, TransportError, TransportResult};
use crate::config::BackendConfig;

/// Opens stream URLs with `Range: bytes=N-` requests.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Creates a transport sharing the backend's user agent.
    ///
    /// No overall request timeout is set: stream bodies stay open for as long
    /// as playback continues.
    ///
    /// # Errors
    ///
    /// - `TransportError::Http` - Client builder failed to initialise
    pub fn new(config: &BackendConfig) -> TransportResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }

    async fn request(&self, url: &str, offset: u64) -> TransportResult<HttpReader> {
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout {
                    target: url.to_string(),
                }
            } else {
                TransportError::Connect {
                    target: url.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(TransportError::NotFound {
                url: url.to_string(),
            });
        }
        if !status.is_success() {
            return Err(TransportError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let headers = response.headers();
        let seekable = status == StatusCode::PARTIAL_CONTENT
            || headers
                .get(ACCEPT_RANGES)
                .and_then(|value| value.to_str().ok())
                .is_some_and(|value| value.contains("bytes"));

        // Offset was ignored by a server answering 200 to a ranged request.
        let position = if status == StatusCode::PARTIAL_CONTENT {
            offset
        } else {
            0
        };

        let length = headers
            .get(CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_content_range_total)
            .or_else(|| {
                headers
                    .get(CONTENT_LENGTH)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<u64>().ok())
                    .map(|len| len + position)
            });

        debug!(
            "Opened {} at {} (status {}, length {:?})",
            url, position, status, length
        );

        Ok(HttpReader {
            client: self.client.clone(),
            url: url.to_string(),
            response: Some(response),
            pending: Bytes::new(),
            position,
            length,
            seekable,
        })
    }
}

/// Total length from a `Content-Range: bytes a-b/total` header.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse::<u64>().ok()
}

#[async_trait]
impl MediaTransport for HttpTransport {
    async fn open(&self, url: &str, offset: u64) -> TransportResult<Box<dyn MediaReader>> {
        Ok(Box::new(self.request(url, offset).await?))
    }
}

/// Reader over one HTTP response body; seeking reopens the URL.
pub struct HttpReader {
    client: reqwest::Client,
    url: String,
    response: Option<reqwest::Response>,
    pending: Bytes,
    position: u64,
    length: Option<u64>,
    seekable: bool,
}

#[async_trait]
impl MediaReader for HttpReader {
    async fn read(&mut self, buf: &mut [u8]) -> TransportResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        if self.pending.is_empty() {
            let Some(response) = self.response.as_mut() else {
                return Ok(0);
            };
            match response.chunk().await? {
                Some(chunk) => self.pending = chunk,
                None => {
                    self.response = None;
                    return Ok(0);
                }
            }
        }

        let count = buf.len().min(self.pending.len());
        buf[..count].copy_from_slice(&self.pending.split_to(count));
        self.position += count as u64;
        Ok(count)
    }

    async fn seek(&mut self, position: u64) -> TransportResult<u64> {
        if position == self.position {
            return Ok(position);
        }
        if !self.seekable {
            return Err(TransportError::NotSeekable);
        }

        let transport = HttpTransport {
            client: self.client.clone(),
        };
        let reopened = transport.request(&self.url, position).await?;
        *self = reopened;
        Ok(self.position)
    }

    fn length(&self) -> Option<u64> {
        self.length
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn is_seekable(&self) -> bool {
        self.seekable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_range_total() {
        assert_eq!(parse_content_range_total("bytes 100-199/1000"), Some(1000));
        assert_eq!(parse_content_range_total("bytes 0-0/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[tokio::test]
    async fn test_unreachable_host_fails_to_connect() {
        let config = BackendConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            ..Default::default()
        };
        let transport = HttpTransport::new(&config).unwrap();
        let result = transport.open("http://127.0.0.1:1/live", 0).await;
        assert!(matches!(
            result,
            Err(TransportError::Connect { .. }) | Err(TransportError::Timeout { .. })
        ));
    }
}
