//! Raw socket connector for the block-window protocol.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use super::{TransportError, TransportResult};

/// Full-duplex byte stream carrying block requests and responses.
pub trait BlockSocket: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> BlockSocket for T {}

/// Owned socket handed to the block-window producer.
pub type BoxedSocket = Box<dyn BlockSocket>;

/// Opens block-protocol connections.
#[async_trait]
pub trait BlockConnector: Send + Sync {
    /// Connects to the backend's block listener.
    ///
    /// # Errors
    ///
    /// - `TransportError::Connect` - Connection refused or unreachable
    /// - `TransportError::Timeout` - No connection within the connect timeout
    async fn connect(&self) -> TransportResult<BoxedSocket>;
}

/// TCP connector with a bounded connect wait.
pub struct TcpConnector {
    address: String,
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        Self {
            address: format!("{host}:{port}"),
            timeout,
        }
    }
}

#[async_trait]
impl BlockConnector for TcpConnector {
    async fn connect(&self) -> TransportResult<BoxedSocket> {
        let stream = match tokio::time::timeout(self.timeout, TcpStream::connect(&self.address))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TransportError::Connect {
                    target: self.address.clone(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(TransportError::Timeout {
                    target: self.address.clone(),
                });
            }
        };

        stream.set_nodelay(true)?;
        debug!("Connected block socket to {}", self.address);
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn test_connects_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            peer.write_all(b"hi").await.unwrap();
        });

        let connector = TcpConnector::new("127.0.0.1", port, Duration::from_secs(2));
        let mut socket = connector.connect().await.unwrap();
        let mut greeting = [0u8; 2];
        socket.read_exact(&mut greeting).await.unwrap();
        assert_eq!(&greeting, b"hi");
    }

    #[tokio::test]
    async fn test_refused_connection_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = TcpConnector::new("127.0.0.1", port, Duration::from_secs(2));
        assert!(matches!(
            connector.connect().await,
            Err(TransportError::Connect { .. })
        ));
    }
}
