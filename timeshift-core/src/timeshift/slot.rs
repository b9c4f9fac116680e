//! The one stream the host is playing.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{StreamContext, StreamKind, TimeshiftBuffer, TimeshiftResult, create_timeshift_buffer};

/// Owns the active buffer. Opening a new stream closes the previous one
/// before the replacement connects.
pub struct ActiveStream {
    context: StreamContext,
    current: Mutex<Option<Arc<dyn TimeshiftBuffer>>>,
}

impl ActiveStream {
    pub fn new(context: StreamContext) -> Self {
        Self {
            context,
            current: Mutex::new(None),
        }
    }

    /// Closes whatever is playing, then opens `url` as `kind`.
    ///
    /// On failure the slot is left empty.
    ///
    /// # Errors
    ///
    /// - Whatever the selected buffer's `open` returns
    pub async fn open(
        &self,
        kind: &StreamKind,
        url: &str,
    ) -> TimeshiftResult<Arc<dyn TimeshiftBuffer>> {
        let mut current = self.current.lock().await;
        if let Some(previous) = current.take() {
            debug!("Closing {} buffer before switching streams", previous.name());
            previous.close().await;
        }

        let buffer: Arc<dyn TimeshiftBuffer> =
            Arc::from(create_timeshift_buffer(kind, &self.context));
        buffer.open(url).await?;
        info!("Playing {} through the {} buffer", url, buffer.name());
        *current = Some(Arc::clone(&buffer));
        Ok(buffer)
    }

    /// Closes and drops the active buffer, if any.
    pub async fn close(&self) {
        if let Some(buffer) = self.current.lock().await.take() {
            buffer.close().await;
        }
    }

    pub async fn current(&self) -> Option<Arc<dyn TimeshiftBuffer>> {
        self.current.lock().await.clone()
    }
}
