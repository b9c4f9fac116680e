//! Interruptible access to one open transport reader.

use tokio::sync::{Mutex, watch};

use crate::transport::{MediaReader, TransportResult};

/// Outcome of a read through [`ReaderSlot::read`].
#[derive(Debug)]
pub enum SlotRead {
    /// Bytes copied; zero means the reader is at its current end
    Data(usize),
    /// No reader is open
    Empty,
    /// The session closed while the read was pending
    Closed,
    /// Transport error; the reader has been dropped
    Failed(crate::transport::TransportError),
}

/// The transport reader a proxying strategy currently streams from.
///
/// Reads race the session's shutdown signal so `close` never waits behind a
/// stalled network read.
#[derive(Default)]
pub struct ReaderSlot {
    reader: Mutex<Option<Box<dyn MediaReader>>>,
}

impl ReaderSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `reader`, dropping any previous one.
    pub async fn replace(&self, reader: Box<dyn MediaReader>) {
        *self.reader.lock().await = Some(reader);
    }

    /// Drops the open reader.
    pub async fn clear(&self) {
        self.reader.lock().await.take();
    }

    pub async fn read(&self, buf: &mut [u8], shutdown: &mut watch::Receiver<bool>) -> SlotRead {
        if *shutdown.borrow() {
            return SlotRead::Closed;
        }

        let mut guard = tokio::select! {
            guard = self.reader.lock() => guard,
            _ = shutdown.changed() => return SlotRead::Closed,
        };
        let Some(reader) = guard.as_mut() else {
            return SlotRead::Empty;
        };

        let result = tokio::select! {
            result = reader.read(buf) => result,
            _ = shutdown.changed() => return SlotRead::Closed,
        };
        match result {
            Ok(count) => SlotRead::Data(count),
            Err(e) => {
                guard.take();
                SlotRead::Failed(e)
            }
        }
    }

    /// Repositions the open reader. `None` when no reader is open.
    pub async fn seek(&self, position: u64) -> Option<TransportResult<u64>> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut()?;
        Some(reader.seek(position).await)
    }
}
