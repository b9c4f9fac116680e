//! Background tasks owned by one stream session.

use std::future::Future;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Shutdown signal plus the join handles of every task a session spawned.
///
/// Tasks observe the signal through [`WorkerSet::subscribe`]; `stop` raises
/// it and joins them, aborting any that overrun the timeout.
pub struct WorkerSet {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerSet {
    pub fn new(name: &'static str) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            name,
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Clears a previous shutdown so a reopened session can spawn again.
    pub fn rearm(&self) {
        self.shutdown.send_replace(false);
    }

    /// Receiver that changes to `true` when the session closes.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Spawns a task tied to this session.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handles.lock().push(tokio::spawn(task));
    }

    /// Raises shutdown without waiting, waking every subscribed task.
    pub fn signal(&self) {
        self.shutdown.send_replace(true);
    }

    /// Raises shutdown and joins every task within `timeout`.
    ///
    /// Returns false when a task had to be aborted.
    pub async fn stop(&self, timeout: Duration) -> bool {
        self.signal();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        if handles.is_empty() {
            return true;
        }

        let count = handles.len();
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        match tokio::time::timeout(timeout, join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result
                        && e.is_panic()
                    {
                        warn!("{} worker panicked: {}", self.name, e);
                    }
                }
                debug!("Joined {} {} workers", count, self.name);
                true
            }
            Err(_) => {
                warn!(
                    "{} workers did not stop within {:?}, aborting",
                    self.name, timeout
                );
                for abort in aborts {
                    abort.abort();
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_stop_joins_cooperative_task() {
        let workers = WorkerSet::new("test");
        let finished = Arc::new(AtomicBool::new(false));

        let mut shutdown = workers.subscribe();
        let flag = Arc::clone(&finished);
        workers.spawn(async move {
            let _ = shutdown.wait_for(|stopping| *stopping).await;
            flag.store(true, Ordering::SeqCst);
        });

        assert!(workers.stop(Duration::from_secs(1)).await);
        assert!(finished.load(Ordering::SeqCst));
        assert!(workers.is_stopping());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_aborts_stuck_task() {
        let workers = WorkerSet::new("test");
        workers.spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        assert!(!workers.stop(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_rearm_clears_shutdown() {
        let workers = WorkerSet::new("test");
        workers.signal();
        assert!(workers.is_stopping());
        workers.rearm();
        assert!(!workers.is_stopping());
    }
}
