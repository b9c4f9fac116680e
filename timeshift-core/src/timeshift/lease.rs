//! Keep-alive and metadata refresh worker.
//!
//! The backend reaps stream and transcode sessions that go quiet, and it
//! never pushes metadata. One worker per session covers both: on each tick it
//! renews the lease when due and runs the owner's metadata poll when due.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Session side of the lease worker.
#[async_trait]
pub trait LeaseTarget: Send + Sync {
    /// Sends a keep-alive if the session needs one. Returns false on failure.
    async fn renew_lease(&self) -> bool;

    /// Polls remote metadata and returns the delay until the next poll.
    async fn refresh(&self) -> Duration;
}

/// Cadences driving the worker.
#[derive(Debug, Clone, Copy)]
pub struct LeaseSchedule {
    pub lease_interval: Duration,
    pub retry_interval: Duration,
    /// Delay before the first metadata poll
    pub first_refresh: Duration,
    pub tick: Duration,
}

impl LeaseSchedule {
    pub fn new(
        lease_interval: Duration,
        retry_interval: Duration,
        refresh_interval: Duration,
    ) -> Self {
        let tick = refresh_interval
            .min(retry_interval)
            .max(Duration::from_millis(50));
        Self {
            lease_interval,
            retry_interval,
            first_refresh: refresh_interval,
            tick,
        }
    }
}

/// Runs until `shutdown` turns true.
pub async fn run_lease_worker(
    target: Arc<dyn LeaseTarget>,
    schedule: LeaseSchedule,
    mut shutdown: watch::Receiver<bool>,
) {
    let start = Instant::now();
    let mut next_lease = start + schedule.lease_interval;
    let mut next_refresh = start + schedule.first_refresh;

    let mut ticker = tokio::time::interval(schedule.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() || shutdown.has_changed().is_err() {
            break;
        }

        let now = Instant::now();
        if now >= next_lease {
            if target.renew_lease().await {
                next_lease = now + schedule.lease_interval;
            } else {
                warn!("Lease renewal failed, retrying in {:?}", schedule.retry_interval);
                next_lease = now + schedule.retry_interval;
            }
        }

        if now >= next_refresh {
            let delay = target.refresh().await;
            next_refresh = Instant::now() + delay;
        }
    }

    debug!("Lease worker stopped");
}
