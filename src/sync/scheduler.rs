//! Drives the bridge from two triggers: a fixed-interval poll and explicit
//! "tick now" notifications from store writers. Both end in the same
//! [`SyncBridge::tick`].

use crate::sync::bridge::SyncBridge;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Why the loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The page or extension context went away
    ChannelClosed,
    /// [`SyncHandle::stop`] was called
    Stopped,
}

/// Result of a finished loop; hands the bridge back to the caller
pub struct SyncOutcome {
    pub reason: StopReason,
    pub ticks: u64,
    pub bridge: SyncBridge,
}

/// Cloneable trigger for a running scheduler
#[derive(Clone, Default)]
pub struct SyncHandle {
    wake: Arc<Notify>,
    stop: Arc<Notify>,
}

impl SyncHandle {
    /// Request an immediate pass (structural-change notification)
    pub fn tick_now(&self) {
        self.wake.notify_one();
    }

    pub fn stop(&self) {
        self.stop.notify_one();
    }
}

pub struct SyncScheduler {
    interval: Duration,
    handle: SyncHandle,
}

impl SyncScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            handle: SyncHandle::default(),
        }
    }

    pub fn handle(&self) -> SyncHandle {
        self.handle.clone()
    }

    /// Run until the channel closes or a stop is requested.
    ///
    /// Store failures other than a closed channel are logged and the loop
    /// keeps going; the next pass retries.
    pub async fn run(self, mut bridge: SyncBridge) -> SyncOutcome {
        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks = 0u64;

        let reason = loop {
            tokio::select! {
                _ = self.handle.stop.notified() => break StopReason::Stopped,
                _ = timer.tick() => {}
                _ = self.handle.wake.notified() => {}
            }

            ticks += 1;
            match bridge.tick().await {
                Ok(_) => {}
                Err(e) if e.is_channel_closed() => {
                    log::info!("Bridge channel closed, stopping sync loop: {}", e);
                    break StopReason::ChannelClosed;
                }
                Err(e) => log::warn!("Sync pass failed: {}", e),
            }
        };

        SyncOutcome { reason, ticks, bridge }
    }

    /// Run on the current tokio runtime
    pub fn spawn(self, bridge: SyncBridge) -> (SyncHandle, JoinHandle<SyncOutcome>) {
        let handle = self.handle();
        (handle, tokio::spawn(self.run(bridge)))
    }
}
