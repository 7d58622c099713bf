//! Status and progress callbacks
//!
//! Callbacks run on the job's background thread. Whatever they return or
//! raise is logged and dropped; the transfer never sees it.

use chrono::Utc;
use splitfetch_types::{TransferEvent, TransferState};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::sync::broadcast;
use tracing::warn;

/// Receives job status changes and throttled progress updates
pub trait TransferObserver: Send + Sync {
    fn on_status(
        &self,
        _name: &str,
        _state: TransferState,
        _reason: &str,
        _elapsed_ms: u64,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// `total` is 0 while the file size is unknown
    fn on_progress(&self, _name: &str, _total: i64, _transferred: i64) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Observer that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl TransferObserver for NoopObserver {}

/// Observer that republishes callbacks as [`TransferEvent`]s
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    event_tx: broadcast::Sender<TransferEvent>,
}

impl ChannelObserver {
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity);
        Self { event_tx }
    }

    /// Subscribe to transfer events
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.event_tx.subscribe()
    }
}

impl TransferObserver for ChannelObserver {
    fn on_status(
        &self,
        name: &str,
        state: TransferState,
        reason: &str,
        elapsed_ms: u64,
    ) -> anyhow::Result<()> {
        let _ = self.event_tx.send(TransferEvent::StatusChanged {
            name: name.to_string(),
            state,
            reason: reason.to_string(),
            elapsed_ms,
            at: Utc::now(),
        });
        Ok(())
    }

    fn on_progress(&self, name: &str, total: i64, transferred: i64) -> anyhow::Result<()> {
        let _ = self.event_tx.send(TransferEvent::Progress {
            name: name.to_string(),
            total,
            transferred,
        });
        Ok(())
    }
}

pub(crate) fn notify_status(
    observer: &dyn TransferObserver,
    name: &str,
    state: TransferState,
    reason: &str,
    elapsed_ms: u64,
) {
    guarded("status", || observer.on_status(name, state, reason, elapsed_ms));
}

pub(crate) fn notify_progress(
    observer: &dyn TransferObserver,
    name: &str,
    total: i64,
    transferred: i64,
) {
    guarded("progress", || observer.on_progress(name, total, transferred));
}

fn guarded(kind: &str, callback: impl FnOnce() -> anyhow::Result<()>) {
    match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("{} callback failed: {:#}", kind, e),
        Err(_) => warn!("{} callback panicked", kind),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    impl TransferObserver for Failing {
        fn on_status(&self, _: &str, _: TransferState, _: &str, _: u64) -> anyhow::Result<()> {
            anyhow::bail!("observer is broken")
        }

        fn on_progress(&self, _: &str, _: i64, _: i64) -> anyhow::Result<()> {
            panic!("observer exploded")
        }
    }

    #[test]
    fn test_callback_failures_are_swallowed() {
        notify_status(&Failing, "file.bin", TransferState::Running, "", 0);
        notify_progress(&Failing, "file.bin", 10, 5);
    }

    #[test]
    fn test_channel_observer_publishes_events() {
        let observer = ChannelObserver::new(16);
        let mut rx = observer.subscribe();

        notify_progress(&observer, "file.bin", 100, 40);
        notify_status(&observer, "file.bin", TransferState::Finished, "", 1500);

        match rx.try_recv().unwrap() {
            TransferEvent::Progress { total, transferred, .. } => {
                assert_eq!((total, transferred), (100, 40));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.try_recv().unwrap() {
            TransferEvent::StatusChanged { state, elapsed_ms, .. } => {
                assert_eq!(state, TransferState::Finished);
                assert_eq!(elapsed_ms, 1500);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
