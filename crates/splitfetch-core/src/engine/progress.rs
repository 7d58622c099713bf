//! Progress aggregation across segments

use crate::observer::{notify_progress, TransferObserver};
use parking_lot::Mutex;
use splitfetch_types::ProgressSnapshot;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Job-wide counters readable from any thread
#[derive(Debug, Default)]
pub struct ProgressCounters {
    total: AtomicI64,
    transferred: AtomicI64,
}

impl ProgressCounters {
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total.load(Ordering::Acquire),
            transferred: self.transferred.load(Ordering::Acquire),
        }
    }

    pub fn reset(&self) {
        self.total.store(0, Ordering::Release);
        self.transferred.store(0, Ordering::Release);
    }
}

/// Decides when a progress callback may fire
#[derive(Debug)]
struct Throttle {
    interval: Duration,
    last_emit: Option<Instant>,
    last_transferred: i64,
}

impl Throttle {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
            last_transferred: -1,
        }
    }

    /// Unchanged values never fire; the final update always does
    fn should_emit(&mut self, total: i64, transferred: i64, now: Instant) -> bool {
        if transferred == self.last_transferred {
            return false;
        }

        let due = self
            .last_emit
            .map_or(true, |last| now.duration_since(last) >= self.interval);
        let finished = total > 0 && total == transferred;

        if due || finished {
            self.last_emit = Some(now);
            self.last_transferred = transferred;
            true
        } else {
            false
        }
    }
}

/// Collects per-segment progress from the workers of one run and reports
/// the total to the job counters and the observer
pub struct ProgressReporter {
    name: String,
    segments: Mutex<Vec<i64>>,
    throttle: Mutex<Throttle>,
    counters: Arc<ProgressCounters>,
    observer: Arc<dyn TransferObserver>,
}

impl ProgressReporter {
    pub fn new(
        name: String,
        file_size: Option<i64>,
        interval: Duration,
        counters: Arc<ProgressCounters>,
        observer: Arc<dyn TransferObserver>,
    ) -> Self {
        counters.total.store(file_size.unwrap_or(0), Ordering::Release);

        Self {
            name,
            segments: Mutex::new(Vec::new()),
            throttle: Mutex::new(Throttle::new(interval)),
            counters,
            observer,
        }
    }

    /// Start a run with the given per-segment progress, measured from each segment's start
    pub fn reset(&self, initial: Vec<i64>) {
        let transferred = initial.iter().sum();
        *self.segments.lock() = initial;
        self.counters.transferred.store(transferred, Ordering::Release);
    }

    /// Record cumulative progress of one segment.
    ///
    /// `expected` is the segment's full length when known; for a single
    /// segment of unknown size it also becomes the job total.
    pub fn segment_progress(&self, index: usize, progress: i64, expected: Option<i64>) {
        let transferred = {
            let mut segments = self.segments.lock();
            if let Some(slot) = segments.get_mut(index) {
                *slot = progress;
            }
            if segments.len() == 1 && self.counters.total.load(Ordering::Acquire) == 0 {
                if let Some(expected) = expected {
                    self.counters.total.store(expected, Ordering::Release);
                }
            }
            segments.iter().sum::<i64>()
        };
        self.counters.transferred.store(transferred, Ordering::Release);

        let total = self.counters.total.load(Ordering::Acquire);
        if self.throttle.lock().should_emit(total, transferred, Instant::now()) {
            notify_progress(self.observer.as_ref(), &self.name, total, transferred);
        }
    }

    /// Report the final size once every byte is on disk
    pub fn finish(&self, total: i64) {
        self.counters.total.store(total, Ordering::Release);
        self.counters.transferred.store(total, Ordering::Release);

        if self.throttle.lock().should_emit(total, total, Instant::now()) {
            notify_progress(self.observer.as_ref(), &self.name, total, total);
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.counters.snapshot()
    }
}
