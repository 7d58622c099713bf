//! Transfer engine - runs all active segment workers of one run
//!
//! Every request shares one HTTP client and one partial file. Workers are
//! multiplexed on the current task; the loop wakes at least every
//! [`POLL_INTERVAL`] to look at the cancellation flag.

use crate::engine::header::{HeaderCodec, ResumeHeader};
use crate::engine::plan::{plan_fresh, plan_resume};
use crate::engine::progress::ProgressReporter;
use crate::engine::segment_worker::{ResponseKind, SegmentWorker, StreamContext, WorkerState};
use crate::engine::shared_file::SharedFile;
use crate::error::DownloadError;
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use reqwest::{Client, Response};
use splitfetch_types::SegmentRecord;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Upper bound on how long a stop request goes unnoticed
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Segment table of one run and whether it is persisted in the partial file
#[derive(Debug, Clone)]
pub struct SegmentTable {
    pub header: ResumeHeader,
    fresh: bool,
    persist: bool,
    file_size: Option<i64>,
}

impl SegmentTable {
    /// Plan a new download. Without a known size nothing is persisted.
    pub fn fresh(file_size: Option<i64>, worker_count: u32, persist: bool) -> Self {
        let records = plan_fresh(file_size, worker_count);
        let persist = persist && records.iter().all(|r| !r.is_unbounded());

        Self {
            header: ResumeHeader::new(records),
            fresh: true,
            persist,
            file_size: file_size.filter(|size| *size > 0),
        }
    }

    /// Continue from a header read back from the partial file
    pub fn resumed(header: ResumeHeader, file_size: i64) -> Self {
        Self {
            header,
            fresh: false,
            persist: true,
            file_size: Some(file_size),
        }
    }

    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    pub fn persists(&self) -> bool {
        self.persist
    }

    pub fn file_size(&self) -> Option<i64> {
        self.file_size
    }

    pub fn records(&self) -> &[SegmentRecord] {
        &self.header.records
    }

    /// Bytes in front of the payload in the partial file
    pub fn header_size(&self) -> u64 {
        if self.persist {
            self.header.size()
        } else {
            0
        }
    }

    /// Replace the plan with one segment covering the whole resource
    fn collapse(&mut self) {
        let record = match self.file_size {
            Some(size) => SegmentRecord::new(0, size - 1),
            None => SegmentRecord::unbounded(),
        };
        self.header = ResumeHeader::new(vec![record]);
    }

    /// Sum of progress flushed in this run
    fn session_total(&self) -> i64 {
        self.header.records.iter().map(|r| r.session_downloaded).sum()
    }
}

/// How a run of the engine ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineOutcome {
    /// Every byte is on disk; `payload_len` is the final file size
    Completed { payload_len: u64 },
    /// Stopped on request, progress checkpointed
    Interrupted,
    /// Some segments failed, progress checkpointed
    Incomplete { failed: usize },
}

/// Drives the segment workers of one run
pub struct TransferEngine<'a> {
    client: &'a Client,
    url: &'a str,
    file: &'a SharedFile,
    reporter: &'a ProgressReporter,
    cancel: &'a AtomicBool,
}

impl<'a> TransferEngine<'a> {
    pub fn new(
        client: &'a Client,
        url: &'a str,
        file: &'a SharedFile,
        reporter: &'a ProgressReporter,
        cancel: &'a AtomicBool,
    ) -> Self {
        Self {
            client,
            url,
            file,
            reporter,
            cancel,
        }
    }

    /// Run all incomplete segments of `table` to completion, failure or interruption
    pub async fn run(&self, table: &mut SegmentTable) -> Result<EngineOutcome, DownloadError> {
        for record in table.header.records.iter_mut() {
            record.session_downloaded = record.committed_downloaded;
        }
        self.reporter
            .reset(table.records().iter().map(|r| r.session_downloaded).collect());

        let mut workers: Vec<SegmentWorker> = plan_resume(table.records())
            .into_iter()
            .map(|slot| {
                let start = table.records()[slot.index].start;
                SegmentWorker::new(slot.index, start, slot.resume_start, slot.end)
            })
            .collect();

        info!(
            "Starting transfer: {} of {} segments active",
            workers.len(),
            table.header.segment_count()
        );

        // Setup: wait for the response headers of every request
        let setup = {
            let requests = join_all(
                workers
                    .iter_mut()
                    .map(|worker| worker.request(self.client, self.url)),
            );
            tokio::select! {
                responses = requests => Some(responses),
                _ = cancelled(self.cancel) => None,
            }
        };
        let mut responses = match setup {
            Some(responses) => responses,
            None => {
                info!("Transfer stopped during setup");
                return Ok(EngineOutcome::Interrupted);
            }
        };

        let accepted = match take_ignored_first(table, &workers, &mut responses) {
            Some(response) => {
                info!("Server ignored the range request, collapsing to a single connection");
                table.collapse();
                let end = table.records()[0].end;
                workers = vec![SegmentWorker::new(0, 0, 0, end)];
                self.reporter.reset(vec![0]);
                vec![Some(response)]
            }
            None => self.accept_responses(&mut workers, responses)?,
        };

        if table.is_fresh() && table.persists() {
            HeaderCodec::write(&mut *self.file.lock(), &table.header)?;
        }
        self.file.set_payload_offset(table.header_size());
        if let (true, Some(size)) = (table.is_fresh(), table.file_size()) {
            self.file.lock().set_len(table.header_size() + size as u64)?;
        }

        // Streaming
        let ctx = StreamContext {
            file: self.file,
            reporter: self.reporter,
        };
        let mut pending: FuturesUnordered<_> = workers
            .iter_mut()
            .zip(accepted)
            .filter_map(|(worker, response)| response.map(|response| (worker, response)))
            .map(|(worker, response)| async move {
                let result = worker.stream(response, ctx).await;
                (worker.index(), result)
            })
            .collect();

        let mut interrupted = false;
        let mut fatal: Option<DownloadError> = None;
        loop {
            if self.cancel.load(Ordering::Acquire) {
                interrupted = true;
                break;
            }

            match tokio::time::timeout(POLL_INTERVAL, pending.next()).await {
                Ok(Some((index, Ok(())))) => debug!("Segment {} finished", index),
                Ok(Some((index, Err(DownloadError::Io(e))))) => {
                    error!("Segment {} could not write to the partial file: {}", index, e);
                    fatal = Some(DownloadError::Io(e));
                    break;
                }
                Ok(Some((index, Err(e)))) => warn!("Segment {} failed: {}", index, e),
                Ok(None) => break,
                Err(_) => continue,
            }
        }
        drop(pending);

        for worker in workers.iter_mut() {
            if let Err(e) = worker.flush(self.file) {
                error!("Failed to flush segment {}: {}", worker.index(), e);
                fatal.get_or_insert(DownloadError::Io(e));
            }
            let record = &mut table.header.records[worker.index()];
            record.session_downloaded = record.committed_downloaded.max(worker.flushed_progress());
        }

        let all_complete = workers.iter().all(|w| w.state() == WorkerState::Complete);
        let size_reached = table.file_size() == Some(table.session_total());
        if fatal.is_none() && !interrupted && (all_complete || size_reached) {
            let payload_len = table.file_size().unwrap_or_else(|| table.session_total());
            self.reporter.finish(payload_len);
            info!("Transfer complete: {} bytes", payload_len);
            return Ok(EngineOutcome::Completed {
                payload_len: payload_len as u64,
            });
        }

        if table.persists() {
            if let Err(e) = HeaderCodec::update(&mut *self.file.lock(), &mut table.header) {
                error!("Checkpoint failed: {}", e);
                fatal.get_or_insert(DownloadError::Io(e));
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }
        if interrupted {
            info!("Transfer stopped, {} bytes on disk", table.session_total());
            return Ok(EngineOutcome::Interrupted);
        }

        let failed = workers
            .iter()
            .filter(|w| w.state() != WorkerState::Complete)
            .count();
        Ok(EngineOutcome::Incomplete { failed })
    }

    /// Sort setup responses into streams to run; failed requests mark their worker failed
    fn accept_responses(
        &self,
        workers: &mut [SegmentWorker],
        responses: Vec<Result<Response, DownloadError>>,
    ) -> Result<Vec<Option<Response>>, DownloadError> {
        let mut accepted = Vec::with_capacity(responses.len());

        for (worker, result) in workers.iter_mut().zip(responses) {
            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    warn!("Segment {} request failed: {}", worker.index(), e);
                    accepted.push(None);
                    continue;
                }
            };

            match worker.classify(response.status()) {
                ResponseKind::Accepted => accepted.push(Some(response)),
                ResponseKind::RangeIgnored => {
                    error!("Segment {} got the whole file instead of its range", worker.index());
                    return Err(worker.fail(DownloadError::RangeUnsupported(worker.index())));
                }
                ResponseKind::Rejected(status) => {
                    warn!("Segment {} rejected with status {}", worker.index(), status);
                    worker.fail(DownloadError::Server { status });
                    accepted.push(None);
                }
            }
        }

        Ok(accepted)
    }
}

/// Resolves once `flag` is set, checking every [`POLL_INTERVAL`]
pub async fn cancelled(flag: &AtomicBool) {
    while !flag.load(Ordering::Acquire) {
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// The whole-file response to segment 0 of a fresh run, if the server ignored its range
fn take_ignored_first(
    table: &SegmentTable,
    workers: &[SegmentWorker],
    responses: &mut Vec<Result<Response, DownloadError>>,
) -> Option<Response> {
    if !table.is_fresh() {
        return None;
    }
    match (workers.first(), responses.first()) {
        (Some(worker), Some(Ok(response)))
            if worker.index() == 0
                && worker.classify(response.status()) == ResponseKind::RangeIgnored => {}
        _ => return None,
    }
    responses.swap_remove(0).ok()
}
