//! Segment worker - downloads a single byte range into the shared partial file
//!
//! Received bytes are buffered and flushed to `header_size + offset` of the
//! partial file whenever the buffer would overflow, and once more when the
//! response ends.

use crate::engine::progress::ProgressReporter;
use crate::engine::shared_file::SharedFile;
use crate::error::DownloadError;
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};
use std::io;
use tracing::{debug, info, warn};

/// Initial write buffer size per worker
pub const INITIAL_BUFFER_SIZE: usize = 100 * 1024;

/// Lifecycle of a segment worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Requesting,
    Streaming,
    Complete,
    Failed,
}

/// How a response relates to the request that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// 206, or 200 for a request without a range
    Accepted,
    /// 200 for a ranged request: the server sent the whole file
    RangeIgnored,
    Rejected(u16),
}

/// Shared resources a worker streams into
#[derive(Clone, Copy)]
pub struct StreamContext<'a> {
    pub file: &'a SharedFile,
    pub reporter: &'a ProgressReporter,
}

/// Downloads one segment of the segment table
#[derive(Debug)]
pub struct SegmentWorker {
    /// Index into the segment table
    index: usize,
    /// Segment start
    start: i64,
    /// First byte requested in this run
    resume_start: i64,
    /// Last byte of the segment, `UNBOUNDED_END` when unknown
    end: i64,
    state: WorkerState,
    buffer: Vec<u8>,
    capacity: usize,
    /// Bytes flushed to disk in this run
    written: i64,
    /// Bytes received in this run, flushed or not
    received: i64,
    /// Bytes the response is expected to carry
    expected: Option<i64>,
}

impl SegmentWorker {
    pub fn new(index: usize, start: i64, resume_start: i64, end: i64) -> Self {
        Self {
            index,
            start,
            resume_start,
            end,
            state: WorkerState::Idle,
            buffer: Vec::with_capacity(INITIAL_BUFFER_SIZE),
            capacity: INITIAL_BUFFER_SIZE,
            written: 0,
            received: 0,
            expected: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_unbounded(&self) -> bool {
        self.end == splitfetch_types::UNBOUNDED_END
    }

    /// Progress from the segment start including buffered bytes
    pub fn progress(&self) -> i64 {
        self.resume_start - self.start + self.received
    }

    /// Progress from the segment start that is safely on disk
    pub fn flushed_progress(&self) -> i64 {
        self.resume_start - self.start + self.written
    }

    /// Full segment length when known
    fn segment_len(&self) -> Option<i64> {
        if self.is_unbounded() {
            self.expected.map(|expected| self.resume_start - self.start + expected)
        } else {
            Some(self.end - self.start + 1)
        }
    }

    /// Value of the `Range` header, `None` for a plain GET
    pub fn range_header(&self) -> Option<String> {
        if self.is_unbounded() {
            if self.resume_start == 0 {
                None
            } else {
                Some(format!("bytes={}-", self.resume_start))
            }
        } else {
            Some(format!("bytes={}-{}", self.resume_start, self.end))
        }
    }

    /// Send the request for this segment and wait for the response headers
    pub async fn request(&mut self, client: &Client, url: &str) -> Result<Response, DownloadError> {
        self.state = WorkerState::Requesting;

        let mut request = client.get(url);
        if let Some(range) = self.range_header() {
            debug!("Segment {} requesting range: {}", self.index, range);
            request = request.header(reqwest::header::RANGE, range);
        }

        match request.send().await {
            Ok(response) => Ok(response),
            Err(e) => Err(self.fail(e.into())),
        }
    }

    pub fn classify(&self, status: StatusCode) -> ResponseKind {
        match status {
            StatusCode::PARTIAL_CONTENT => ResponseKind::Accepted,
            StatusCode::OK if self.range_header().is_none() => ResponseKind::Accepted,
            StatusCode::OK => ResponseKind::RangeIgnored,
            other => ResponseKind::Rejected(other.as_u16()),
        }
    }

    /// Mark the worker failed and hand the error back
    pub fn fail(&mut self, error: DownloadError) -> DownloadError {
        self.state = WorkerState::Failed;
        error
    }

    /// Stream the response body into the partial file
    pub async fn stream(
        &mut self,
        response: Response,
        ctx: StreamContext<'_>,
    ) -> Result<(), DownloadError> {
        self.state = WorkerState::Streaming;
        self.expected = if self.is_unbounded() {
            response.content_length().map(|len| len as i64)
        } else {
            Some(self.end - self.resume_start + 1)
        };

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!("Segment {} transport error: {}", self.index, e);
                    return Err(self.fail(e.into()));
                }
            };

            // Never write past the segment into a neighbour's range
            let data = match (self.is_unbounded(), self.expected) {
                (false, Some(expected)) => {
                    let remaining = (expected - self.received).max(0) as usize;
                    &chunk[..chunk.len().min(remaining)]
                }
                _ => &chunk[..],
            };

            if let Err(e) = self.push(data, ctx.file) {
                return Err(self.fail(e.into()));
            }
            ctx.reporter.segment_progress(self.index, self.progress(), self.segment_len());
        }

        if let Err(e) = self.flush(ctx.file) {
            return Err(self.fail(e.into()));
        }

        if let (false, Some(expected)) = (self.is_unbounded(), self.expected) {
            if self.received < expected {
                warn!(
                    "Segment {} ended early: {} of {} bytes",
                    self.index, self.received, expected
                );
                return Err(self.fail(DownloadError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "segment {} ended after {} of {} bytes",
                        self.index, self.received, expected
                    ),
                ))));
            }
        }

        self.state = WorkerState::Complete;
        info!(
            "Segment {} complete ({} bytes this run)",
            self.index, self.written
        );
        Ok(())
    }

    /// Buffer a received chunk, flushing first if it would not fit
    pub fn push(&mut self, data: &[u8], file: &SharedFile) -> io::Result<()> {
        if self.buffer.len() + data.len() > self.capacity {
            self.flush(file)?;

            if data.len() > self.capacity {
                self.capacity = data.len() + data.len() / 2;
                self.buffer = Vec::with_capacity(self.capacity);
                debug!("Segment {} buffer size: {}", self.index, self.capacity);
            }
        }

        self.buffer.extend_from_slice(data);
        self.received += data.len() as i64;
        Ok(())
    }

    /// Write buffered bytes to their place in the partial file
    pub fn flush(&mut self, file: &SharedFile) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let position = (self.resume_start + self.written) as u64;
        file.write_payload(position, &self.buffer)?;
        self.written += self.buffer.len() as i64;
        self.buffer.clear();
        Ok(())
    }
}
