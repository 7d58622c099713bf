//! Download job - public entry point for one resumable transfer
//!
//! A job owns its configuration and runs each transfer on a dedicated
//! background thread with its own single-threaded Tokio runtime. The caller
//! only starts, stops, waits and reads snapshots.

use crate::config::validate_config;
use crate::engine::{
    cancelled, EngineOutcome, HeaderCodec, ProgressCounters, ProgressReporter, SegmentTable,
    SharedFile, TransferEngine,
};
use crate::error::DownloadError;
use crate::hash::verify_file_hash;
use crate::naming::{partial_path, unique_destination};
use crate::observer::{notify_status, NoopObserver, TransferObserver};
use crate::probe::{build_client, probe_size};
use parking_lot::{Mutex, RwLock};
use splitfetch_types::{ProgressSnapshot, TransferConfig, TransferState};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;
use tracing::{error, info, warn};

/// State shared between the job handle and its background thread
struct JobShared {
    config: TransferConfig,
    observer: Arc<dyn TransferObserver>,
    state: RwLock<TransferState>,
    cancel: AtomicBool,
    progress: Arc<ProgressCounters>,
    output_path: Mutex<Option<PathBuf>>,
    /// Thread executing the current run, which also runs the observer callbacks
    runner: Mutex<Option<ThreadId>>,
}

impl JobShared {
    fn on_runner_thread(&self) -> bool {
        *self.runner.lock() == Some(thread::current().id())
    }
}

/// A single download that can be started, stopped and resumed
pub struct DownloadJob {
    shared: Arc<JobShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DownloadJob {
    pub fn new(config: TransferConfig) -> Self {
        Self::with_observer(config, Arc::new(NoopObserver))
    }

    /// Create a job whose status and progress are reported to `observer`
    pub fn with_observer(config: TransferConfig, observer: Arc<dyn TransferObserver>) -> Self {
        Self {
            shared: Arc::new(JobShared {
                config,
                observer,
                state: RwLock::new(TransferState::Ready),
                cancel: AtomicBool::new(false),
                progress: Arc::new(ProgressCounters::default()),
                output_path: Mutex::new(None),
                runner: Mutex::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.shared.config
    }

    /// Start a run in the background.
    ///
    /// Only configuration errors and `AlreadyRunning` are returned here;
    /// everything else is reported through the status callback.
    pub fn start(&self) -> Result<(), DownloadError> {
        validate_config(&self.shared.config)?;
        if self.shared.on_runner_thread() {
            warn!(
                "{} cannot be restarted from its own callbacks",
                self.shared.config.file_name()
            );
            return Err(DownloadError::AlreadyRunning);
        }

        let mut worker = self.worker.lock();
        {
            let mut state = self.shared.state.write();
            if *state == TransferState::Running {
                warn!("{} is already running", self.shared.config.file_name());
                return Err(DownloadError::AlreadyRunning);
            }
            *state = TransferState::Running;
        }

        // The previous run has already published its final state
        if let Some(handle) = worker.take() {
            let _ = handle.join();
        }

        self.shared.cancel.store(false, Ordering::Release);
        self.shared.progress.reset();
        *self.shared.output_path.lock() = None;

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(format!("splitfetch-{}", self.shared.config.file_name()))
            .spawn(move || run_job(shared));

        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                error!("Failed to spawn transfer thread: {}", e);
                *self.shared.state.write() = TransferState::Failed;
                Err(e.into())
            }
        }
    }

    /// Ask the running transfer to stop and wait for it. Safe to call repeatedly
    /// and from any thread. Called from an observer callback it only requests
    /// the stop; the run ends after the callback returns.
    pub fn stop(&self) {
        self.shared.cancel.store(true, Ordering::Release);
        if self.shared.on_runner_thread() {
            return;
        }

        let mut worker = self.worker.lock();
        // A concurrent start may have cleared the flag before we got the lock
        self.shared.cancel.store(true, Ordering::Release);
        self.join_locked(&mut worker);
    }

    /// Wait for the current run to end on its own. Returns at once when
    /// called from an observer callback.
    pub fn wait(&self) {
        if self.shared.on_runner_thread() {
            return;
        }
        let mut worker = self.worker.lock();
        self.join_locked(&mut worker);
    }

    fn join_locked(&self, worker: &mut Option<JoinHandle<()>>) {
        if let Some(handle) = worker.take() {
            if handle.join().is_err() {
                error!("Transfer thread of {} panicked", self.shared.config.file_name());
                *self.shared.state.write() = TransferState::Failed;
            }
        }
    }

    pub fn state(&self) -> TransferState {
        *self.shared.state.read()
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.shared.progress.snapshot()
    }

    /// Path of the finished file, once a run has produced one
    pub fn output_path(&self) -> Option<PathBuf> {
        self.shared.output_path.lock().clone()
    }
}

impl Drop for DownloadJob {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_job(shared: Arc<JobShared>) {
    *shared.runner.lock() = Some(thread::current().id());
    let started = Instant::now();
    let name = shared.config.file_name();
    info!("Starting download of {} from {}", name, shared.config.url);
    notify_status(shared.observer.as_ref(), &name, TransferState::Running, "", 0);

    let result = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(DownloadError::from)
        .and_then(|runtime| runtime.block_on(run_transfer(&shared)));

    let (state, reason) = match result {
        Ok(EngineOutcome::Completed { .. }) => {
            info!("Download of {} finished", name);
            (TransferState::Finished, String::new())
        }
        Ok(EngineOutcome::Interrupted) => {
            info!("Download of {} stopped, resumable", name);
            (TransferState::Ready, String::new())
        }
        Ok(EngineOutcome::Incomplete { failed }) => {
            warn!("Download of {} incomplete: {} segment(s) failed", name, failed);
            (TransferState::Failed, format!("{} segment(s) failed", failed))
        }
        Err(e) => {
            error!("Download of {} failed: {}", name, e);
            (TransferState::Failed, String::from(e))
        }
    };

    *shared.state.write() = state;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    notify_status(shared.observer.as_ref(), &name, state, &reason, elapsed_ms);
}

async fn run_transfer(shared: &JobShared) -> Result<EngineOutcome, DownloadError> {
    let config = &shared.config;
    let client = build_client(config)?;

    let file_size = tokio::select! {
        size = probe_size(&client, &config.url) => size,
        _ = cancelled(&shared.cancel) => return Ok(EngineOutcome::Interrupted),
    };

    let resume = config.resume && file_size.is_some();
    if config.resume && !resume {
        info!("Resume disabled for {}: remote size unknown", config.file_name());
    }

    fs::create_dir_all(&config.directory)?;
    let partial = partial_path(config, file_size, resume);
    info!("Partial file: {}", partial.display());

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&partial)?;

    let mut table = match file_size {
        Some(size) if resume => load_table(&mut file, size, config.worker_count),
        _ => SegmentTable::fresh(file_size, config.worker_count, resume),
    };

    let shared_file = SharedFile::new(file);
    let reporter = ProgressReporter::new(
        config.file_name(),
        table.file_size(),
        config.progress_interval(),
        shared.progress.clone(),
        shared.observer.clone(),
    );
    let engine = TransferEngine::new(&client, &config.url, &shared_file, &reporter, &shared.cancel);
    let outcome = engine.run(&mut table).await?;

    if let EngineOutcome::Completed { payload_len } = outcome {
        let file = shared_file.into_inner();
        let destination = finalize(file, &partial, table.header_size(), payload_len, config)?;
        *shared.output_path.lock() = Some(destination.clone());

        if let Some(expected) = &config.expected_hash {
            verify_file_hash(&destination, expected)?;
        }
    }

    Ok(outcome)
}

/// Adopt the header of an existing partial file, or plan from scratch
fn load_table(file: &mut File, file_size: i64, worker_count: u32) -> SegmentTable {
    let existing = file.metadata().map(|m| m.len()).unwrap_or(0);
    if existing > 0 {
        match HeaderCodec::read(file) {
            Ok(header) if header.covers(file_size) => {
                let committed: i64 = header.records.iter().map(|r| r.committed_downloaded).sum();
                info!(
                    "Resuming with {} segments, {} of {} bytes on disk",
                    header.segment_count(),
                    committed,
                    file_size
                );
                return SegmentTable::resumed(header, file_size);
            }
            Ok(_) => warn!("Resume header does not describe {} bytes, starting over", file_size),
            Err(e) => warn!("Discarding resume header: {}", e),
        }
    }

    SegmentTable::fresh(Some(file_size), worker_count, true)
}

/// Move the payload out of the partial file into a free destination name
fn finalize(
    mut file: File,
    partial: &Path,
    header_size: u64,
    payload_len: u64,
    config: &TransferConfig,
) -> Result<PathBuf, DownloadError> {
    file.set_len(header_size + payload_len)?;
    let destination = unique_destination(&config.directory, &config.base_name, &config.extension);

    if header_size == 0 {
        drop(file);
        fs::rename(partial, &destination)?;
    } else {
        file.seek(SeekFrom::Start(header_size))?;
        let mut output = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&destination)?;
        let copied = io::copy(&mut file.by_ref().take(payload_len), &mut output)?;
        if copied != payload_len {
            return Err(DownloadError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("copied {} of {} bytes", copied, payload_len),
            )));
        }
        output.sync_all()?;

        drop(file);
        fs::remove_file(partial)?;
    }

    info!("Saved {} ({} bytes)", destination.display(), payload_len);
    Ok(destination)
}

#[cfg(test)]
mod tests {
    use super::*;
    use splitfetch_types::SegmentRecord;
    use std::io::Write;

    #[test]
    fn test_start_rejects_invalid_config() {
        let job = DownloadJob::new(TransferConfig::default());
        assert!(matches!(job.start(), Err(DownloadError::Config(_))));
        assert_eq!(job.state(), TransferState::Ready);
    }

    #[test]
    fn test_stop_without_start_is_noop() {
        let job = DownloadJob::new(TransferConfig::new("http://127.0.0.1:9/a.bin", "/tmp"));
        job.stop();
        job.stop();
        assert_eq!(job.state(), TransferState::Ready);
        assert_eq!(job.output_path(), None);
    }

    /// Accepts connections and never answers them
    fn silent_server() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/slow.bin", listener.local_addr().unwrap());
        thread::spawn(move || {
            let mut held = Vec::new();
            for stream in listener.incoming().flatten() {
                held.push(stream);
            }
        });
        url
    }

    #[test]
    fn test_stop_interrupts_size_query() {
        let dir = tempfile::tempdir().unwrap();
        let job = DownloadJob::new(TransferConfig::new(silent_server(), dir.path()));
        job.start().unwrap();

        let stopping = Instant::now();
        job.stop();
        assert!(stopping.elapsed() < std::time::Duration::from_secs(3));
        assert_eq!(job.state(), TransferState::Ready);
    }

    #[test]
    fn test_stop_is_not_undone_by_concurrent_start() {
        let dir = tempfile::tempdir().unwrap();
        let job = DownloadJob::new(TransferConfig::new(silent_server(), dir.path()));
        job.start().unwrap();

        let elapsed = thread::scope(|scope| {
            // Hold the handle lock the way a concurrent start does
            let worker = job.worker.lock();
            let stopper = scope.spawn(|| {
                let stopping = Instant::now();
                job.stop();
                stopping.elapsed()
            });
            thread::sleep(std::time::Duration::from_millis(100));
            job.shared.cancel.store(false, Ordering::Release);
            drop(worker);
            stopper.join().unwrap()
        });

        assert!(elapsed < std::time::Duration::from_secs(3));
        assert_eq!(job.state(), TransferState::Ready);
    }

    #[test]
    fn test_load_table_falls_back_to_fresh_plan() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"garbage that is not a header at all").unwrap();

        let table = load_table(&mut file, 1000, 4);
        assert!(table.is_fresh());
        assert_eq!(table.records().len(), 4);
    }

    #[test]
    fn test_load_table_rejects_header_for_other_size() {
        let header = crate::engine::ResumeHeader::new(vec![SegmentRecord::new(0, 499)]);
        let mut file = tempfile::tempfile().unwrap();
        HeaderCodec::write(&mut file, &header).unwrap();

        assert!(load_table(&mut file, 1000, 2).is_fresh());
        assert!(!load_table(&mut file, 500, 2).is_fresh());
    }

    #[test]
    fn test_finalize_strips_header() {
        let dir = tempfile::tempdir().unwrap();
        let config = TransferConfig::new("http://host/out.bin", dir.path());
        let partial = dir.path().join("out.bin.4.part");
        fs::write(&partial, b"HEADERpayl").unwrap();
        let file = OpenOptions::new().read(true).write(true).open(&partial).unwrap();

        let destination = finalize(file, &partial, 6, 4, &config).unwrap();
        assert_eq!(destination, dir.path().join("out.bin"));
        assert_eq!(fs::read(&destination).unwrap(), b"payl");
        assert!(!partial.exists());
    }
}
