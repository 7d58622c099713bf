//! Shared types for splitfetch
//!
//! This crate contains the plain data structures exchanged between the
//! download engine and whoever drives it: configuration, job state,
//! per-segment records and progress events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for one download job. Immutable for the duration of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Source URL (http or https)
    pub url: String,
    /// Directory that receives the partial file and the finished file
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    /// File name without extension
    pub base_name: String,
    /// Extension including the leading dot (e.g. ".zip"), may be empty
    #[serde(default)]
    pub extension: String,
    /// Number of concurrent range requests
    #[serde(default = "default_worker_count")]
    pub worker_count: u32,
    /// Keep a resume header in the partial file so an interrupted run can continue
    #[serde(default = "default_resume")]
    pub resume: bool,
    /// Expected MD5 (32 hex digits) or SHA-256 (64 hex digits), case-insensitive
    #[serde(default)]
    pub expected_hash: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Maximum idle time between two reads of a response body
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// PEM bundle with extra root certificates
    #[serde(default)]
    pub ca_bundle: Option<PathBuf>,
    /// Minimum time between two progress callbacks
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

fn default_directory() -> PathBuf {
    dirs::download_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_worker_count() -> u32 {
    4
}

fn default_resume() -> bool {
    true
}

fn default_connect_timeout_ms() -> u64 {
    3_000
}

fn default_read_timeout_ms() -> u64 {
    30_000
}

fn default_progress_interval_ms() -> u64 {
    500
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            directory: default_directory(),
            base_name: String::new(),
            extension: String::new(),
            worker_count: default_worker_count(),
            resume: default_resume(),
            expected_hash: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            ca_bundle: None,
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

impl TransferConfig {
    /// Create a config for `url`, naming the output after the URL's last path segment
    pub fn new(url: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        let url = url.into();
        let (base_name, extension) = split_file_name(&file_name_from_url(&url));

        Self {
            url,
            directory: directory.into(),
            base_name,
            extension,
            ..Self::default()
        }
    }

    pub fn with_workers(mut self, worker_count: u32) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_expected_hash(mut self, hash: impl Into<String>) -> Self {
        self.expected_hash = Some(hash.into());
        self
    }

    pub fn with_name(mut self, base_name: impl Into<String>, extension: impl Into<String>) -> Self {
        self.base_name = base_name.into();
        self.extension = extension.into();
        self
    }

    /// Full target file name (`base_name` + `extension`)
    pub fn file_name(&self) -> String {
        format!("{}{}", self.base_name, self.extension)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

/// Derive a file name from the last non-empty path segment of a URL
pub fn file_name_from_url(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
                .map(|s| {
                    urlencoding::decode(s)
                        .map(|decoded| decoded.into_owned())
                        .unwrap_or_else(|_| s.to_string())
                })
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "download".to_string())
}

/// Split `archive.tar.gz` into (`archive.tar`, `.gz`). Dotfiles keep their name.
pub fn split_file_name(name: &str) -> (String, String) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => (name[..pos].to_string(), name[pos..].to_string()),
        _ => (name.to_string(), String::new()),
    }
}

// ============================================================================
// Job State
// ============================================================================

/// Lifecycle state of a download job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    /// Idle; a previous run may have left a resumable partial file
    #[default]
    Ready,
    Running,
    Finished,
    Failed,
}

// ============================================================================
// Segment Types
// ============================================================================

/// `end` value of a segment whose length is unknown
pub const UNBOUNDED_END: i64 = i64::MAX;

/// One byte range of the target file and its download progress.
///
/// `committed_downloaded` is the progress recorded by the last checkpoint;
/// `session_downloaded` is the progress flushed to disk so far, measured
/// from `start`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub start: i64,
    pub end: i64,
    pub committed_downloaded: i64,
    pub session_downloaded: i64,
}

impl SegmentRecord {
    pub fn new(start: i64, end: i64) -> Self {
        Self {
            start,
            end,
            committed_downloaded: 0,
            session_downloaded: 0,
        }
    }

    /// A single segment covering a resource of unknown length
    pub fn unbounded() -> Self {
        Self::new(0, UNBOUNDED_END)
    }

    pub fn is_unbounded(&self) -> bool {
        self.end == UNBOUNDED_END
    }

    /// Number of bytes in the range, `None` when unbounded
    pub fn len(&self) -> Option<i64> {
        if self.is_unbounded() {
            None
        } else {
            Some(self.end - self.start + 1)
        }
    }

    /// Check the on-disk invariant `0 <= start <= end`, `0 <= committed`,
    /// `start + committed <= end + 1`
    pub fn is_valid(&self) -> bool {
        self.start >= 0
            && self.start <= self.end
            && self.committed_downloaded >= 0
            && self
                .start
                .checked_add(self.committed_downloaded)
                .map_or(false, |reached| reached <= self.end.saturating_add(1))
    }

    /// Whether the last checkpoint recorded the whole range as downloaded
    pub fn is_complete(&self) -> bool {
        self.len() == Some(self.committed_downloaded)
    }
}

// ============================================================================
// Progress & Events
// ============================================================================

/// Aggregated progress of a job. `total` is 0 while the size is unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub total: i64,
    pub transferred: i64,
}

impl ProgressSnapshot {
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.total == self.transferred
    }

    pub fn percent(&self) -> f64 {
        if self.total > 0 {
            (self.transferred as f64 / self.total as f64) * 100.0
        } else {
            0.0
        }
    }
}

/// Events emitted by a job to its observers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum TransferEvent {
    Progress {
        name: String,
        total: i64,
        transferred: i64,
    },
    StatusChanged {
        name: String,
        state: TransferState,
        reason: String,
        elapsed_ms: u64,
        at: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(file_name_from_url("https://example.com/files/setup%20v2.exe"), "setup v2.exe");
        assert_eq!(file_name_from_url("https://example.com/dir/"), "dir");
        assert_eq!(file_name_from_url("https://example.com"), "download");
        assert_eq!(file_name_from_url("not a url"), "download");
    }

    #[test]
    fn test_split_file_name() {
        assert_eq!(split_file_name("archive.tar.gz"), ("archive.tar".into(), ".gz".into()));
        assert_eq!(split_file_name("README"), ("README".into(), String::new()));
        assert_eq!(split_file_name(".bashrc"), (".bashrc".into(), String::new()));
    }

    #[test]
    fn test_config_new_derives_name() {
        let config = TransferConfig::new("http://host/pkg/tool-1.2.zip", "/tmp/dl");
        assert_eq!(config.base_name, "tool-1.2");
        assert_eq!(config.extension, ".zip");
        assert_eq!(config.file_name(), "tool-1.2.zip");
        assert_eq!(config.worker_count, 4);
        assert!(config.resume);
    }

    #[test]
    fn test_config_deserialize_defaults() {
        let config: TransferConfig = serde_json::from_str(
            r#"{"url": "http://host/a.bin", "directory": "/tmp", "base_name": "a"}"#,
        )
        .unwrap();
        assert_eq!(config.extension, "");
        assert_eq!(config.progress_interval_ms, 500);
        assert_eq!(config.read_timeout(), Duration::from_secs(30));
        assert!(config.expected_hash.is_none());
    }

    fn with_committed(start: i64, end: i64, committed: i64) -> SegmentRecord {
        SegmentRecord {
            committed_downloaded: committed,
            ..SegmentRecord::new(start, end)
        }
    }

    #[test]
    fn test_segment_record_validity() {
        assert!(SegmentRecord::new(0, 99).is_valid());
        assert!(with_committed(0, 99, 100).is_valid());
        assert!(!with_committed(0, 99, 101).is_valid());
        assert!(!SegmentRecord::new(10, 9).is_valid());
        assert!(!SegmentRecord::new(-1, 9).is_valid());
        assert!(!with_committed(0, 9, -1).is_valid());
    }

    #[test]
    fn test_segment_record_len() {
        assert_eq!(SegmentRecord::new(100, 199).len(), Some(100));
        assert_eq!(SegmentRecord::unbounded().len(), None);
        assert!(with_committed(100, 199, 100).is_complete());
    }
}
