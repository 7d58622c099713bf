//! Error types for splitfetch core

use thiserror::Error;

/// Errors that can occur while configuring or running a download
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Size query failed: {0}")]
    SizeQuery(String),

    #[error("Resume header is corrupt: {0}")]
    CorruptHeader(String),

    #[error("Server ignored the range request for segment {0}")]
    RangeUnsupported(usize),

    #[error("Network error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Server error: {status}")]
    Server { status: u16 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("hash mismatch")]
    HashMismatch { expected: String, actual: String },

    #[error("Download is already running")]
    AlreadyRunning,
}

// Allow converting to String for status reasons
impl From<DownloadError> for String {
    fn from(error: DownloadError) -> Self {
        error.to_string()
    }
}
