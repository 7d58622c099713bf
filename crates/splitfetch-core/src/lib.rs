//! splitfetch Core - Download Engine
//!
//! This crate provides a segmented, resumable HTTP download engine. A file
//! is split into byte ranges that are fetched concurrently into one partial
//! file; per-segment progress lives in a header at the front of that file so
//! an interrupted transfer can continue after a restart.
//!
//! ```no_run
//! use splitfetch_core::DownloadJob;
//! use splitfetch_types::TransferConfig;
//!
//! let config =
//!     TransferConfig::new("https://example.com/file.iso", "/tmp/downloads").with_workers(8);
//! let job = DownloadJob::new(config);
//! job.start().unwrap();
//! job.wait();
//! println!("{:?}: {:?}", job.state(), job.output_path());
//! ```

pub mod engine;

mod config;
mod error;
mod hash;
mod job;
mod naming;
mod observer;
mod probe;

pub use config::*;
pub use error::*;
pub use hash::*;
pub use job::*;
pub use naming::*;
pub use observer::*;
pub use probe::*;

pub use splitfetch_types::{ProgressSnapshot, TransferConfig, TransferEvent, TransferState};
