//! Transfer Engine - The heart of splitfetch
//!
//! This module implements the segmented download engine:
//! - Byte-range planning for fresh and resumed downloads
//! - A binary resume header embedded in the partial file
//! - Buffered segment workers writing into one shared file
//! - Single-threaded multiplexing of all range requests

mod header;
mod plan;
mod progress;
mod segment_worker;
mod shared_file;
mod transfer;

pub use header::*;
pub use plan::*;
pub use progress::*;
pub use segment_worker::*;
pub use shared_file::*;
pub use transfer::*;
