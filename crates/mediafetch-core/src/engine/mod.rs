//! Transfer engine - resumable single-URL downloads
//!
//! This module implements the crash-safe core of MediaFetch:
//! - HEAD probing for size and range support
//! - Range resumption validated against the response status
//! - Linear-backoff retries with cancellation between attempts
//! - Size and SHA-256 verification before an atomic rename

mod job_store;
mod progress;
mod transfer;
mod verify;

pub use job_store::*;
pub use progress::ProgressSink;
pub use transfer::*;
pub use verify::*;
