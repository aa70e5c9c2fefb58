//! Services module - Pure business logic for configuration import and export.
//!
//! Everything in here is synchronous so the background worker can drive it
//! from a blocking thread and tests can call it directly.
//!
//! # Components
//!
//! - [`FileSandbox`]: File and content screening, including the per-key rate limiter.
//! - [`SchemaValidator`]: Structural and schema checks producing a [`ValidationResult`].
//! - [`MergeEngine`]: Replace/merge of stop lists and global settings.
//! - [`preview`]: Side-effect-free diff of an import against the current configuration.
//! - [`create_export`]: Builds the versioned export document.
//! - [`ImportOrchestrator`]: Validation, backup, merge and commit with rollback.
//!
//! Long-running loops (stop validation, merging large lists) accept a
//! [`ChunkGate`] so the caller can throttle them under memory pressure or
//! cancel them between chunks.
//!
//! [`ValidationResult`]: crate::models::ValidationResult

pub mod export;
pub mod import;
pub mod merge;
pub mod preview;
pub mod sandbox;
pub mod schema;

use thiserror::Error;

use crate::models::IssueCode;

pub use export::{create_export, create_export_summary, export_filename, to_pretty_json};
pub use import::{CancelHandle, CancelSignal, ImportOrchestrator, cancellation};
pub use merge::{
    MergeEngine, MergeError, filter_visible, merge_settings, merge_stops, normalize_positions,
};
pub use preview::{conflict_summary, preview, preview_with_strategy};
pub use sandbox::{FileDescriptor, FileSandbox, RateLimiterState, SecurityRejection, scan_depth};
pub use schema::{SchemaValidator, ValidationContext};

/// Reason a chunked operation stopped before completing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Interrupted {
    #[error("operation was cancelled")]
    Cancelled,

    #[error("memory pressure too high: {used_bytes} of {limit_bytes} bytes in use")]
    MemoryPressure { used_bytes: u64, limit_bytes: u64 },
}

impl Interrupted {
    pub fn issue_code(&self) -> IssueCode {
        match self {
            Self::Cancelled => IssueCode::Cancelled,
            Self::MemoryPressure { .. } => IssueCode::MemoryExhausted,
        }
    }
}

/// Cooperative yield point for chunked work.
pub trait ChunkGate {
    /// Number of items to process before calling [`checkpoint`](Self::checkpoint).
    fn chunk_size(&self) -> usize;

    /// Called after each chunk with the running count of processed items.
    fn checkpoint(&self, processed: usize) -> Result<(), Interrupted>;
}

/// Gate that never throttles or interrupts.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ungated;

impl ChunkGate for Ungated {
    fn chunk_size(&self) -> usize {
        usize::MAX
    }

    fn checkpoint(&self, _processed: usize) -> Result<(), Interrupted> {
        Ok(())
    }
}
