//! # Iris Ingest
//!
//! The concurrent document-ingestion core of a segment-based full-text
//! index.
//!
//! ## Features
//!
//! - Per-thread in-memory segments with minimal cross-thread contention
//! - A lock-light global queue that orders deletes and updates against flushes
//! - RAM accounting with flush policies and backpressure (stalling)
//! - Ticket-ordered publication of flushed segments and frozen deletes
//! - All-or-nothing abort
//! - Pluggable storage backends and indexing chains

pub mod analysis;
mod data;
mod error;
pub mod storage;
mod util;
pub mod writer;

// Re-exports for the public API
pub use analysis::{Analyzer, StandardAnalyzer};
pub use data::{DataValue, Document};
pub use error::{IrisError, Result};
pub use storage::{Storage, StorageConfig, StorageFactory};
pub use writer::{DocumentsWriter, IndexWriter, IndexWriterConfig, SeqNo, SeqNumber, Term};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
