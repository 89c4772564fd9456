//! The concurrent ingestion core and the writer around it.
//!
//! Documents flow from [`IndexWriter`] through the [`DocumentsWriter`]
//! façade into per-thread [`SegmentBuffer`]s leased from the
//! [`BufferPool`]. The [`FlushControl`] accounts their RAM, asks the
//! [`FlushPolicy`] which buffers to flush and stalls indexing threads when
//! flushing falls behind. Deletes and doc-values updates are sequenced
//! through the [`DeleteQueue`]; flushed segments and frozen deletes are
//! published in order through the [`FlushTicketQueue`].

pub mod buffered_updates;
pub mod chain;
pub mod compound;
pub mod config;
pub mod delete_queue;
pub mod documents_writer;
pub mod flush_control;
pub mod flush_policy;
pub mod frozen_updates;
pub mod index_writer;
pub mod inverted_chain;
pub mod limiter;
pub mod notifications;
pub mod per_thread;
pub mod pool;
pub mod segment;
pub mod stall;
pub mod term;
pub mod ticket_queue;
pub mod updates_stream;

pub use config::IndexWriterConfig;
pub use delete_queue::{DeleteQueue, DeleteSlice, QueueNode, SeqNo, SeqNumber, UpdateItem};
pub use documents_writer::{AbortedBuffers, DocumentsWriter};
pub use flush_control::FlushControl;
pub use flush_policy::{FlushByRamOrCountsPolicy, FlushControlView, FlushPolicy};
pub use index_writer::{IndexWriter, PublishedSegment};
pub use notifications::FlushNotifications;
pub use per_thread::{BufferGuard, FlushingBuffer, SegmentBuffer};
pub use pool::BufferPool;
pub use term::{DeleteQuery, DocValuesUpdate, MatchAllDocsQuery, QueryRef, Term, TermRangeQuery};
pub use ticket_queue::{FlushTicketQueue, PublishedTicket};
pub use updates_stream::{BufferedUpdatesStream, NoopResolver, UpdatesResolver};
