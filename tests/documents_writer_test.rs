use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use iris_ingest::storage::memory::{MemoryStorage, MemoryStorageConfig};
use iris_ingest::writer::chain::{IndexingChain, IndexingChainFactory, SegmentWriteState};
use iris_ingest::writer::limiter::DocumentLimiter;
use iris_ingest::writer::segment::{DocMap, FlushedSegment, SegmentInfo};
use iris_ingest::writer::ticket_queue::FlushTicket;
use iris_ingest::writer::{
    BufferedUpdatesStream, DocumentsWriter, FlushNotifications, FlushTicketQueue,
    IndexWriterConfig, PublishedTicket,
};
use iris_ingest::{Document, IrisError};

struct Quiet;

impl FlushNotifications for Quiet {
    fn delete_unused_files(&self, _files: &BTreeSet<String>) {}
    fn flush_failed(&self, _info: &SegmentInfo) {}
    fn after_segments_flushed(&self) -> iris_ingest::Result<()> {
        Ok(())
    }
    fn on_tragic_event(&self, _error: &IrisError, _location: &str) {}
    fn on_deletes_applied(&self) {}
    fn on_ticket_backlog(&self) {}
}

fn documents_writer(config: &IndexWriterConfig) -> (Arc<DocumentsWriter>, Arc<DocumentLimiter>) {
    let limiter = Arc::new(DocumentLimiter::new(config.max_docs));
    let writer = DocumentsWriter::new(
        config,
        Arc::new(MemoryStorage::new(MemoryStorageConfig::default())),
        Arc::clone(&limiter),
        Arc::new(BufferedUpdatesStream::new()),
        Arc::new(Quiet),
        Arc::new(AtomicU64::new(0)),
    )
    .expect("valid config");
    (Arc::new(writer), limiter)
}

fn random_doc(rng: &mut StdRng, id: usize) -> Document {
    const WORDS: [&str; 12] = [
        "segment", "buffer", "flush", "stall", "ticket", "queue", "delete", "update", "thread",
        "memory", "index", "merge",
    ];
    let len = rng.random_range(5..60);
    let body: Vec<&str> = (0..len)
        .map(|_| WORDS[rng.random_range(0..WORDS.len())])
        .collect();
    Document::new()
        .add_keyword("id", id.to_string())
        .add_text("body", body.join(" "))
        .add_integer("rank", rng.random_range(0..1000))
}

fn drain_tickets(writer: &DocumentsWriter) -> iris_ingest::Result<Vec<PublishedTicket>> {
    let mut tickets = Vec::new();
    writer.purge_flush_tickets(true, |ticket| {
        tickets.push(ticket);
        Ok(())
    })?;
    Ok(tickets)
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting until {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[derive(Debug, Default)]
struct Gate {
    open: Mutex<bool>,
    opened: Condvar,
}

impl Gate {
    fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.opened.wait(&mut open);
        }
    }

    fn open(&self) {
        *self.open.lock() = true;
        self.opened.notify_all();
    }
}

/// Opens the gate even if an assertion fails first.
struct OpenOnDrop(Arc<Gate>);

impl Drop for OpenOnDrop {
    fn drop(&mut self) {
        self.0.open();
    }
}

const GATED_DOC_BYTES: usize = 400 * 1024;

/// Reports a fixed size per document and blocks every flush on a gate.
#[derive(Debug)]
struct GatedChain {
    gate: Arc<Gate>,
    docs: usize,
}

impl IndexingChain for GatedChain {
    fn process_document(&mut self, _doc_id: u32, _doc: &Document) -> iris_ingest::Result<()> {
        self.docs += 1;
        Ok(())
    }

    fn flush(&mut self, _state: &mut SegmentWriteState<'_>) -> iris_ingest::Result<Option<DocMap>> {
        self.gate.wait();
        Ok(None)
    }

    fn abort(&mut self) -> iris_ingest::Result<()> {
        self.docs = 0;
        Ok(())
    }

    fn ram_bytes_used(&self) -> usize {
        self.docs * GATED_DOC_BYTES
    }
}

#[derive(Debug)]
struct GatedChainFactory {
    gate: Arc<Gate>,
}

impl IndexingChainFactory for GatedChainFactory {
    fn create(&self, _segment_name: &str) -> Box<dyn IndexingChain> {
        Box::new(GatedChain {
            gate: Arc::clone(&self.gate),
            docs: 0,
        })
    }
}

#[test]
fn test_stalled_callers_wait_for_flush() -> iris_ingest::Result<()> {
    let gate = Arc::new(Gate::default());
    let _release = OpenOnDrop(Arc::clone(&gate));
    let config = IndexWriterConfig::builder()
        .ram_buffer_size_mb(Some(1.0))
        .check_pending_flush_on_update(false)
        .use_compound_file(false)
        .chain_factory(Arc::new(GatedChainFactory {
            gate: Arc::clone(&gate),
        }))
        .build()?;
    let (writer, _) = documents_writer(&config);
    let batch = || vec![Document::new().add_keyword("id", "x"); 3];

    // 1.2 MB in one buffer: pending, and its flush blocks on the gate
    let first = {
        let writer = Arc::clone(&writer);
        let docs = batch();
        thread::spawn(move || writer.update_documents(&docs, None))
    };
    wait_until("the first buffer flushes", || {
        writer.flush_control().num_flushing() == 1
    });
    assert!(!writer.flush_control().any_stalled_threads());

    // a second flushing buffer pushes net bytes past twice the RAM buffer
    let second = {
        let writer = Arc::clone(&writer);
        let docs = batch();
        thread::spawn(move || writer.update_documents(&docs, None))
    };
    wait_until("indexing stalls", || {
        writer.flush_control().any_stalled_threads()
    });
    assert_eq!(writer.flush_control().num_flushing(), 2);
    assert!(writer.flush_control().flush_bytes() > 2 * 1024 * 1024);
    assert_eq!(writer.flush_control().active_bytes(), 0);

    let blocked = {
        let writer = Arc::clone(&writer);
        thread::spawn(move || writer.update_documents(&[Document::new().add_keyword("id", "y")], None))
    };
    wait_until("a new caller blocks", || {
        writer.flush_control().stall_control().num_waiting() == 1
    });
    assert!(!blocked.is_finished());

    gate.open();
    for handle in [first, second, blocked] {
        handle.join().expect("indexing thread panicked")?;
    }
    assert!(!writer.flush_control().any_stalled_threads());
    assert!(writer.flush_control().stall_control().was_stalled());
    assert_eq!(writer.num_docs_in_ram(), 1);
    assert_eq!(writer.flush_control().num_flushing(), 0);
    Ok(())
}

#[test]
fn test_stalled_caller_proceeds_after_one_wait() -> iris_ingest::Result<()> {
    let gate = Arc::new(Gate::default());
    let _release = OpenOnDrop(Arc::clone(&gate));
    let config = IndexWriterConfig::builder()
        .ram_buffer_size_mb(Some(1.0))
        .check_pending_flush_on_update(false)
        .use_compound_file(false)
        .chain_factory(Arc::new(GatedChainFactory {
            gate: Arc::clone(&gate),
        }))
        .build()?;
    let (writer, _) = documents_writer(&config);
    let batch = || vec![Document::new().add_keyword("id", "x"); 3];

    let flushes: Vec<_> = (0..2)
        .map(|_| {
            let writer = Arc::clone(&writer);
            let docs = batch();
            thread::spawn(move || writer.update_documents(&docs, None))
        })
        .collect();
    wait_until("indexing stalls", || {
        writer.flush_control().any_stalled_threads()
            && writer.flush_control().num_flushing() == 2
    });

    // nothing is left to help with and the gate stays closed
    let started = Instant::now();
    writer.update_documents(&[Document::new().add_keyword("id", "y")], None)?;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(writer.flush_control().any_stalled_threads());
    assert_eq!(writer.flush_control().stall_control().num_waiting(), 0);
    assert_eq!(writer.num_docs_in_ram(), 7);

    gate.open();
    for handle in flushes {
        handle.join().expect("indexing thread panicked")?;
    }
    assert!(!writer.flush_control().any_stalled_threads());
    assert_eq!(writer.num_docs_in_ram(), 1);
    Ok(())
}

#[test]
fn test_ram_accounting_stays_bounded() -> iris_ingest::Result<()> {
    let config = IndexWriterConfig::builder()
        .ram_buffer_size_mb(Some(0.25))
        .use_compound_file(false)
        .build()?;
    let (writer, limiter) = documents_writer(&config);
    let threads = 4;
    let docs_per_thread = 300;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let writer = Arc::clone(&writer);
            thread::spawn(move || -> iris_ingest::Result<()> {
                let mut rng = StdRng::seed_from_u64(t as u64);
                for i in 0..docs_per_thread {
                    let doc = random_doc(&mut rng, t * docs_per_thread + i);
                    writer.update_documents(&[doc], None)?;
                    assert!(
                        writer.flush_control().memory_bound_holds(),
                        "{:?}",
                        writer.flush_control()
                    );
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("indexing thread panicked")?;
    }

    writer.flush_all_threads()?;
    writer.finish_full_flush(true)?;
    let tickets = drain_tickets(&writer)?;
    let flushed: u64 = tickets
        .iter()
        .filter_map(|t| t.segment.as_ref())
        .map(|s| s.info.max_doc as u64)
        .sum();
    assert_eq!(flushed, (threads * docs_per_thread) as u64);
    assert!(tickets.iter().all(|t| !t.failed));
    assert!(tickets.len() > 1, "a quarter MB buffer must flush repeatedly");

    let names: BTreeSet<_> = tickets
        .iter()
        .filter_map(|t| t.segment.as_ref().map(|s| s.info.name.clone()))
        .collect();
    assert_eq!(names.len(), tickets.iter().filter(|t| t.segment.is_some()).count());

    assert_eq!(writer.num_docs_in_ram(), 0);
    assert_eq!(writer.flush_control().active_bytes(), 0);
    assert_eq!(writer.flush_control().flush_bytes(), 0);
    assert_eq!(limiter.pending(), flushed);
    assert!(!writer.any_changes());
    Ok(())
}

#[test]
fn test_abort_releases_every_reservation() -> iris_ingest::Result<()> {
    let config = IndexWriterConfig::default();
    let (writer, limiter) = documents_writer(&config);
    let baseline = limiter.pending();

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let writer = Arc::clone(&writer);
            thread::spawn(move || -> iris_ingest::Result<()> {
                let mut rng = StdRng::seed_from_u64(100 + t);
                for i in 0..50 {
                    writer.update_documents(&[random_doc(&mut rng, i)], None)?;
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("indexing thread panicked")?;
    }
    assert_eq!(limiter.pending(), baseline + 200);
    assert!(writer.pool().size() >= 1);

    writer.abort()?;
    assert_eq!(limiter.pending(), baseline);
    assert_eq!(writer.pool().size(), 0);
    assert_eq!(writer.num_docs_in_ram(), 0);
    assert_eq!(writer.flush_control().active_bytes(), 0);
    assert!(!writer.any_changes());
    Ok(())
}

#[test]
fn test_lock_and_abort_all_drops_unpublished_segments() -> iris_ingest::Result<()> {
    let config = IndexWriterConfig::builder()
        .ram_buffer_size_mb(None)
        .max_buffered_docs(Some(10))
        .use_compound_file(false)
        .build()?;
    let (writer, limiter) = documents_writer(&config);
    let mut rng = StdRng::seed_from_u64(7);
    for i in 0..35 {
        writer.update_documents(&[random_doc(&mut rng, i)], None)?;
    }
    assert_eq!(writer.ticket_queue().ticket_count(), 3);
    assert_eq!(writer.num_docs_in_ram(), 5);
    assert_eq!(limiter.pending(), 35);

    let aborted = writer.lock_and_abort_all()?;
    assert_eq!(limiter.pending(), 0);
    assert!(!writer.ticket_queue().has_tickets());
    assert_eq!(writer.num_docs_in_ram(), 0);
    drop(aborted);

    writer.update_documents(&[random_doc(&mut rng, 99)], None)?;
    assert_eq!(limiter.pending(), 1);
    Ok(())
}

#[test]
fn test_tickets_publish_in_order_under_concurrency() -> iris_ingest::Result<()> {
    let queue = Arc::new(FlushTicketQueue::new());
    let count = 32;
    let ids: Vec<_> = (0..count)
        .map(|_| {
            queue
                .add_ticket(|| Ok(Some(FlushTicket::for_segment(None))))
                .map(|id| id.expect("segment ticket"))
        })
        .collect::<iris_ingest::Result<_>>()?;

    let mut completion = ids.clone();
    completion.shuffle(&mut StdRng::seed_from_u64(42));
    let published = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = completion
        .chunks(8)
        .enumerate()
        .map(|(worker, chunk)| {
            let queue = Arc::clone(&queue);
            let published = Arc::clone(&published);
            let chunk = chunk.to_vec();
            thread::spawn(move || -> iris_ingest::Result<()> {
                let mut rng = StdRng::seed_from_u64(worker as u64);
                for id in chunk {
                    thread::sleep(Duration::from_micros(rng.random_range(0..500)));
                    if rng.random_range(0..5) == 0 {
                        queue.mark_ticket_failed(id);
                    } else {
                        let info = SegmentInfo::new(format!("s{worker}"), 1, false);
                        queue.add_segment(id, FlushedSegment::new(info, None, None, None));
                    }
                    queue.try_purge(|ticket| {
                        published.lock().push(ticket.id);
                        Ok(())
                    })?;
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker panicked")?;
    }
    queue.force_purge(|ticket| {
        published.lock().push(ticket.id);
        Ok(())
    })?;

    assert_eq!(*published.lock(), ids);
    assert!(!queue.has_tickets());
    Ok(())
}
