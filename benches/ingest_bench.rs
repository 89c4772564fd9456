use std::sync::Arc;
use std::thread;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use iris_ingest::storage::memory::MemoryStorageConfig;
use iris_ingest::storage::{StorageConfig, StorageFactory};
use iris_ingest::{Document, IndexWriter, IndexWriterConfig, Term};
use rand::Rng;

const WORDS: [&str; 16] = [
    "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel", "india", "juliet",
    "kilo", "lima", "mike", "november", "oscar", "papa",
];

fn generate_documents(count: usize) -> Vec<Document> {
    let mut rng = rand::rng();
    (0..count)
        .map(|i| {
            let body: Vec<&str> = (0..rng.random_range(20..80))
                .map(|_| WORDS[rng.random_range(0..WORDS.len())])
                .collect();
            Document::new()
                .add_keyword("id", format!("doc_{i}"))
                .add_text("body", body.join(" "))
                .add_integer("popularity", rng.random_range(0..10_000))
        })
        .collect()
}

fn new_writer(ram_buffer_size_mb: f64) -> IndexWriter {
    let storage = StorageFactory::create(StorageConfig::Memory(MemoryStorageConfig::default())).unwrap();
    let config = IndexWriterConfig::builder()
        .ram_buffer_size_mb(Some(ram_buffer_size_mb))
        .build()
        .unwrap();
    IndexWriter::new(config, storage).unwrap()
}

fn bench_single_thread_ingest(c: &mut Criterion) {
    let mut group = c.benchmark_group("Single Thread Ingest");
    group.sample_size(10);
    let docs = generate_documents(5000);
    group.throughput(Throughput::Elements(docs.len() as u64));

    for ram_mb in [1.0, 16.0] {
        group.bench_with_input(BenchmarkId::from_parameter(ram_mb), &ram_mb, |b, &ram_mb| {
            b.iter(|| {
                let writer = new_writer(ram_mb);
                for doc in &docs {
                    writer.add_document(doc.clone()).unwrap();
                }
                writer.close().unwrap();
            })
        });
    }
    group.finish();
}

fn bench_concurrent_ingest(c: &mut Criterion) {
    let mut group = c.benchmark_group("Concurrent Ingest");
    group.sample_size(10);
    let docs = Arc::new(generate_documents(8000));
    group.throughput(Throughput::Elements(docs.len() as u64));

    for threads in [2, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            b.iter(|| {
                let writer = Arc::new(new_writer(4.0));
                let handles: Vec<_> = (0..threads)
                    .map(|t| {
                        let writer = Arc::clone(&writer);
                        let docs = Arc::clone(&docs);
                        thread::spawn(move || {
                            for doc in docs.iter().skip(t).step_by(threads) {
                                writer.add_document(doc.clone()).unwrap();
                            }
                        })
                    })
                    .collect();
                for handle in handles {
                    handle.join().unwrap();
                }
                writer.close().unwrap();
            })
        });
    }
    group.finish();
}

fn bench_update_heavy(c: &mut Criterion) {
    let mut group = c.benchmark_group("Update Heavy");
    group.sample_size(10);
    let docs = generate_documents(2000);
    group.throughput(Throughput::Elements(docs.len() as u64 * 2));

    group.bench_function("update_twice", |b| {
        b.iter(|| {
            let writer = new_writer(4.0);
            for round in 0..2 {
                for (i, doc) in docs.iter().enumerate() {
                    let term = Term::new("id", format!("doc_{i}"));
                    if round == 0 {
                        writer.add_document(doc.clone()).unwrap();
                    } else {
                        writer.update_document(term, doc.clone()).unwrap();
                    }
                }
            }
            writer.close().unwrap();
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_single_thread_ingest,
    bench_concurrent_ingest,
    bench_update_heavy
);
criterion_main!(benches);
