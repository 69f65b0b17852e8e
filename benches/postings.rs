use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use barrelidx::config::{FieldSchema, IndexSchema, MergeMode};
use barrelidx::index::{la_input, IndexManager, IndexerDocument, Term, TermDocFreqs, TermReader};
use barrelidx::{DirectoryKind, DirectoryRegistry, IndexManagerConfig, MergeStrategy, UnconditionalMode};

fn create_config(max_docs: u32) -> IndexManagerConfig {
    let schema = IndexSchema::new(vec![FieldSchema::indexed("body")]);
    let mut config = IndexManagerConfig::new("bench", schema)
        .with_directory(DirectoryKind::Ram)
        .with_merge_mode(MergeMode::Synchronous)
        .with_merge_strategy(MergeStrategy::Unconditional {
            mode: UnconditionalMode::Offline,
        })
        .with_binlog(false);
    config.memory.max_docs_per_barrel = max_docs;
    config
}

fn make_doc(id: u32) -> IndexerDocument {
    // term 0 in every doc, term k in every k-th doc
    let terms: Vec<u32> = (0..8).filter(|k| *k == 0 || id % k == 0).collect();
    IndexerDocument::new(id).with_field("body", la_input(&terms))
}

fn build_index(doc_count: u32, max_docs: u32) -> IndexManager {
    let registry = DirectoryRegistry::new();
    let manager = IndexManager::open(create_config(max_docs), &registry).unwrap();
    for id in 0..doc_count {
        manager.add_document(make_doc(id)).unwrap();
    }
    manager.flush().unwrap();
    manager
}

fn bench_indexing(c: &mut Criterion) {
    let mut group = c.benchmark_group("indexing");
    group.sample_size(10);
    for &doc_count in &[1_000u32, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(doc_count), &doc_count, |b, &n| {
            b.iter(|| black_box(build_index(n, 5_000)));
        });
    }
    group.finish();
}

fn bench_iteration(c: &mut Criterion) {
    let manager = build_index(50_000, 10_000);
    let reader = manager.reader().unwrap();
    let term = Term::new("body", 0);

    c.bench_function("iterate_all_barrels", |b| {
        b.iter(|| {
            let mut docs = reader.term_doc_freqs(&term).unwrap();
            let mut count = 0u32;
            while docs.next().is_some() {
                count += 1;
            }
            black_box(count)
        })
    });

    c.bench_function("skip_to_sparse", |b| {
        b.iter(|| {
            let mut docs = reader.term_doc_freqs(&term).unwrap();
            let mut target = 0;
            while let Some(doc) = docs.skip_to(target) {
                target = doc + 997;
            }
            black_box(target)
        })
    });
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");
    group.sample_size(10);
    group.bench_function("optimize_10_barrels", |b| {
        b.iter_with_setup(
            || build_index(20_000, 2_000),
            |manager| {
                manager.optimize().unwrap();
                black_box(manager.barrels().len())
            },
        )
    });
    group.finish();
}

criterion_group!(benches, bench_indexing, bench_iteration, bench_merge);
criterion_main!(benches);
