use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use quadstore::{Dataset, Pattern, Quad, StoreConfig, TermId};
use tempfile::TempDir;

fn seeded_dataset(quads: u64) -> (TempDir, Dataset, Vec<Quad>) {
    let dir = TempDir::new().unwrap();
    let dataset = Dataset::open(&StoreConfig::new(dir.path())).unwrap();
    let term = |name: String| TermId::iri(dataset.intern_string(&name).unwrap());
    let stored: Vec<Quad> = (0..quads)
        .map(|i| Quad {
            graph: term(format!("http://example.org/g{}", i % 4)),
            subject: term(format!("http://example.org/s{}", i % 100)),
            property: term(format!("http://example.org/p{}", i % 8)),
            object: term(format!("http://example.org/o{i}")),
        })
        .collect();
    for quad in &stored {
        dataset.add(quad).unwrap();
    }
    (dir, dataset, stored)
}

fn bench_add(c: &mut Criterion) {
    c.bench_function("add_1000_quads", |b| {
        b.iter_batched(
            || seeded_dataset(0),
            |(dir, dataset, _)| {
                let term = |name: String| TermId::iri(dataset.intern_string(&name).unwrap());
                for i in 0..1000u64 {
                    let quad = Quad {
                        graph: term("http://example.org/g".to_string()),
                        subject: term(format!("http://example.org/s{}", i % 100)),
                        property: term(format!("http://example.org/p{}", i % 8)),
                        object: term(format!("http://example.org/o{i}")),
                    };
                    dataset.add(&quad).unwrap();
                }
                drop(dir);
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_lookup(c: &mut Criterion) {
    let (_dir, dataset, stored) = seeded_dataset(2000);
    c.bench_function("contains_hit", |b| {
        let mut at = 0usize;
        b.iter(|| {
            let quad = &stored[at % stored.len()];
            at += 1;
            black_box(dataset.contains(Pattern::from(quad)).unwrap())
        })
    });
    c.bench_function("count_graph_via_reverse_index", |b| {
        let graph = stored[0].graph;
        b.iter(|| black_box(dataset.count(Pattern::graph(graph)).unwrap()))
    });
    c.bench_function("scan_everything", |b| {
        b.iter(|| {
            let total: u64 = dataset
                .get_all(Pattern::everything())
                .unwrap()
                .map(|item| item.unwrap().1)
                .sum();
            black_box(total)
        })
    });
}

criterion_group!(benches, bench_add, bench_lookup);
criterion_main!(benches);
