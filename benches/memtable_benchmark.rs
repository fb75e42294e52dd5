use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rand::Rng;

use memtable_bench::memtable::{MemtableRep, RepConfig, Representation};

const KEY_LEN: usize = 8;
const VALUE_LEN: usize = 92;
const POOL_SIZE: usize = 10_000;

fn random_bytes(len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen::<u8>()).collect()
}

fn build(representation: Representation) -> Arc<dyn MemtableRep> {
    RepConfig {
        representation,
        vector_preallocation: 0,
        bucket_count: 1024,
        prefix_len: 4,
    }
    .build()
    .expect("Failed to build the representation")
}

fn all_representations() -> [Representation; 3] {
    [
        Representation::Vector,
        Representation::SkipList,
        Representation::HashSkipList,
    ]
}

fn representation_insert_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("representation_insert");
    group.throughput(Throughput::Elements(1));
    for representation in all_representations() {
        let table = build(representation);
        let pool: Vec<(Vec<u8>, Vec<u8>)> = (0..POOL_SIZE)
            .map(|_| (random_bytes(KEY_LEN), random_bytes(VALUE_LEN)))
            .collect();
        group.bench_function(representation.dir_suffix(), |b| {
            let mut i = 0;
            b.iter(|| {
                let (key, value) = &pool[i % pool.len()];
                i += 1;
                table.insert(key.clone(), value.clone())
            })
        });
    }
    group.finish();
}

fn representation_get_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("representation_get");
    group.throughput(Throughput::Elements(1));
    for representation in all_representations() {
        let table = build(representation);
        let keys: Vec<Vec<u8>> = (0..POOL_SIZE).map(|_| random_bytes(KEY_LEN)).collect();
        for key in &keys {
            table.insert(key.clone(), random_bytes(VALUE_LEN));
        }
        group.bench_function(representation.dir_suffix(), |b| {
            let mut i = 0;
            b.iter(|| {
                let key = &keys[i % keys.len()];
                i += 1;
                black_box(table.get(key))
            })
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    representation_insert_benchmark,
    representation_get_benchmark
);
criterion_main!(benches);
