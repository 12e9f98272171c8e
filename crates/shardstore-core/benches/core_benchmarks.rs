//! Benchmarks for shardstore-core

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::Value;
use shardstore_core::{
    build_index, ops, query::Query, Aggregate, Record, ShardTree,
};
use std::hint::black_box;

fn people(count: usize) -> Vec<Record> {
    (0..count)
        .map(|i| {
            Record::new()
                .with("id", (i + 1) as u64)
                .with("name", format!("person-{}", i % 97))
                .with("born", 1000 + (i * 37 % 1000) as i64)
                .with("category", if i % 2 == 0 { "people" } else { "cats" })
        })
        .collect()
}

fn balanced_tree(depth: usize, next: &mut u32) -> ShardTree<u32> {
    if depth == 0 {
        *next += 1;
        ShardTree::Leaf(*next)
    } else {
        ShardTree::branch(balanced_tree(depth - 1, next), balanced_tree(depth - 1, next))
    }
}

fn bench_shard_index(c: &mut Criterion) {
    let mut group = c.benchmark_group("shard_index");

    for depth in [4usize, 10, 16].iter() {
        let tree = balanced_tree(*depth, &mut 0);
        group.bench_with_input(BenchmarkId::new("build", depth), &tree, |b, tree| {
            b.iter(|| build_index(tree).unwrap())
        });

        let index = build_index(&tree).unwrap();
        group.bench_with_input(BenchmarkId::new("find_server", depth), &index, |b, index| {
            let mut id = 0u64;
            b.iter(|| {
                id = id.wrapping_add(0x9e37_79b9);
                black_box(index.find_server(id).unwrap());
            })
        });
    }

    group.finish();
}

fn bench_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("operations");
    let fields = vec!["born".to_string(), "name".to_string()];
    let predicate = Query::new()
        .with("born", "<1500")
        .with("category", "people")
        .predicate()
        .unwrap();

    for size in [100usize, 1_000, 10_000].iter() {
        let records = people(*size);
        group.throughput(Throughput::Elements(*size as u64));

        group.bench_with_input(BenchmarkId::new("select", size), &records, |b, records| {
            b.iter(|| ops::select(records.clone(), &predicate))
        });

        group.bench_with_input(BenchmarkId::new("order", size), &records, |b, records| {
            b.iter(|| ops::order(records.clone(), &fields))
        });

        group.bench_with_input(BenchmarkId::new("distinct", size), &records, |b, records| {
            b.iter(|| ops::distinct(records.clone(), Some(&fields[1..])))
        });

        group.bench_with_input(BenchmarkId::new("median", size), &records, |b, records| {
            b.iter(|| -> Value { ops::aggregate(records, Aggregate::Median, Some("born")).unwrap() })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_shard_index, bench_operations);
criterion_main!(benches);
