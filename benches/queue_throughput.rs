//! Benchmarks for row movement
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rowflow::pipeline::{Graph, NodeDef, NodeRegistry, RowQueue, RunState, Scheduler};
use rowflow::row::{FieldMeta, Row, Schema, Value, ValueType};
use rowflow::transport::wire::{decode_row, encode_row};
use rowflow::EngineConfig;
use std::sync::Arc;
use std::thread;

const ROWS: u64 = 20_000;

fn schema() -> Arc<Schema> {
    Schema::shared(vec![
        FieldMeta::new("id", ValueType::Integer),
        FieldMeta::new("name", ValueType::String),
        FieldMeta::new("ratio", ValueType::Number),
    ])
}

fn row(schema: &Arc<Schema>, i: u64) -> Row {
    Row::new(
        schema.clone(),
        vec![
            Value::Integer(i as i64),
            Value::String(format!("row-{}", i)),
            Value::Number(i as f64 * 0.5),
        ],
    )
    .unwrap()
}

fn bench_queue_handoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_handoff");
    group.throughput(Throughput::Elements(ROWS));
    let schema = schema();

    for capacity in [1usize, 16, 1_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(capacity), capacity, |b, &cap| {
            b.iter(|| {
                let queue = Arc::new(RowQueue::new("bench", cap));
                queue.set_schema(schema.clone()).unwrap();
                let producer = {
                    let (queue, schema) = (queue.clone(), schema.clone());
                    thread::spawn(move || {
                        for i in 0..ROWS {
                            queue.put(row(&schema, i)).unwrap();
                        }
                        queue.close();
                    })
                };
                let mut count = 0u64;
                while let Some(r) = queue.get() {
                    count += black_box(r.len()) as u64;
                }
                producer.join().unwrap();
                count
            });
        });
    }
    group.finish();
}

fn bench_wire_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire_codec");
    let schema = schema();
    let sample = row(&schema, 42);
    let mut encoded = Vec::new();
    encode_row(&sample, &mut encoded);

    group.bench_function("encode_row", |b| {
        let mut buf = Vec::with_capacity(128);
        b.iter(|| {
            buf.clear();
            encode_row(black_box(&sample), &mut buf);
        });
    });
    group.bench_function("decode_row", |b| {
        b.iter(|| black_box(decode_row(&schema, &encoded).unwrap()));
    });
    group.finish();
}

fn bench_linear_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("linear_run");
    group.sample_size(10);
    group.throughput(Throughput::Elements(ROWS));

    let graph = Graph::new("bench")
        .node(
            NodeDef::new("gen", "generator")
                .with("rows", ROWS as i64)
                .with("fields", vec!["id:integer", "name:string"]),
        )
        .node(NodeDef::new("mid", "pass-through"))
        .node(NodeDef::new("out", "discard"))
        .edge("gen", "mid")
        .edge("mid", "out");
    let scheduler = Scheduler::new(NodeRegistry::with_builtins(), EngineConfig::default());

    group.bench_function("gen_pass_discard", |b| {
        b.iter(|| {
            let run = scheduler.prepare(&graph).unwrap();
            run.start().unwrap();
            run.wait_until_finished();
            assert_eq!(run.status().state, RunState::Finished);
        });
    });
    group.finish();
}

criterion_group!(benches, bench_queue_handoff, bench_wire_codec, bench_linear_run);
criterion_main!(benches);
