use std::sync::Arc;

use criterion::{black_box, BatchSize, BenchmarkId, Criterion};
use criterion::{criterion_group, criterion_main};
use tempfile::tempdir;

use micromq::router::{match_headers, match_topic};
use micromq::store::QueueStore;
use micromq::{
    BasicProperties, Binding, BrokerConfig, Exchange, ExchangeType, QueueMeta, SystemClock,
    VirtualHost,
};

const INSERTS_PER_ITER: usize = 10_000;

fn bench_match(c: &mut Criterion) {
    let mut group = c.benchmark_group("match");
    group.bench_function("topic_hash", |b| {
        b.iter(|| match_topic(black_box("kern.disk.sda.io"), black_box("kern.*.#")))
    });
    group.bench_function("topic_exact", |b| {
        b.iter(|| match_topic(black_box("a.b.c.d.e"), black_box("a.b.c.d.e")))
    });
    let headers = BasicProperties::default()
        .header("priority", "high")
        .header("type", "alert")
        .header("region", "eu")
        .headers;
    let args = BasicProperties::default()
        .header("x-match", "all")
        .header("priority", "high")
        .header("type", "alert")
        .headers;
    group.bench_function("headers_all", |b| {
        b.iter(|| match_headers(black_box(&headers), black_box(&args)))
    });
    group.finish();
}

fn bench_fanout_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("topic_publish");
    for &queues in &[1_usize, 8, 64] {
        let dir = tempdir().expect("tempdir");
        let host = VirtualHost::open(
            &BrokerConfig::with_data_dir(dir.path()),
            Arc::new(SystemClock),
        )
        .expect("host");
        host.declare_exchange(Exchange::new("logs", ExchangeType::Topic))
            .expect("exchange");
        for i in 0..queues {
            let name = format!("q{i}");
            host.declare_queue(QueueMeta::new(&name)).expect("queue");
            host.bind(Binding::new("logs", name.as_str(), "kern.#"))
                .expect("bind");
        }
        group.bench_with_input(BenchmarkId::from_parameter(queues), &queues, |b, _| {
            b.iter(|| {
                let outcome = host
                    .publish_to_exchange(
                        "logs",
                        BasicProperties::with_routing_key("kern.disk"),
                        black_box(b"payload"),
                    )
                    .expect("publish");
                for queue in &outcome.routed {
                    host.basic_consume(queue).expect("consume");
                }
            })
        });
    }
    group.finish();
}

fn bench_durable_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("durable_insert");
    for &size in &[64_usize, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let dir = tempdir().expect("tempdir");
                    let store = QueueStore::new(dir.path(), "bench", false);
                    (dir, store, vec![0u8; size])
                },
                |(_dir, store, body)| {
                    for i in 0..INSERTS_PER_ITER {
                        let props = BasicProperties {
                            id: i.to_string(),
                            ..BasicProperties::default()
                        };
                        store.insert(props, black_box(body.clone()), true).expect("insert");
                    }
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_match, bench_fanout_publish, bench_durable_insert);
criterion_main!(benches);
