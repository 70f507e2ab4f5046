use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use catalog_core::ProductId;
use catalog_events::{EventChannel, InMemoryEventChannel, OutboundRecord};
use catalog_infra::config::TopicConfig;
use catalog_infra::consumer::ProductConsumer;
use catalog_infra::producer::EventProducer;
use catalog_infra::services::{ProductCommands, ProductQueries};
use catalog_infra::store::InMemoryProductStore;
use catalog_products::{ProductCreated, ProductEvent, ProductInput, ProductStockUpdated};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn input(id: i64) -> ProductInput {
    ProductInput {
        id: Some(ProductId::new(id)),
        name: format!("Product {id}"),
        description: "bench".to_string(),
        price: 9.99,
        stock: 10,
    }
}

/// Time for a command to return, and for its event to be confirmed on the channel.
fn bench_command_latency(c: &mut Criterion) {
    let rt = runtime();
    let channel = InMemoryEventChannel::new();
    let (producer, _handle) = rt.block_on(async {
        EventProducer::spawn(channel.clone(), TopicConfig::default(), 65_536, None)
    });
    let store = Arc::new(InMemoryProductStore::new());
    let commands = ProductCommands::new(producer, ProductQueries::new(store));

    let mut group = c.benchmark_group("command_latency");
    group.sample_size(1000);

    let mut next_id = 0i64;
    group.bench_function("create_returns", |b| {
        b.iter(|| {
            next_id += 1;
            let accepted = commands.create(black_box(input(next_id))).unwrap();
            black_box(accepted.into_value())
        })
    });

    group.bench_function("create_confirmed", |b| {
        b.iter(|| {
            next_id += 1;
            let accepted = commands.create(black_box(input(next_id))).unwrap();
            rt.block_on(accepted.confirmed()).unwrap()
        })
    });

    group.finish();
}

fn bench_consumer_apply_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("consumer_apply_throughput");

    for batch_size in [10usize, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            batch_size,
            |b, &size| {
                let events: Vec<ProductEvent> = (0..size as i64)
                    .flat_map(|id| {
                        [
                            ProductCreated {
                                id: Some(ProductId::new(id)),
                                name: "p".to_string(),
                                description: "d".to_string(),
                                price: 1.0,
                                stock: 1,
                            }
                            .into(),
                            ProductStockUpdated {
                                id: ProductId::new(id),
                                stock: 2,
                            }
                            .into(),
                        ]
                    })
                    .collect();

                b.iter(|| {
                    let consumer = ProductConsumer::new(InMemoryProductStore::new());
                    rt.block_on(async {
                        for event in &events {
                            black_box(consumer.apply(event).await.unwrap());
                        }
                    });
                })
            },
        );
    }

    group.finish();
}

fn bench_channel_publish_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("channel_publish_throughput");

    for partitions in [1u32, 4, 16].iter() {
        group.throughput(Throughput::Elements(1000));
        group.bench_with_input(
            BenchmarkId::new("partitions", partitions),
            partitions,
            |b, &partitions| {
                b.iter(|| {
                    let channel = InMemoryEventChannel::with_partitions(partitions);
                    rt.block_on(async {
                        for id in 0..1000 {
                            let record = OutboundRecord::new("product-stock-updated", "{}")
                                .with_key(id.to_string());
                            black_box(channel.publish(record).await.unwrap());
                        }
                    });
                })
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_command_latency,
    bench_consumer_apply_throughput,
    bench_channel_publish_throughput
);
criterion_main!(benches);
