//! End-to-end client-server benchmarks.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use iproto_channel::{Channel, ChannelConfig, ServeMux};
use iproto_client::{Pool, PoolConfig};
use iproto_protocol::{response_to, Packet};
use iproto_server::Server;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;

const ECHO: u32 = 1;

struct TestSetup {
    server: Arc<Server>,
    pool: Pool,
}

fn setup_server_and_pool(rt: &Runtime, size: usize) -> TestSetup {
    rt.block_on(async {
        let mux = ServeMux::new();
        mux.handle_fn(ECHO, |conn: Channel, packet: Packet| async move {
            let _ = conn.send(response_to(&packet, packet.data.clone())).await;
        })
        .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(Server::new(ChannelConfig::new().with_handler(mux)));
        let serving = server.clone();
        tokio::spawn(async move {
            let _ = serving.serve(listener).await;
        });

        let pool = Pool::dial(addr, PoolConfig::new().with_size(size))
            .await
            .unwrap();
        while pool.stats().online < size {
            tokio::task::yield_now().await;
        }
        TestSetup { server, pool }
    })
}

fn teardown(rt: &Runtime, setup: TestSetup) {
    rt.block_on(async {
        setup.pool.shutdown().await;
        setup.server.shutdown();
    });
}

fn bench_call_latency(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_server_and_pool(&rt, 1);

    let mut group = c.benchmark_group("e2e_call");
    group.throughput(Throughput::Elements(1));

    for size in [16, 1024, 16384] {
        let payload = Bytes::from(vec![0x5a; size]);
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.to_async(&rt)
                .iter(|| async { black_box(setup.pool.call(ECHO, payload.clone()).await.unwrap()) });
        });
    }

    group.finish();
    teardown(&rt, setup);
}

fn bench_concurrent_calls(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("e2e_concurrent");
    for pool_size in [1, 4] {
        let setup = setup_server_and_pool(&rt, pool_size);
        group.throughput(Throughput::Elements(64));
        group.bench_function(BenchmarkId::new("64_calls", pool_size), |b| {
            b.to_async(&rt).iter(|| async {
                let mut calls = Vec::with_capacity(64);
                for _ in 0..64 {
                    let pool = setup.pool.clone();
                    calls.push(tokio::spawn(async move {
                        pool.call(ECHO, Bytes::from_static(b"ping")).await.unwrap()
                    }));
                }
                for call in calls {
                    black_box(call.await.unwrap());
                }
            });
        });
        teardown(&rt, setup);
    }
    group.finish();
}

criterion_group!(benches, bench_call_latency, bench_concurrent_calls);
criterion_main!(benches);
