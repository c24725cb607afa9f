//! Commit path benchmarks over a loopback cluster.

use certrep_bench::{random_data, replicated_commit, row_key};
use certrep_core::{ClientMode, MemoryStorage, ServerConfig, ServerState, ServerStatus};
use certrep_loopback::{LoopbackConfig, LoopbackGroup, LoopbackProvider};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;

fn start_cluster(size: usize) -> Vec<Arc<ServerState>> {
    let group = LoopbackGroup::new(LoopbackConfig::default());
    (0..size)
        .map(|i| {
            let name = format!("n{i}");
            let config = ServerConfig::new().name(name.clone());
            let provider = Arc::new(LoopbackProvider::new(Arc::clone(&group), config.id, &name));
            let server = ServerState::new(config, provider);
            server.connect("loopback", &name, i == 0).unwrap();
            server.start_applier(Arc::new(MemoryStorage::new())).unwrap();
            assert!(server.wait_until_state(ServerStatus::Synced, Duration::from_secs(5)));
            server
        })
        .collect()
}

/// Benchmark a replicated commit by cluster size.
fn bench_cluster_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("loopback_commit");

    for size in [1usize, 3].iter() {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let servers = start_cluster(size);
            let storage = Arc::new(MemoryStorage::new());
            let client = servers[0]
                .open_client(ClientMode::Replicating, storage.clone())
                .unwrap();
            let data = random_data(256);
            let mut row = 0u64;

            b.iter(|| {
                row += 1;
                replicated_commit(&client, &storage, &[row_key(row)], black_box(&data)).unwrap();
            });

            for server in &servers {
                server.shutdown().unwrap();
            }
        });
    }
    group.finish();
}

criterion_group!(benches, bench_cluster_commit);
criterion_main!(benches);
