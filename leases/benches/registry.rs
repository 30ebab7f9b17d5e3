use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use leases::{
    lease::LeaseEntry, registry::LeaseRegistry, test_utils::TestCluster, Direction, LeaseId,
    PeerState, RebootId, ServerId,
};
use std::hint::black_box;
use tokio::runtime::Runtime;

fn entry() -> LeaseEntry {
    LeaseEntry::new(|| "bench lease".to_string(), || {})
}

fn registry_benchmark(c: &mut Criterion) {
    let peers: Vec<PeerState> = (0..16).map(|n| PeerState::new(format!("PRMR-{n}"), 1)).collect();

    c.bench_function("insert and remove across 16 peers", |b| {
        let registry = LeaseRegistry::new(Direction::LeasedFromRemote);
        b.iter(|| {
            for peer in &peers {
                let id = LeaseId::next();
                registry.insert(peer, id, entry());
                black_box(registry.remove(peer, id));
            }
        })
    });

    c.bench_function("fence 1000 leases on reboot", |b| {
        b.iter_batched(
            || {
                let registry = LeaseRegistry::new(Direction::LeasedFromRemote);
                let peer = PeerState::new("PRMR-1", 1);
                for _ in 0..1000 {
                    registry.insert(&peer, LeaseId::next(), entry());
                }
                registry
            },
            |registry| black_box(registry.apply_peer_state(&ServerId::from("PRMR-1"), Some(RebootId(2)))),
            BatchSize::SmallInput,
        )
    });
}

fn guard_benchmark(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let cluster = rt.block_on(async { TestCluster::new(2).unwrap() });
    let peer = cluster.peer(1);

    c.bench_function("require and cancel", |b| {
        b.iter(|| {
            let mut guard = cluster
                .node(0)
                .require_lease(peer.clone(), || "bench".to_string(), || {});
            guard.cancel();
        })
    });
}

criterion_group!(benches, registry_benchmark, guard_benchmark);
criterion_main!(benches);
