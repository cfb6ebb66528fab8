use criterion::{criterion_group, criterion_main, Criterion};
use quota_relay::relay::{new_correlation_id, CorrelationTable, ResponseEnvelope};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::time::Instant;

fn bench_register_resolve_deregister(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let _guard = rt.enter();
    let table = CorrelationTable::new();

    c.bench_function("correlation_register_resolve_deregister", |b| {
        b.iter(|| {
            let id = new_correlation_id();
            let mut pending = table
                .register(id, Instant::now() + Duration::from_secs(30))
                .unwrap();
            table.resolve(id, black_box(ResponseEnvelope::success(id, 200, Vec::new())));
            black_box(pending.try_settlement());
            table.deregister(id);
        })
    });
}

fn bench_contended_resolve(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("correlation_contended_64_tasks", |b| {
        b.iter(|| {
            rt.block_on(async {
                let table = Arc::new(CorrelationTable::new());
                let mut handles = Vec::with_capacity(64);
                for _ in 0..64 {
                    let table = table.clone();
                    handles.push(tokio::spawn(async move {
                        let id = new_correlation_id();
                        let mut pending = table
                            .register(id, Instant::now() + Duration::from_secs(30))
                            .unwrap();
                        table.resolve(id, ResponseEnvelope::success(id, 200, Vec::new()));
                        let settlement = pending.settled().await;
                        table.deregister(id);
                        settlement
                    }));
                }
                for handle in handles {
                    black_box(handle.await.unwrap());
                }
            })
        })
    });
}

fn bench_sweep(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let _guard = rt.enter();

    c.bench_function("correlation_sweep_1000_live", |b| {
        let table = CorrelationTable::new();
        let entries: Vec<_> = (0..1000)
            .map(|_| {
                table
                    .register(new_correlation_id(), Instant::now() + Duration::from_secs(3600))
                    .unwrap()
            })
            .collect();
        b.iter(|| black_box(table.sweep_expired()));
        drop(entries);
    });
}

criterion_group!(
    benches,
    bench_register_resolve_deregister,
    bench_contended_resolve,
    bench_sweep
);
criterion_main!(benches);
