use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use nfp_cpp_proxy::{
    cpp::{target, ACTION_RW, MEMIO_BOUNDARY},
    plan_chunks, AreaAllocator, CppId, SimulatedDevice, TransferEngine, WindowManager, AREA_AUTO,
};

fn mu() -> CppId {
    CppId::new(target::MU, ACTION_RW, 0)
}

fn benchmark_transfer(c: &mut Criterion) {
    let mut group = c.benchmark_group("TransferEngine");

    for size in [64usize, 1024, 16 * 1024].iter() {
        group.throughput(Throughput::Bytes(*size as u64));

        group.bench_with_input(BenchmarkId::new("write", size), size, |b, &size| {
            let mut windows = WindowManager::discover(Box::new(SimulatedDevice::nfp6000())).unwrap();
            let engine = TransferEngine::new();
            let data = vec![0xa5u8; size];

            b.iter(|| engine.write(&mut windows, mu(), 0x1000, &data).unwrap());
        });

        group.bench_with_input(BenchmarkId::new("read", size), size, |b, &size| {
            let mut windows = WindowManager::discover(Box::new(SimulatedDevice::nfp6000())).unwrap();
            let engine = TransferEngine::new();
            let mut buf = vec![0u8; size];

            b.iter(|| engine.read(&mut windows, mu(), 0x1000, &mut buf).unwrap());
        });
    }

    group.finish();
}

fn benchmark_chunk_planning(c: &mut Criterion) {
    c.bench_function("plan_chunks_64mb", |b| {
        b.iter(|| plan_chunks(MEMIO_BOUNDARY / 2, 64 * MEMIO_BOUNDARY).count())
    });
}

fn benchmark_area_churn(c: &mut Criterion) {
    c.bench_function("area_request_release", |b| {
        let mut windows = WindowManager::discover(Box::new(SimulatedDevice::nfp6000())).unwrap();
        let mut areas = AreaAllocator::new(4096).unwrap();
        // Fragment the offset space so the gap search has work to do
        for n in 0..64u64 {
            areas
                .request(&mut windows, n * 2 * 4096, mu(), 0, 4096, 1)
                .unwrap();
        }

        b.iter(|| {
            let offset = areas
                .request(&mut windows, AREA_AUTO, mu(), 0, 2 * 4096, 1)
                .unwrap();
            areas.release(&mut windows, offset).unwrap();
        });
    });
}

criterion_group!(
    benches,
    benchmark_transfer,
    benchmark_chunk_planning,
    benchmark_area_churn
);
criterion_main!(benches);
