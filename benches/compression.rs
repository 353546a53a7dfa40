//! Benchmarks for Telepress compression/reconstruction performance

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use telepress::{
    distance, CodecConfig, Decompressor, DeviceCompressor, MemoryStore, Sample, Store, Window,
};

fn generate_test_data(count: usize) -> Vec<Sample> {
    (0..count)
        .map(|i| {
            let value = 20.0 + (i as f64 * 0.2).sin() * 3.0 + (i % 10) as f64 * 0.01;
            Sample::new("bench", i as u64 * 1000, value)
        })
        .collect()
}

fn compress_into(store: &MemoryStore, data: &[Sample], config: CodecConfig) {
    let mut compressor = DeviceCompressor::new("bench".into(), config).unwrap();
    for sample in data {
        for emission in compressor.push(sample.clone()).unwrap().emissions {
            store.apply(&emission.store_ops()).unwrap();
        }
    }
    if let Some(emission) = compressor.flush().unwrap() {
        store.apply(&emission.store_ops()).unwrap();
    }
}

fn bench_compression(c: &mut Criterion) {
    let mut group = c.benchmark_group("compression");

    let data = generate_test_data(10_000);
    group.throughput(Throughput::Elements(data.len() as u64));

    for window_len in [8usize, 16, 32] {
        group.bench_with_input(
            BenchmarkId::new("push_10000", window_len),
            &window_len,
            |b, &w| {
                b.iter(|| {
                    let mut compressor =
                        DeviceCompressor::new("bench".into(), CodecConfig::with_window(w, 32))
                            .unwrap();
                    for sample in &data {
                        black_box(compressor.push(sample.clone()).unwrap());
                    }
                })
            },
        );
    }

    group.finish();
}

fn bench_reconstruction(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconstruction");

    let data = generate_test_data(10_000);
    let store = MemoryStore::new();
    compress_into(&store, &data, CodecConfig::default());

    group.throughput(Throughput::Elements(data.len() as u64));
    group.bench_function("reconstruct_10000", |b| {
        b.iter(|| {
            let samples = Decompressor::new(&store)
                .collect(&"bench".into(), None)
                .unwrap();
            black_box(samples);
        })
    });

    group.finish();
}

fn bench_distance(c: &mut Criterion) {
    let mut group = c.benchmark_group("distance");

    let a = Window::new((0..32).map(|i| (i as f64 * 0.3).sin()).collect());
    let b = Window::new((0..32).map(|i| (i as f64 * 0.3).cos()).collect());

    group.bench_function("rms_32", |bench| {
        bench.iter(|| black_box(distance(black_box(a.values()), black_box(b.values()))))
    });

    group.finish();
}

criterion_group!(benches, bench_compression, bench_reconstruction, bench_distance);
criterion_main!(benches);
