use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use serde_json::json;

use relq_core::Package;

fn payload(fields: usize) -> serde_json::Value {
    let map = (0..fields)
        .map(|i| (format!("field_{i}"), json!(format!("value-{i}"))))
        .collect::<serde_json::Map<_, _>>();
    serde_json::Value::Object(map)
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("package_codec");

    for fields in [1usize, 16, 256] {
        let package = Package::new("bench", payload(fields), 0);
        let raw = package.encode().unwrap();
        group.throughput(Throughput::Bytes(raw.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", fields), &package, |b, p| {
            b.iter(|| black_box(p.encode().unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("decode", fields), &raw, |b, raw| {
            b.iter(|| black_box(Package::decode(raw).unwrap()))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_codec);
criterion_main!(benches);
