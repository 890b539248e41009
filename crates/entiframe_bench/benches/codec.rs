//! Canonical CBOR benchmarks over document-shaped values.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use entiframe_bench::customer_document;
use entiframe_codec::{from_cbor, to_canonical_cbor, to_json_string};

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_document");
    for lines in [0usize, 10, 100] {
        let document = customer_document(lines);
        let size = to_canonical_cbor(&document).unwrap().len();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(lines), &document, |b, document| {
            b.iter(|| black_box(to_canonical_cbor(black_box(document)).unwrap()));
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_document");
    for lines in [0usize, 10, 100] {
        let bytes = to_canonical_cbor(&customer_document(lines)).unwrap();
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(lines), &bytes, |b, bytes| {
            b.iter(|| black_box(from_cbor(black_box(bytes)).unwrap()));
        });
    }
    group.finish();
}

fn bench_json(c: &mut Criterion) {
    let document = customer_document(10);
    c.bench_function("document_to_json", |b| {
        b.iter(|| black_box(to_json_string(black_box(&document)).unwrap()));
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_json);
criterion_main!(benches);
