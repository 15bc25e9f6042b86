use criterion::{black_box, criterion_group, criterion_main, Criterion};
use deltalink_core::frame::{decode_from_length, encode_with_length};

fn frame_benchmark(c: &mut Criterion) {
    let fields: Vec<String> = (0..32).map(|i| format!("field-{i},with:delims")).collect();
    let encoded = encode_with_length(&fields);

    c.bench_function("frame_encode_32", |b| {
        b.iter(|| encode_with_length(black_box(&fields)))
    });
    c.bench_function("frame_decode_32", |b| {
        b.iter(|| decode_from_length(black_box(&encoded), 32))
    });
}

criterion_group!(benches, frame_benchmark);
criterion_main!(benches);
