use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use emberweb::ws::{apply_mask, decode_frame, encode_frame, Opcode};

fn masked_frame(payload_len: usize) -> Vec<u8> {
    let payload = vec![0x42u8; payload_len];
    let mut frame = encode_frame(Opcode::Binary, true, &payload);
    // encode_frame produces an unmasked server-side frame; flip on the
    // mask bit and apply a mask in place to exercise the client-frame
    // decode path, which is the one the reactor actually runs.
    let header_len = frame.len() - payload_len;
    frame[1] |= 0x80;
    let mask = [0x12, 0x34, 0x56, 0x78];
    frame.splice(header_len..header_len, mask.iter().copied());
    apply_mask(&mut frame[header_len + 4..], mask);
    frame
}

fn benchmark(c: &mut Criterion) {
    let sizes = [16usize, 256, 4096, 65536];

    let mut group = c.benchmark_group("decode_frame");
    for &size in sizes.iter() {
        let frame = masked_frame(size);
        group.throughput(Throughput::Bytes(frame.len() as u64));
        group.bench_with_input(BenchmarkId::new("masked", size), &frame, |b, i| {
            b.iter(|| {
                let _ = decode_frame(i);
            })
        });
    }
    group.finish();

    let mut group = c.benchmark_group("encode_frame");
    for &size in sizes.iter() {
        let payload = vec![0x42u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("binary", size), &payload, |b, i| {
            b.iter(|| encode_frame(Opcode::Binary, true, i))
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
