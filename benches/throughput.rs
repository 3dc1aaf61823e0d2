//! Throughput benchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;

use devbench_core::core::device::search::fuzzy_find;
use devbench_core::core::protocol::{checksum, encode_frame, FrameCodec, ProtocolConfig, StreamDecoder};

fn stream(config: &ProtocolConfig, frames: usize) -> Vec<u8> {
    let payload: Vec<u8> = (0..32).collect();
    let mut data = Vec::new();
    for i in 0..frames {
        let header = config.uplink_header_for(&[0x01], &[(i % 200) as u8]);
        data.extend_from_slice(&encode_frame(config, &header, &payload));
        if i % 16 == 0 {
            data.extend_from_slice(b"\x00\x13garbage");
        }
    }
    data
}

fn codec_benchmark(c: &mut Criterion) {
    let config = Arc::new(ProtocolConfig::default());
    let codec = FrameCodec::new(config.clone());
    let data = stream(&config, 256);

    let mut group = c.benchmark_group("codec");
    group.throughput(Throughput::Bytes(data.len() as u64));

    group.bench_function("decode_stream", |b| {
        b.iter(|| {
            let (frames, rest) = codec.decode_stream(black_box(&data));
            black_box((frames.len(), rest.len()))
        })
    });

    group.bench_function("decode_fragmented", |b| {
        b.iter(|| {
            let mut decoder = StreamDecoder::new(codec.clone());
            let mut count = 0;
            for chunk in black_box(&data).chunks(7) {
                count += decoder.push(chunk).len();
            }
            black_box(count)
        })
    });

    group.bench_function("encode_command", |b| {
        let payload = [0x5a; 64];
        b.iter(|| black_box(codec.encode_command(&[0x02], &[0x10], black_box(&payload))))
    });

    group.bench_function("lrc_checksum", |b| {
        b.iter(|| black_box(checksum::calculate(black_box(&data), 1)))
    });

    group.finish();
}

fn search_benchmark(c: &mut Criterion) {
    let names: Vec<String> = (0..500)
        .map(|i| format!("{}_{}_{}", ["adv", "scan", "conn", "gatt"][i % 4], ["start", "stop", "set", "get"][(i / 4) % 4], i))
        .collect();

    let mut group = c.benchmark_group("search");

    group.bench_function("fuzzy_find", |b| {
        b.iter(|| {
            let ranked = fuzzy_find(black_box("adst"), names.iter().map(String::as_str));
            black_box(ranked.len())
        })
    });

    group.finish();
}

criterion_group!(benches, codec_benchmark, search_benchmark);
criterion_main!(benches);
