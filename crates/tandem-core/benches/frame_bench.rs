use std::sync::Arc;

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use tandem_codec::Identity;
use tandem_core::slic::{FrameType, decode_header, encode_header};
use tandem_core::{
    CancelSignal, Connection, ConnectionOptions, IncomingRequest, OutgoingRequest, encapsulate,
};
use tandem_transport::{DEFAULT_MEMORY_BUFFER, memory_pair};

const MAX_FRAME: usize = 1 << 20;

fn bench_header(c: &mut Criterion) {
    let mut group = c.benchmark_group("slic_header");

    group.bench_function("encode_stream_header", |b| {
        b.iter(|| encode_header(black_box(FrameType::Stream), black_box(Some(1024)), black_box(32 * 1024)))
    });

    let header = encode_header(FrameType::StreamLast, Some(1024), 32 * 1024).unwrap();
    group.bench_function("decode_stream_header", |b| {
        b.iter(|| decode_header(black_box(&header), MAX_FRAME))
    });

    group.finish();
}

fn payload(size: usize) -> bytes::Bytes {
    let data = vec![0x5A; size];
    encapsulate(|out| {
        out.write_byte_seq(&data);
        Ok(())
    })
    .unwrap()
}

fn bench_request_frame(c: &mut Criterion) {
    let sizes: Vec<(usize, &str)> = vec![(64, "64_bytes"), (1024, "1024_bytes"), (16 * 1024, "16_kib")];

    let mut group = c.benchmark_group("request_frame");
    for (size, name) in sizes {
        let request = OutgoingRequest::new(Identity::new("bench"), "echo", payload(size))
            .with_context("trace", "0123456789abcdef");
        let frame = request.encode().unwrap();
        group.throughput(Throughput::Bytes(frame.len() as u64));

        group.bench_function(format!("encode_{name}"), |b| b.iter(|| black_box(&request).encode()));
        group.bench_function(format!("decode_{name}"), |b| {
            b.iter(|| IncomingRequest::decode(black_box(&frame), false))
        });
    }
    group.finish();
}

fn bench_invoke(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let (client, _server) = runtime.block_on(async {
        let (a, b) = memory_pair(DEFAULT_MEMORY_BUFFER);
        let server = Connection::accept(Arc::new(b), ConnectionOptions::default(), None);
        let client = Connection::connect(Arc::new(a), ConnectionOptions::default(), None);
        let (client, server) = tokio::join!(client, server);
        (client.unwrap(), server.unwrap())
    });

    let mut group = c.benchmark_group("invoke");
    for size in [64usize, 64 * 1024] {
        let request = OutgoingRequest::new(Identity::new("missing"), "echo", payload(size));
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("memory_round_trip_{size}"), |b| {
            b.iter(|| {
                runtime
                    .block_on(client.invoke(black_box(&request), CancelSignal::never()))
                    .unwrap()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_header, bench_request_frame, bench_invoke);
criterion_main!(benches);
