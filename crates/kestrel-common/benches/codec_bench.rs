use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kestrel_common::protocol::{RpcRequest, RpcResponse};
use kestrel_common::transport::Codec;

fn request_with_payload(size: usize) -> RpcRequest {
    RpcRequest::builder("UserService", "saveBlob")
        .param(&42u64)
        .and_then(|b| b.param(&vec![7u8; size]))
        .expect("building benchmark request")
        .build()
}

fn bench_encode_request(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_request");

    for size in [16usize, 1024, 64 * 1024] {
        let request = request_with_payload(size);
        for (name, codec) in [("json", Codec::json()), ("postcard", Codec::postcard())] {
            group.bench_with_input(BenchmarkId::new(name, size), &request, |b, request| {
                b.iter(|| codec.encode_request(black_box(request)).unwrap());
            });
        }
    }

    group.finish();
}

fn bench_decode_response(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_response");
    let response = RpcResponse::success_value("bench", &vec!["user"; 128]).unwrap();

    for (name, codec) in [("json", Codec::json()), ("postcard", Codec::postcard())] {
        let encoded = codec.encode_response(&response).unwrap();
        group.bench_function(name, |b| {
            b.iter(|| Codec::decode_response(black_box(&encoded)).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode_request, bench_decode_response);
criterion_main!(benches);
