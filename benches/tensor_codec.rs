//! Tensor wire codec benchmarks
//!
//! Measures the client-side cost of marshalling requests:
//! - HTTP binary extension encode/decode for growing tensor sizes
//! - gRPC request building with raw input contents
//! - Batch axis handling used by sample inference

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use infer_client::transport::http::codec;
use infer_client::transport::{InferOptions, InferRequest, InferResponse};
use infer_client::{ModelIdentity, Tensor, TensorSet};
use std::hint::black_box;

const SIZES: [usize; 3] = [128, 4096, 262_144];

fn request(len: usize) -> InferRequest {
    let values: Vec<f32> = (0..len).map(|i| i as f32 * 0.5).collect();
    InferRequest {
        model: ModelIdentity::new("bench", None).unwrap(),
        id: "0".to_string(),
        inputs: TensorSet::new()
            .with("INPUT0", Tensor::from_slice(&[1, len], &values).unwrap())
            .with("INPUT1", Tensor::from_slice(&[1, len], &values).unwrap()),
        outputs: vec!["OUTPUT0".to_string(), "OUTPUT1".to_string()],
        options: InferOptions::default(),
        timeout: None,
    }
}

fn bench_http_encode_request(c: &mut Criterion) {
    let mut group = c.benchmark_group("http_encode_request");

    for len in SIZES {
        let request = request(len);
        group.throughput(Throughput::Bytes((len * 4 * 2) as u64));
        group.bench_with_input(BenchmarkId::new("elements", len), &request, |b, request| {
            b.iter(|| codec::encode_request(black_box(request)).unwrap());
        });
    }
    group.finish();
}

fn bench_http_decode_response(c: &mut Criterion) {
    let mut group = c.benchmark_group("http_decode_response");

    for len in SIZES {
        let request = request(len);
        let response = InferResponse {
            model_name: "bench".to_string(),
            model_version: "1".to_string(),
            id: "0".to_string(),
            outputs: request
                .inputs
                .iter()
                .zip(&request.outputs)
                .map(|((_, tensor), name)| (name.clone(), tensor.clone()))
                .collect(),
        };
        let (body, header_length) = codec::encode_response(&response).unwrap();

        group.throughput(Throughput::Bytes(body.len() as u64));
        group.bench_with_input(BenchmarkId::new("elements", len), &body, |b, body| {
            b.iter(|| codec::decode_response(black_box(body), Some(header_length)).unwrap());
        });
    }
    group.finish();
}

fn bench_grpc_encode_request(c: &mut Criterion) {
    let mut group = c.benchmark_group("grpc_encode_request");

    for len in SIZES {
        let request = request(len);
        group.throughput(Throughput::Bytes((len * 4 * 2) as u64));
        group.bench_with_input(BenchmarkId::new("elements", len), &request, |b, request| {
            b.iter(|| infer_client::transport::grpc::encode_request(black_box(request)).unwrap());
        });
    }
    group.finish();
}

fn bench_batch_axis(c: &mut Criterion) {
    let tensor = Tensor::from_vec(vec![1i64; 1024]);

    c.bench_function("batch_axis_round_trip", |b| {
        b.iter(|| {
            black_box(tensor.clone())
                .with_batch_axis()
                .without_batch_axis()
                .unwrap()
        });
    });
}

criterion_group!(
    benches,
    bench_http_encode_request,
    bench_http_decode_response,
    bench_grpc_encode_request,
    bench_batch_axis
);
criterion_main!(benches);
