use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use inference_spool::config::SpoolConfig;
use inference_spool::spool::engine::EchoEngine;
use inference_spool::spool::protocol::{Detection, InferOptions, InferenceOutput, RequestBody};
use inference_spool::spool::reader::{ReadPolicy, read_claimed};
use inference_spool::spool::{ResponseWriter, SpoolDaemon, SpoolResponse, try_claim};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// =============================================================================
// Protocol primitives
// =============================================================================

/// Claim + release of one request: two renames' worth of metadata work.
fn bench_claim_release(c: &mut Criterion) {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();

    c.bench_function("claim_release", |b| {
        b.iter(|| {
            std::fs::write(dir.join("bench.json"), b"{}").unwrap();
            let claim = try_claim(dir, "bench").unwrap();
            drop(black_box(claim));
        })
    });
}

/// Atomic publish (stage, fsync, rename, dir fsync) across payload sizes.
fn bench_publish(c: &mut Criterion) {
    let tmp = TempDir::new().unwrap();
    let writer = ResponseWriter::new(tmp.path());
    let mut group = c.benchmark_group("publish");

    for size in [1024usize, 64 * 1024, 1024 * 1024] {
        let response = SpoolResponse::success(
            "bench",
            "bench",
            InferenceOutput {
                detections: vec![Detection {
                    payload: vec![7; size],
                    confidence: 0.9,
                    bbox: [0, 0, 32, 32],
                }],
                original_size: Some([640, 480]),
            },
            1,
        );
        group.bench_with_input(BenchmarkId::from_parameter(size), &response, |b, resp| {
            b.iter(|| writer.publish("bench", black_box(resp)).unwrap())
        });
    }
    group.finish();
}

/// Parse + decode of a claimed request with a realistically sized image.
fn bench_read_claimed(c: &mut Criterion) {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("bench.processing");
    let body = RequestBody::new(&vec![42u8; 256 * 1024], InferOptions::default());
    std::fs::write(&path, serde_json::to_vec(&body).unwrap()).unwrap();
    let policy = ReadPolicy::default();

    c.bench_function("read_claimed_256k", |b| {
        b.iter(|| black_box(read_claimed(&path, "bench", &policy)))
    });
}

// =============================================================================
// Full cycle
// =============================================================================

/// One tick over a backlog of small requests with the echo engine.
fn bench_tick_backlog(c: &mut Criterion) {
    let tmp = TempDir::new().unwrap();
    let config = SpoolConfig {
        request_dir: tmp.path().join("req"),
        response_dir: tmp.path().join("resp"),
        stale_after: Duration::ZERO,
        ..SpoolConfig::default()
    };
    std::fs::create_dir_all(&config.request_dir).unwrap();
    let daemon = SpoolDaemon::new(config.clone(), Arc::new(EchoEngine));
    let body = serde_json::to_vec(&RequestBody::new(b"payload", InferOptions::default())).unwrap();

    c.bench_function("tick_backlog_32", |b| {
        b.iter(|| {
            for i in 0..32 {
                std::fs::write(config.request_dir.join(format!("r{i}.json")), &body).unwrap();
            }
            black_box(daemon.tick().unwrap())
        })
    });
}

criterion_group!(
    benches,
    bench_claim_release,
    bench_publish,
    bench_read_claimed,
    bench_tick_backlog,
);

criterion_main!(benches);
