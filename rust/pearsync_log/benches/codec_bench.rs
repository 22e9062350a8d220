//! Block codec and signing benchmarks using criterion.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use pearsync_core::keys::Keypair;
use pearsync_log::block::{Block, GENESIS_HASH};

fn bench_sign_4k(c: &mut Criterion) {
    let kp = Keypair::generate();
    let payload = vec![0xabu8; 4096];

    c.bench_function("sign_4k", |b| {
        b.iter(|| {
            black_box(Block::sign(&kp, &GENESIS_HASH, 7, payload.clone()));
        });
    });
}

fn bench_verify_4k(c: &mut Criterion) {
    let kp = Keypair::generate();
    let block = Block::sign(&kp, &GENESIS_HASH, 7, vec![0xabu8; 4096]);
    let key = kp.public();

    c.bench_function("verify_4k", |b| {
        b.iter(|| {
            assert!(black_box(&block).verify(&key, &GENESIS_HASH));
        });
    });
}

fn bench_frame_round_trip(c: &mut Criterion) {
    let kp = Keypair::generate();
    let block = Block::sign(&kp, &GENESIS_HASH, u64::MAX / 2, vec![0x42u8; 16 * 1024]);

    c.bench_function("frame_encode_decode_16k", |b| {
        b.iter(|| {
            let frame = black_box(&block).encode_frame();
            black_box(Block::decode_frame(&frame).unwrap());
        });
    });
}

criterion_group!(
    benches,
    bench_sign_4k,
    bench_verify_4k,
    bench_frame_round_trip
);
criterion_main!(benches);
