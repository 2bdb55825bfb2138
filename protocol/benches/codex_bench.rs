// Cryptographic codec benchmarks for Kestrel.
//
// Covers identity signing and verification, the X25519 session exchange,
// AES-256-GCM sealing of link-sized payloads, and BLAKE3 merkle roots.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use kestrel_protocol::crypto::hash::{blake3_hash, merkle_root};
use kestrel_protocol::crypto::{
    compute_shared_secret, decrypt, encrypt, sign, verify_peer, EphemeralKeypair, NodeKeypair,
};

fn bench_sign(c: &mut Criterion) {
    let keypair = NodeKeypair::generate();
    let message = b"kestrel handshake; nonce=42";

    c.bench_function("codex/sign", |b| {
        b.iter(|| sign(&keypair, black_box(message)));
    });
}

fn bench_verify_peer(c: &mut Criterion) {
    let keypair = NodeKeypair::generate();
    let peer = keypair.peer_id();
    let message = b"kestrel handshake; nonce=42";
    let signature = sign(&keypair, message);

    c.bench_function("codex/verify_peer", |b| {
        b.iter(|| verify_peer(&peer, black_box(message), &signature));
    });
}

fn bench_session_exchange(c: &mut Criterion) {
    c.bench_function("codex/session_exchange", |b| {
        b.iter(|| {
            let mut ours = EphemeralKeypair::generate();
            let theirs = EphemeralKeypair::generate();
            compute_shared_secret(&mut ours, &theirs.public_key_bytes())
        });
    });
}

fn bench_seal(c: &mut Criterion) {
    let mut ours = EphemeralKeypair::generate();
    let theirs = EphemeralKeypair::generate();
    let key = compute_shared_secret(&mut ours, &theirs.public_key_bytes()).unwrap();

    let mut group = c.benchmark_group("codex/seal");
    for size in [256usize, 4 * 1024, 64 * 1024] {
        let payload = vec![0x5au8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("encrypt", size), &payload, |b, payload| {
            b.iter(|| encrypt(key.as_bytes(), payload).unwrap());
        });

        let sealed = encrypt(key.as_bytes(), &payload).unwrap();
        group.bench_with_input(BenchmarkId::new("decrypt", size), &sealed, |b, sealed| {
            b.iter(|| decrypt(key.as_bytes(), sealed).unwrap());
        });
    }
    group.finish();
}

fn bench_merkle_root(c: &mut Criterion) {
    let mut group = c.benchmark_group("codex/merkle_root");
    for count in [16usize, 256, 4096] {
        let leaves: Vec<_> = (0..count as u64).map(|i| blake3_hash(&i.to_le_bytes())).collect();
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &leaves, |b, leaves| {
            b.iter(|| merkle_root(leaves));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_sign,
    bench_verify_peer,
    bench_session_exchange,
    bench_seal,
    bench_merkle_root,
);
criterion_main!(benches);
