//! Benchmarks for collective signature primitives
//!
//! Benchmarks:
//! - BLS signing and verification
//! - Signature aggregation
//! - Mask updates (aggregate public key recomputation)
//! - Final signature verification

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use cosi_signer::{
    aggregate_signatures, append_signature_and_mask, verify, BlsKeyPair, BlsPublicKey,
    BlsSignature, BlsSuite, Mask, ThresholdPolicy,
};

const MESSAGE: &[u8] = b"collective statement: block=42";

fn keypairs(n: usize) -> Vec<BlsKeyPair> {
    (0..n)
        .map(|i| {
            let mut seed = [0u8; 32];
            seed[..8].copy_from_slice(&(i as u64).to_le_bytes());
            BlsKeyPair::from_seed(&seed).unwrap()
        })
        .collect()
}

/// Benchmark BLS signing
fn bench_bls_signing(c: &mut Criterion) {
    let suite = BlsSuite::default();
    let kp = BlsKeyPair::generate().unwrap();

    c.bench_function("bls_sign", |b| {
        b.iter(|| black_box(suite.sign(&kp.secret, black_box(MESSAGE))))
    });
}

/// Benchmark BLS verification
fn bench_bls_verification(c: &mut Criterion) {
    let suite = BlsSuite::default();
    let kp = BlsKeyPair::generate().unwrap();
    let sig = suite.sign(&kp.secret, MESSAGE);

    c.bench_function("bls_verify", |b| {
        b.iter(|| black_box(suite.verify(&kp.public, black_box(MESSAGE), black_box(&sig))))
    });
}

/// Benchmark signature aggregation with varying signer counts
fn bench_signature_aggregation(c: &mut Criterion) {
    let suite = BlsSuite::default();
    let mut group = c.benchmark_group("signature_aggregation");

    for count in [5, 25, 100] {
        let sigs: Vec<BlsSignature> = keypairs(count)
            .iter()
            .map(|kp| suite.sign(&kp.secret, MESSAGE))
            .collect();

        group.bench_with_input(BenchmarkId::from_parameter(count), &sigs, |b, sigs| {
            b.iter(|| black_box(aggregate_signatures(black_box(sigs))))
        });
    }

    group.finish();
}

/// Benchmark mask replacement, which recomputes the aggregate key
fn bench_mask_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("mask_set");

    for count in [25, 100] {
        let publics: Vec<BlsPublicKey> = keypairs(count).into_iter().map(|kp| kp.public).collect();
        let mut mask = Mask::new(&publics, None).unwrap();
        for i in (0..count).step_by(2) {
            mask.set_index(i, true).unwrap();
        }
        let bits = mask.mask().to_vec();

        group.bench_function(BenchmarkId::from_parameter(count), |b| {
            b.iter(|| black_box(mask.set_mask(black_box(&bits))))
        });
    }

    group.finish();
}

/// Benchmark verification of a final signature signed by every participant
fn bench_final_verification(c: &mut Criterion) {
    let suite = BlsSuite::default();
    let pairs = keypairs(25);
    let publics: Vec<BlsPublicKey> = pairs.iter().map(|kp| kp.public.clone()).collect();

    let sigs: Vec<BlsSignature> = pairs.iter().map(|kp| suite.sign(&kp.secret, MESSAGE)).collect();
    let mut mask = Mask::new(&publics, None).unwrap();
    for i in 0..publics.len() {
        mask.set_index(i, true).unwrap();
    }
    let final_sig = append_signature_and_mask(&aggregate_signatures(&sigs).unwrap(), &mask);
    let policy = ThresholdPolicy::new(17);

    c.bench_function("final_verify_25", |b| {
        b.iter(|| black_box(verify(&suite, &publics, MESSAGE, black_box(&final_sig), &policy)))
    });
}

criterion_group!(
    benches,
    bench_bls_signing,
    bench_bls_verification,
    bench_signature_aggregation,
    bench_mask_set,
    bench_final_verification,
);

criterion_main!(benches);
