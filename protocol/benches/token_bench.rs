// Token benchmarks: minting (issuer signature), verification, division, coin
// selection, and batch signature checks at a few sizes.

use chrono::{Duration, Utc};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use otm_protocol::crypto::{batch_verify, Keypair};
use otm_protocol::token::{self, DelegatedDivider, DelegationCertificate, Token, TokenId};
use otm_protocol::wallet::{selection, Candidate};

fn bench_mint(c: &mut Criterion) {
    let issuer = Keypair::generate();
    let owner = Keypair::generate().public_key();
    let expiry = Utc::now() + Duration::days(30);

    c.bench_function("token/mint", |b| {
        b.iter(|| Token::mint(owner, 10_000, expiry, &issuer).unwrap());
    });
}

fn bench_verify(c: &mut Criterion) {
    let issuer = Keypair::generate();
    let owner = Keypair::generate().public_key();
    let token = Token::mint(owner, 10_000, Utc::now() + Duration::days(30), &issuer).unwrap();
    let issuer_pk = issuer.public_key();

    c.bench_function("token/verify_signature", |b| {
        b.iter(|| token::verify_signature(&token, &issuer_pk));
    });
}

fn bench_divide(c: &mut Criterion) {
    let issuer = Keypair::generate();
    let holder = Keypair::generate().public_key();
    let now = Utc::now();
    let expiry = now + Duration::days(30);
    let parent = Token::mint(holder, 10_000, expiry, &issuer).unwrap();

    c.bench_function("token/divide_issuer", |b| {
        b.iter(|| {
            let mut t = parent.clone();
            token::divide(&mut t, 3_000, &issuer, now).unwrap()
        });
    });

    let delegate = Keypair::generate();
    let cert = DelegationCertificate::issue(&issuer, holder, delegate.public_key(), expiry);
    let divider = DelegatedDivider::new(delegate, cert).unwrap();
    c.bench_function("token/divide_delegated", |b| {
        b.iter(|| {
            let mut t = parent.clone();
            token::divide(&mut t, 3_000, &divider, now).unwrap()
        });
    });
}

fn bench_select(c: &mut Criterion) {
    let mut group = c.benchmark_group("wallet/select");

    for size in [8, 64, 512] {
        let candidates: Vec<Candidate> = (0..size)
            .map(|i| Candidate {
                id: TokenId::random(),
                amount: [5, 10, 20, 50, 100][i % 5],
                divisible: i % 3 == 0,
            })
            .collect();
        let target = candidates.iter().map(|c| c.amount).sum::<u64>() / 2 + 3;

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &candidates, |b, cands| {
            b.iter(|| selection::select(cands, target));
        });
    }

    group.finish();
}

fn bench_batch_verify(c: &mut Criterion) {
    let mut group = c.benchmark_group("token/batch_verify");
    let issuer = Keypair::generate();
    let owner = Keypair::generate().public_key();
    let expiry = Utc::now() + Duration::days(30);

    for size in [16, 128, 512] {
        let items: Vec<_> = (0..size)
            .map(|i| {
                let t = Token::mint(owner, 100 + i as u64, expiry, &issuer).unwrap();
                (issuer.public_key(), t.canonical_bytes(), t.issuer_signature)
            })
            .collect();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &items, |b, items| {
            b.iter(|| batch_verify(items).unwrap());
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_mint,
    bench_verify,
    bench_divide,
    bench_select,
    bench_batch_verify
);
criterion_main!(benches);
