use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use sealfs::crypto::{decrypt_stream, encrypt_stream, MasterKey, KEY_SIZE};
use std::io::Cursor;
use zeroize::Zeroizing;

fn bench_key() -> MasterKey {
    MasterKey::from_bytes(Zeroizing::new([7u8; KEY_SIZE]))
}

pub fn seal(c: &mut Criterion) {
    let key = bench_key();
    let data = vec![0x5au8; 1024 * 1024];

    let mut group = c.benchmark_group("seal");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("encrypt 1 MiB", |b| {
        b.iter(|| {
            let mut out = Vec::with_capacity(data.len() + 4096);
            encrypt_stream(&mut Cursor::new(black_box(&data)), &mut out, &key).unwrap();
            out
        })
    });
    group.finish();
}

pub fn open(c: &mut Criterion) {
    let key = bench_key();
    let data = vec![0x5au8; 1024 * 1024];
    let mut sealed = Vec::new();
    encrypt_stream(&mut Cursor::new(&data), &mut sealed, &key).unwrap();

    let mut group = c.benchmark_group("open");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("decrypt 1 MiB", |b| {
        b.iter(|| {
            let mut out = Vec::with_capacity(data.len());
            decrypt_stream(&mut Cursor::new(black_box(&sealed)), &mut out, &key).unwrap();
            out
        })
    });
    group.finish();
}

criterion_group!(benches, seal, open);
criterion_main!(benches);
