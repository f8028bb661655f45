use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use nbmap::{BoxKeys, Map};

fn word<T>(r: &T) -> *mut () {
    r as *const T as *mut ()
}

fn get(c: &mut Criterion) {
    let map = Map::with_keys(BoxKeys::<u64>::default());

    let values: Vec<u64> = (0..1024).collect();
    for (i, v) in values.iter().enumerate() {
        unsafe { map.put(BoxKeys::alloc(i as u64), word(v)) };
    }

    c.bench_function("get", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i = (i + 1) & 1023;
            black_box(unsafe { map.get(word(&i)) });
        })
    });
}

fn put(c: &mut Criterion) {
    let map = Map::with_keys(BoxKeys::<u64>::default());
    let value = 0u64;

    c.bench_function("put", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i = (i + 1) & 4095;
            black_box(unsafe { map.put(BoxKeys::alloc(i), word(&value)) });
        })
    });
}

fn update(c: &mut Criterion) {
    let map = Map::with_keys(BoxKeys::<u64>::default());
    let values: Vec<u64> = (0..2).collect();

    unsafe { map.put(BoxKeys::alloc(1u64), word(&values[0])) };

    c.bench_function("update", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i = (i + 1) & 1;
            black_box(unsafe { map.put(BoxKeys::alloc(1u64), word(&values[i])) });
        })
    });
}

criterion_group!(benches, get, put, update);
criterion_main!(benches);
