//! Arena allocator benchmarks.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use shmalloc::config::{ArenaConfig, SegmentConfig};
use shmalloc::memory::{Arena, Chunk, DynamicSegment, HeapSegment, LocalRef, migrate};

fn heap_arena(size: usize) -> Arena<HeapSegment> {
    let config = ArenaConfig::new("bench arena", "BenchCacheSize").allow_oom(true);
    Arena::create(HeapSegment::new(size).unwrap(), &config).unwrap()
}

fn bench_allocate_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("arena_allocate_free");

    // exact buckets and the overflow bucket
    for size in [24, 128, 248, 1024, 16 * 1024] {
        let mut arena = heap_arena(4 * 1024 * 1024);

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let chunk = arena.allocate(size).unwrap();
                arena.free(std::hint::black_box(chunk));
            });
        });
    }

    group.finish();
}

fn bench_fragmented(c: &mut Criterion) {
    let mut group = c.benchmark_group("arena_fragmented");

    // every other chunk freed: plenty of free chunks, none of them large
    let mut arena = heap_arena(4 * 1024 * 1024);
    let chunks: Vec<_> = (0..4096)
        .map(|i| arena.allocate(64 + (i % 24) * 8).unwrap())
        .collect();
    for (i, chunk) in chunks.into_iter().enumerate() {
        if i % 2 == 0 {
            arena.free(chunk);
        } else {
            let _ = chunk.into_offset();
        }
    }

    group.throughput(Throughput::Elements(64));
    group.bench_function("mixed_64_ops", |b| {
        b.iter(|| {
            let mut live = Vec::with_capacity(64);
            for i in 0..64 {
                live.push(arena.allocate(24 + (i % 40) * 8).unwrap());
            }
            for chunk in live {
                arena.free(chunk);
            }
        });
    });

    group.finish();
}

fn bench_reallocate(c: &mut Criterion) {
    let mut group = c.benchmark_group("arena_reallocate");

    let mut arena = heap_arena(4 * 1024 * 1024);
    group.bench_function("grow_in_place_and_shrink", |b| {
        b.iter(|| {
            let chunk = arena.allocate(64).unwrap();
            let chunk = arena.reallocate(Some(chunk), 4096).unwrap();
            let chunk = arena.reallocate(chunk, 64).unwrap();
            let _ = arena.reallocate(chunk, 0).unwrap();
        });
    });

    let mut arena = heap_arena(4 * 1024 * 1024);
    group.bench_function("grow_by_move", |b| {
        b.iter(|| {
            let chunk = arena.allocate(64).unwrap();
            let blocker = arena.allocate(24).unwrap();
            let chunk = arena.reallocate(Some(chunk), 4096).unwrap();
            arena.free(blocker);
            let _ = arena.reallocate(chunk, 0).unwrap();
        });
    });

    group.finish();
}

fn bench_shared_segment(c: &mut Criterion) {
    let mut group = c.benchmark_group("shared_segment");

    let dir = tempfile::tempdir().unwrap();
    let config = SegmentConfig::new("bench", 4 * 1024 * 1024)
        .shm_dir(dir.path())
        .arena(ArenaConfig::new("bench segment", "BenchCacheSize").allow_oom(true));
    let segment = DynamicSegment::create(config, migrate).unwrap();
    let mut local = LocalRef::new();

    group.bench_function("lock_validate_allocate_free", |b| {
        b.iter(|| {
            let guard = segment.lock().unwrap();
            let mut arena = guard.arena(&mut local).unwrap();
            let chunk = arena.allocate(128).unwrap();
            arena.free(chunk);
        });
    });

    group.bench_function("resize_1mib", |b| {
        let mut size = 1024 * 1024;
        b.iter(|| {
            // alternate so the segment does not keep growing
            size = if size == 1024 * 1024 { 2 * 1024 * 1024 } else { 1024 * 1024 };
            segment.resize(size).unwrap();
        });
    });

    group.finish();
    drop(local);
    segment.destroy().unwrap();
}

fn bench_stats(c: &mut Criterion) {
    let mut arena = heap_arena(1024 * 1024);
    for i in 0..2048 {
        let chunk = arena.allocate(24 + (i % 64) * 8).unwrap();
        if i % 3 == 0 {
            arena.free(chunk);
        } else {
            let _ = Chunk::into_offset(chunk);
        }
    }

    c.bench_function("arena_stats", |b| {
        b.iter(|| std::hint::black_box(arena.stats()));
    });
}

criterion_group!(
    benches,
    bench_allocate_free,
    bench_fragmented,
    bench_reallocate,
    bench_shared_segment,
    bench_stats
);
criterion_main!(benches);
