//! Allocator properties checked against the public arena API.
//!
//! Fatal paths terminate the process, so they run in a child process that
//! re-executes this test binary with a marker variable set.

use shmalloc::config::ArenaConfig;
use shmalloc::memory::{Arena, Chunk, HeapSegment, arena_overhead, required_chunk_size};
use std::process::Command;

const CHILD_ENV: &str = "SHMALLOC_TEST_CHILD";

fn config() -> ArenaConfig {
    ArenaConfig::new("property test", "PropertyCacheSize").allow_oom(true)
}

/// Arena whose initial free chunk holds exactly `capacity` bytes.
fn arena(capacity: usize) -> Arena<Vec<u8>> {
    let config = config();
    let len = arena_overhead(&config.description, &config.origin) + capacity;
    Arena::create(vec![0u8; len], &config).unwrap()
}

fn assert_consistent<B: AsRef<[u8]>>(arena: &Arena<B>) {
    let stats = arena.stats();
    assert_eq!(
        stats.used_size + stats.free_size + stats.overhead,
        arena.total_size(),
        "accounting invariant broken"
    );
}

/// Run the calling test again in a child process and return its exit code.
fn run_in_child(test_name: &str) -> Option<i32> {
    let status = Command::new(std::env::current_exe().unwrap())
        .args(["--exact", test_name, "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, "1")
        .status()
        .unwrap();
    status.code()
}

fn is_child() -> bool {
    std::env::var_os(CHILD_ENV).is_some()
}

/// Small deterministic generator for operation sequences.
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

// ============================================================================
// Allocation and free
// ============================================================================

#[test]
fn test_round_trip_restores_free_size() {
    let mut arena = arena(1024);
    let _pinned = arena.allocate(48).unwrap();
    let free = arena.free_size();
    let capacity = free;

    for size in 1..=capacity {
        let chunk = arena.allocate(size).unwrap();
        assert!(arena.chunk_size(&chunk) >= size);
        arena.free(chunk);
        assert_eq!(arena.free_size(), free, "size {size}");
    }
    assert_consistent(&arena);
}

#[test]
fn test_live_chunks_never_overlap() {
    let mut arena = arena(16 * 1024);
    let mut rng = XorShift(0x9E37_79B9_7F4A_7C15);
    let mut live: Vec<(usize, usize)> = Vec::new();

    for step in 0..5_000 {
        if live.is_empty() || rng.below(3) != 0 {
            let size = 1 + rng.below(600);
            if let Ok(chunk) = arena.allocate(size) {
                let start = chunk.offset();
                let end = start + arena.chunk_size(&chunk);
                for &(other_start, other_end) in &live {
                    assert!(
                        end <= other_start || other_end <= start,
                        "step {step}: {start}..{end} overlaps {other_start}..{other_end}"
                    );
                }
                live.push((start, end));
            }
        } else {
            let (start, _) = live.swap_remove(rng.below(live.len()));
            arena.free(Chunk::from_offset(start));
        }
        assert_consistent(&arena);
    }

    for (start, _) in live {
        arena.free(Chunk::from_offset(start));
    }
    assert_eq!(arena.used_size(), 0);
    assert_eq!(arena.stats().free_chunks, 1);
}

#[test]
fn test_contents_survive_neighbour_traffic() {
    let mut arena = arena(8 * 1024);
    let mut chunks = Vec::new();
    for i in 0..20u8 {
        let chunk = arena.allocate(64 + i as usize * 8).unwrap();
        arena.bytes_mut(&chunk).fill(i);
        chunks.push(chunk);
    }

    // free every other chunk; the survivors must be untouched
    let mut kept = Vec::new();
    for (i, chunk) in chunks.into_iter().enumerate() {
        if i % 2 == 0 {
            arena.free(chunk);
        } else {
            kept.push((i as u8, chunk));
        }
    }
    for _ in 0..10 {
        let _ = arena.allocate(40).unwrap().into_offset();
    }
    for (i, chunk) in &kept {
        assert!(arena.bytes(chunk).iter().all(|b| b == i));
    }
}

// ============================================================================
// Coalescing and buckets
// ============================================================================

fn coalescing_fixture() -> (Arena<Vec<u8>>, Chunk, Chunk) {
    let mut arena = arena(1024);
    let a = arena.allocate(200).unwrap();
    let b = arena.allocate(200).unwrap();
    // fill the rest so only a and b can provide space
    let rest = arena.free_size();
    let _rest = arena.allocate(rest).unwrap().into_offset();
    assert_eq!(arena.free_size(), 0);
    (arena, a, b)
}

#[test]
fn test_coalescing_left_then_right() {
    let (mut arena, a, b) = coalescing_fixture();
    arena.free(a);
    arena.free(b);
    let merged = arena.allocate(200 + 200 + 16).unwrap();
    assert_eq!(arena.chunk_size(&merged), 416);
    assert_consistent(&arena);
}

#[test]
fn test_coalescing_right_then_left() {
    let (mut arena, a, b) = coalescing_fixture();
    arena.free(b);
    arena.free(a);
    let merged = arena.allocate(200 + 200 + 16).unwrap();
    assert_eq!(arena.chunk_size(&merged), 416);
    assert_consistent(&arena);
}

#[test]
fn test_freed_32_bytes_served_from_bucket() {
    let mut arena = arena(4096);
    let chunk = arena.allocate(32).unwrap();
    let _blocker = arena.allocate(32).unwrap();
    let offset = chunk.offset();

    arena.free(chunk);
    assert_eq!(arena.stats().chunks_num[1], 1);

    let again = arena.allocate(32).unwrap();
    assert_eq!(again.offset(), offset);
    assert_eq!(arena.stats().chunks_num[1], 0);
}

#[test]
fn test_scenario_bucket_reuse() {
    let mut arena = arena(1024);
    let a = arena.allocate(40).unwrap();
    assert_eq!(arena.chunk_size(&a), 40);
    let a_offset = a.offset();

    let b = arena.allocate(300).unwrap();
    assert_eq!(arena.chunk_size(&b), 304);

    arena.free(a);
    assert_eq!(arena.stats().used_size, 304);

    let again = arena.allocate(40).unwrap();
    assert_eq!(again.offset(), a_offset);
    assert_eq!(arena.used_size(), 304 + 40);
}

#[test]
fn test_clear_after_use() {
    let mut arena = arena(2048);
    for size in [24, 100, 300, 700] {
        let _ = arena.allocate(size).unwrap().into_offset();
    }
    arena.clear();
    let whole = arena.allocate(2048).unwrap();
    assert_eq!(arena.chunk_size(&whole), 2048);
}

#[test]
fn test_required_chunk_size_matches_consumption() {
    let mut arena = arena(4096);
    let free = arena.free_size();
    let _chunk = arena.allocate(77).unwrap();
    // the split remainder loses exactly one chunk's worth
    assert_eq!(free - arena.free_size(), required_chunk_size(77));
}

#[test]
fn test_arena_on_heap_segment() {
    let segment = HeapSegment::new(8192).unwrap();
    let mut arena = Arena::create(segment, &config()).unwrap();
    let chunk = arena.allocate(1000).unwrap();
    arena.bytes_mut(&chunk)[999] = 1;
    arena.free(chunk);
    assert_eq!(arena.used_size(), 0);
}

// ============================================================================
// Exhaustion policy
// ============================================================================

#[test]
fn test_exhaustion_with_allow_oom_is_recoverable() {
    let mut arena = arena(1024);
    let _a = arena.allocate(500).unwrap();
    let (used, free) = (arena.used_size(), arena.free_size());

    let err = arena.allocate(600).unwrap_err();
    assert!(err.is_out_of_memory());
    assert!(err.to_string().contains("PropertyCacheSize"));
    assert_eq!(arena.used_size(), used);
    assert_eq!(arena.free_size(), free);

    // smaller requests still work
    assert!(arena.allocate(100).is_ok());
}

#[test]
fn test_exhaustion_without_allow_oom_is_fatal() {
    if is_child() {
        let config = ArenaConfig::new("fatal test", "FatalCacheSize");
        let mut arena = Arena::create(vec![0u8; 2048], &config).unwrap();
        let _ = arena.allocate(1 << 20);
        return;
    }
    assert_eq!(
        run_in_child("test_exhaustion_without_allow_oom_is_fatal"),
        Some(1)
    );
}

#[test]
fn test_double_free_is_fatal() {
    if is_child() {
        let mut arena = arena(1024);
        let _blocker = arena.allocate(64).unwrap();
        let chunk = arena.allocate(64).unwrap();
        let offset = chunk.offset();
        arena.free(chunk);
        arena.free(Chunk::from_offset(offset));
        return;
    }
    assert_eq!(run_in_child("test_double_free_is_fatal"), Some(1));
}

#[test]
fn test_foreign_chunk_is_fatal() {
    if is_child() {
        let mut arena = arena(1024);
        arena.free(Chunk::from_offset(3));
        return;
    }
    assert_eq!(run_in_child("test_foreign_chunk_is_fatal"), Some(1));
}
