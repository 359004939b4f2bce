//! A tiny string cache shared by several workers through one segment.
//!
//! Every worker opens the segment by name and keeps its own `LocalRef`, the
//! way separate processes would. Workers store strings in the arena and
//! publish their offsets in an index chunk. When the arena runs full the
//! worker holding the lock grows the segment; the others re-attach on their
//! next access.
//!
//! Run with: cargo run --example shared_cache

use shmalloc::config::{ArenaConfig, SegmentConfig};
use shmalloc::error::Result;
use shmalloc::memory::{Chunk, DynamicSegment, LocalRef, SegmentGuard, migrate};
use std::thread;
use tracing::Level;

const WORKERS: usize = 3;
const ENTRIES: usize = 40;

fn config(dir: &std::path::Path, size: usize) -> SegmentConfig {
    SegmentConfig::new("democache", size)
        .shm_dir(dir)
        .arena(ArenaConfig::new("demo string cache", "DemoCacheSize").allow_oom(true))
}

/// Store `text` and return its chunk, growing the segment if needed.
fn store(guard: &mut SegmentGuard<'_>, local: &mut LocalRef, text: &str) -> Result<Chunk> {
    let len = text.len() + 8;
    loop {
        let result = guard.arena(local)?.allocate(len);
        match result {
            Ok(chunk) => {
                let mut arena = guard.arena(local)?;
                let bytes = arena.bytes_mut(&chunk);
                bytes[..8].copy_from_slice(&(text.len() as u64).to_ne_bytes());
                bytes[8..len].copy_from_slice(text.as_bytes());
                return Ok(chunk);
            }
            Err(e) if e.is_out_of_memory() => {
                let grown = guard.size() * 2;
                println!("worker: arena full, growing segment to {grown} bytes");
                guard.resize(grown)?;
            }
            Err(e) => return Err(e),
        }
    }
}

fn load(bytes: &[u8]) -> String {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    let len = u64::from_ne_bytes(raw) as usize;
    String::from_utf8_lossy(&bytes[8..8 + len]).into_owned()
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("shmalloc=debug")
        .init();

    let dir = tempfile::tempdir()?;
    let segment = DynamicSegment::create(config(dir.path(), 4096), migrate)?;
    let mut local = LocalRef::new();

    // index: one offset per entry
    let index = {
        let guard = segment.lock()?;
        let mut arena = guard.arena(&mut local)?;
        let chunk = arena.allocate(WORKERS * ENTRIES * 8)?;
        arena.bytes_mut(&chunk).fill(0);
        chunk.into_offset()
    };

    let workers: Vec<_> = (0..WORKERS)
        .map(|worker| -> Result<_> {
            let segment = DynamicSegment::open(config(dir.path(), 0), migrate)?;
            Ok(thread::spawn(move || -> Result<()> {
                let mut local = LocalRef::new();
                for entry in 0..ENTRIES {
                    let text = format!("worker {worker} entry {entry}: {}", "*".repeat(entry));
                    let mut guard = segment.lock()?;
                    let chunk = store(&mut guard, &mut local, &text)?;

                    let slot = (worker * ENTRIES + entry) * 8;
                    let offset = chunk.into_offset() as u64;
                    let mut arena = guard.arena(&mut local)?;
                    arena.bytes_mut(&Chunk::from_offset(index))[slot..slot + 8]
                        .copy_from_slice(&offset.to_ne_bytes());
                }
                Ok(())
            }))
        })
        .collect::<Result<_>>()?;

    for worker in workers {
        worker.join().expect("worker panicked")?;
    }

    let guard = segment.lock()?;
    println!(
        "segment generation {}, {} bytes",
        guard.identity().map_or(0, |id| id.get()),
        guard.size()
    );

    let arena = guard.arena(&mut local)?;
    let table = arena.bytes(&Chunk::from_offset(index)).to_vec();
    for worker in 0..WORKERS {
        let slot = (worker * ENTRIES + ENTRIES - 1) * 8;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&table[slot..slot + 8]);
        let offset = u64::from_ne_bytes(raw) as usize;
        let text = load(arena.bytes(&Chunk::from_offset(offset)));
        println!("last entry of worker {worker}: {text}");
    }

    arena.dump_stats(Level::INFO);
    drop(arena);
    drop(guard);

    segment.destroy()?;
    Ok(())
}
