//! Arena usage statistics.

use super::bucket::{BUCKET_COUNT, CHUNK_OVERHEAD, OVERFLOW_BUCKET, bucket_size};
use std::fmt;
use tracing::Level;

/// Read-only snapshot of an arena's occupancy.
///
/// Meant for diagnostics. Nothing in the allocator consults it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaStats {
    /// Payload bytes held by free chunks.
    pub free_size: usize,
    /// Payload bytes held by used chunks.
    pub used_size: usize,
    /// Smallest free chunk payload (0 when nothing is free).
    pub min_chunk_size: usize,
    /// Largest free chunk payload (0 when nothing is free).
    pub max_chunk_size: usize,
    /// Bytes spent on boundary tags of all chunks but the first.
    pub overhead: usize,
    /// Number of free chunks per bucket.
    pub chunks_num: [usize; BUCKET_COUNT],
    /// Number of free chunks.
    pub free_chunks: usize,
    /// Number of used chunks.
    pub used_chunks: usize,
}

impl ArenaStats {
    pub(crate) fn new(total_size: usize, used_size: usize, free_size: usize) -> Self {
        Self {
            free_size,
            used_size,
            min_chunk_size: 0,
            max_chunk_size: 0,
            overhead: total_size - used_size - free_size,
            chunks_num: [0; BUCKET_COUNT],
            free_chunks: 0,
            used_chunks: 0,
        }
    }

    /// Account for one free chunk found in `bucket`.
    pub(crate) fn record_free(&mut self, bucket: usize, size: usize) {
        if self.free_chunks == 0 || size < self.min_chunk_size {
            self.min_chunk_size = size;
        }
        self.max_chunk_size = self.max_chunk_size.max(size);
        self.chunks_num[bucket] += 1;
        self.free_chunks += 1;
    }

    /// Derive the used chunk count once every free chunk was recorded.
    pub(crate) fn finish(mut self) -> Self {
        let chunks = self.overhead / CHUNK_OVERHEAD + 1;
        self.used_chunks = chunks.saturating_sub(self.free_chunks);
        self
    }

    /// Total number of chunks.
    pub fn total_chunks(&self) -> usize {
        self.free_chunks + self.used_chunks
    }

    /// Total bytes the arena accounts for.
    pub fn total_size(&self) -> usize {
        self.free_size + self.used_size + self.overhead
    }

    /// Log the statistics block line by line at `level` under the arena
    /// description `descr`.
    pub fn dump(&self, descr: &str, level: Level) {
        log_line(level, &format!("=== memory statistics for {descr} ==="));
        for line in self.to_string().lines() {
            log_line(level, line);
        }
        log_line(level, "================================");
    }
}

impl fmt::Display for ArenaStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, count) in self.chunks_num.iter().enumerate() {
            if *count == 0 {
                continue;
            }
            let op = if index == OVERFLOW_BUCKET { ">=" } else { "" };
            writeln!(
                f,
                "free chunks of size {op:>2} {:>3} bytes: {count:>8}",
                bucket_size(index)
            )?;
        }
        writeln!(f, "min chunk size: {:>10} bytes", self.min_chunk_size)?;
        writeln!(f, "max chunk size: {:>10} bytes", self.max_chunk_size)?;
        writeln!(
            f,
            "memory of total size {} bytes fragmented into {} chunks",
            self.total_size(),
            self.total_chunks()
        )?;
        writeln!(
            f,
            "of those, {:>10} bytes are in {:>8} free chunks",
            self.free_size, self.free_chunks
        )?;
        writeln!(
            f,
            "of those, {:>10} bytes are in {:>8} used chunks",
            self.used_size, self.used_chunks
        )?;
        write!(
            f,
            "of those, {:>10} bytes are used by allocation overhead",
            self.overhead
        )
    }
}

fn log_line(level: Level, line: &str) {
    match level {
        Level::TRACE => tracing::trace!("{line}"),
        Level::DEBUG => tracing::debug!("{line}"),
        Level::INFO => tracing::info!("{line}"),
        Level::WARN => tracing::warn!("{line}"),
        Level::ERROR => tracing::error!("{line}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_counts_chunks() {
        // Three chunks in total: 2 * 16 bytes of overhead.
        let mut stats = ArenaStats::new(1024, 64, 1024 - 64 - 32);
        stats.record_free(OVERFLOW_BUCKET, 1024 - 64 - 32 - 40);
        stats.record_free(2, 40);
        let stats = stats.finish();

        assert_eq!(stats.overhead, 32);
        assert_eq!(stats.free_chunks, 2);
        assert_eq!(stats.used_chunks, 1);
        assert_eq!(stats.total_chunks(), 3);
        assert_eq!(stats.min_chunk_size, 40);
        assert_eq!(stats.max_chunk_size, 1024 - 64 - 32 - 40);
        assert_eq!(stats.chunks_num[2], 1);
        assert_eq!(stats.total_size(), 1024);
    }

    #[test]
    fn test_stats_without_free_chunks() {
        let stats = ArenaStats::new(512, 512, 0).finish();
        assert_eq!(stats.min_chunk_size, 0);
        assert_eq!(stats.max_chunk_size, 0);
        assert_eq!(stats.used_chunks, 1);
    }

    #[test]
    fn test_stats_display() {
        let mut stats = ArenaStats::new(1024, 0, 1024);
        stats.record_free(OVERFLOW_BUCKET, 1024);
        let text = stats.finish().to_string();

        assert!(text.contains("free chunks of size >= 256 bytes:        1"));
        assert!(text.contains("fragmented into 1 chunks"));
        assert!(text.contains("bytes are used by allocation overhead"));
    }

    #[test]
    fn test_stats_dump_does_not_panic() {
        let stats = ArenaStats::new(64, 0, 64).finish();
        stats.dump("test arena", Level::DEBUG);
    }
}
