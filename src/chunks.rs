//! Chunk planning and work distribution for swarm downloads
//!
//! A file is partitioned into contiguous half-open ranges; workers draw
//! chunk indices from a shared FIFO queue so fast peers naturally claim
//! more work.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

/// One contiguous half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    pub index: u32,
    pub start: u64,
    pub end: u64,
}

impl ChunkSpec {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// Effective chunk size: at least the requested size, raised so the chunk
/// count stays comfortably above the worker count.
pub fn effective_chunk_size(size: u64, requested: u64, sources: usize) -> u64 {
    let workers = (2 * sources as u64).max(4);
    requested.max(size.div_ceil(workers))
}

/// Partition `[0, size)` into chunks of the effective size.
pub fn plan_chunks(size: u64, requested: u64, sources: usize) -> Vec<ChunkSpec> {
    let chunk = effective_chunk_size(size, requested, sources);
    let mut out = Vec::new();
    let mut start = 0u64;
    let mut index = 0u32;
    while start < size {
        let end = (start + chunk).min(size);
        out.push(ChunkSpec { index, start, end });
        start = end;
        index += 1;
    }
    out
}

/// Shared FIFO of not-yet-started chunk indices. Popping is the atomic
/// removal that gives each chunk at most one owner; failed or slow chunks
/// come back via the requeue methods.
pub struct ChunkQueue {
    inner: Mutex<VecDeque<u32>>,
}

impl ChunkQueue {
    pub fn new(indices: impl IntoIterator<Item = u32>) -> Self {
        Self {
            inner: Mutex::new(indices.into_iter().collect()),
        }
    }

    pub fn pop(&self) -> Option<u32> {
        self.inner.lock().unwrap().pop_front()
    }

    /// Return a chunk to the front of the queue, ahead of untouched work.
    pub fn requeue_front(&self, index: u32) {
        self.inner.lock().unwrap().push_front(index);
    }

    pub fn requeue_back(&self, index: u32) {
        self.inner.lock().unwrap().push_back(index);
    }

    /// Replace the queue contents; used between retry rounds.
    pub fn reset(&self, indices: impl IntoIterator<Item = u32>) {
        let mut inner = self.inner.lock().unwrap();
        inner.clear();
        inner.extend(indices);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

/// Progress counters for one job. Writers are the job's own workers;
/// readers sample without coordination, so individual counters are
/// monotonic but a snapshot may be momentarily inconsistent.
#[derive(Default)]
pub struct Progress {
    bytes_downloaded: AtomicU64,
    completed_chunks: AtomicU32,
    active_chunks: AtomicU32,
    active_workers: AtomicU32,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunk_started(&self) {
        self.active_chunks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunk_finished(&self, completed: bool, bytes: u64) {
        self.active_chunks.fetch_sub(1, Ordering::Relaxed);
        if completed {
            self.completed_chunks.fetch_add(1, Ordering::Relaxed);
            self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub fn worker_started(&self) {
        self.active_workers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_stopped(&self) {
        self.active_workers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded.load(Ordering::Relaxed)
    }

    pub fn completed_chunks(&self) -> u32 {
        self.completed_chunks.load(Ordering::Relaxed)
    }

    pub fn active_chunks(&self) -> u32 {
        self.active_chunks.load(Ordering::Relaxed)
    }

    pub fn active_workers(&self) -> u32 {
        self.active_workers.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_covers_file_exactly() {
        let chunks = plan_chunks(10_000_000, 1024 * 1024, 3);
        assert_eq!(chunks[0].start, 0);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert_eq!(chunks.last().unwrap().end, 10_000_000);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index as usize, i);
            assert!(!c.is_empty());
        }
    }

    #[test]
    fn test_plan_documented_example() {
        // size 2_621_440, chunk 1 MiB, 3 sources: effective size stays
        // 1 MiB and the tail chunk is short.
        let chunks = plan_chunks(2_621_440, 1_048_576, 3);
        assert_eq!(
            chunks,
            vec![
                ChunkSpec { index: 0, start: 0, end: 1_048_576 },
                ChunkSpec { index: 1, start: 1_048_576, end: 2_097_152 },
                ChunkSpec { index: 2, start: 2_097_152, end: 2_621_440 },
            ]
        );
    }

    #[test]
    fn test_effective_size_grows_for_many_sources() {
        // A huge file with few sources still gets large chunks rather than
        // thousands of tiny ones.
        let size = 8u64 * 1024 * 1024 * 1024;
        let effective = effective_chunk_size(size, 1024 * 1024, 2);
        assert_eq!(effective, size.div_ceil(4));

        // Small requested chunk, many sources: number of chunks is bounded
        // by 2 * sources
        let chunks = plan_chunks(size, 1024, 16);
        assert_eq!(chunks.len(), 32);
    }

    #[test]
    fn test_zero_size_plans_nothing() {
        assert!(plan_chunks(0, 1024, 2).is_empty());
    }

    #[test]
    fn test_queue_fifo_and_front_requeue() {
        let queue = ChunkQueue::new(0..4);
        assert_eq!(queue.pop(), Some(0));
        assert_eq!(queue.pop(), Some(1));

        queue.requeue_front(1);
        assert_eq!(queue.pop(), Some(1));

        queue.requeue_back(0);
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), Some(0));
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_delivers_each_index_once() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let queue = Arc::new(ChunkQueue::new(0..1000));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = Arc::clone(&queue);
            handles.push(std::thread::spawn(move || {
                let mut got = Vec::new();
                while let Some(i) = queue.pop() {
                    got.push(i);
                }
                got
            }));
        }
        let mut seen = HashSet::new();
        for handle in handles {
            for i in handle.join().unwrap() {
                assert!(seen.insert(i), "chunk {i} delivered twice");
            }
        }
        assert_eq!(seen.len(), 1000);
    }

    #[test]
    fn test_progress_counters() {
        let progress = Progress::new();
        progress.worker_started();
        progress.chunk_started();
        assert_eq!(progress.active_chunks(), 1);

        progress.chunk_finished(true, 500);
        assert_eq!(progress.active_chunks(), 0);
        assert_eq!(progress.completed_chunks(), 1);
        assert_eq!(progress.bytes_downloaded(), 500);

        progress.chunk_started();
        progress.chunk_finished(false, 0);
        assert_eq!(progress.completed_chunks(), 1);

        progress.worker_stopped();
        assert_eq!(progress.active_workers(), 0);
    }
}
