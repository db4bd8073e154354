//! Lock-free hand-off queue for decoded chunks
//!
//! The receive loop pushes completed chunks by value; the playback
//! scheduler pops them on its own thread. Single producer, single consumer.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::audio::chunk::ChunkBuffer;
use crate::protocol::{Timestamp, WireChunkMeta};

/// Chunk ready to be timed by the playback scheduler
#[derive(Debug)]
pub struct ScheduledChunk {
    pub meta: WireChunkMeta,
    pub data: ChunkBuffer,
}

impl ScheduledChunk {
    pub fn new(meta: WireChunkMeta, data: ChunkBuffer) -> Self {
        Self { meta, data }
    }

    /// Server time at which this chunk starts playing
    pub fn server_time(&self) -> Timestamp {
        self.meta.timestamp
    }
}

/// Bounded queue of chunks between the receive loop and playback
pub struct ChunkQueue {
    queue: ArrayQueue<ScheduledChunk>,
    overflow_count: AtomicUsize,
    underrun_count: AtomicUsize,
}

impl ChunkQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            overflow_count: AtomicUsize::new(0),
            underrun_count: AtomicUsize::new(0),
        }
    }

    /// Queue a chunk, or hand it back when the queue is full so the caller
    /// decides when its memory goes back to the allocator
    pub fn push(&self, chunk: ScheduledChunk) -> Result<(), ScheduledChunk> {
        self.queue.push(chunk).map_err(|chunk| {
            self.overflow_count.fetch_add(1, Ordering::Relaxed);
            chunk
        })
    }

    /// Oldest chunk. An empty queue counts as one underrun.
    pub fn pop(&self) -> Option<ScheduledChunk> {
        let chunk = self.queue.pop();
        if chunk.is_none() {
            self.underrun_count.fetch_add(1, Ordering::Relaxed);
        }
        chunk
    }

    /// Drop every queued chunk and return how many there were
    pub fn clear(&self) -> usize {
        let mut dropped = 0;
        while self.queue.pop().is_some() {
            dropped += 1;
        }
        dropped
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Chunks refused by `push`
    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }

    /// `pop` calls that found nothing to play
    pub fn underrun_count(&self) -> usize {
        self.underrun_count.load(Ordering::Relaxed)
    }
}

pub type SharedChunkQueue = Arc<ChunkQueue>;

pub fn create_shared_queue(capacity: usize) -> SharedChunkQueue {
    Arc::new(ChunkQueue::new(capacity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::chunk::{BudgetAllocator, ChunkAllocator};
    use crate::protocol::Codec;

    fn chunk(sec: i32, data: ChunkBuffer) -> ScheduledChunk {
        let meta = WireChunkMeta {
            timestamp: Timestamp::new(sec, 0),
            size: data.len() as u32,
            codec: Codec::Opus,
        };
        ScheduledChunk::new(meta, data)
    }

    #[test]
    fn test_queue_fifo() {
        let queue = ChunkQueue::new(4);

        assert!(queue.push(chunk(1, ChunkBuffer::from_vec(vec![1]))).is_ok());
        assert!(queue.push(chunk(2, ChunkBuffer::from_vec(vec![2]))).is_ok());
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop().unwrap().server_time().sec, 1);
        assert_eq!(queue.pop().unwrap().server_time().sec, 2);
        assert!(queue.is_empty());
        assert!(queue.pop().is_none());
        assert_eq!(queue.underrun_count(), 1);
    }

    #[test]
    fn test_overflow_hands_chunk_back() {
        let alloc = BudgetAllocator::new(64);
        let queue = ChunkQueue::new(1);

        queue.push(chunk(1, alloc.allocate(16).unwrap())).unwrap();
        let rejected = queue.push(chunk(2, alloc.allocate(16).unwrap())).unwrap_err();
        assert_eq!(queue.overflow_count(), 1);
        assert_eq!(alloc.in_use(), 32);

        drop(rejected);
        assert_eq!(alloc.in_use(), 16);

        assert_eq!(queue.clear(), 1);
        assert_eq!(alloc.in_use(), 0);
    }
}
