//! Chunk memory and the hand-off to playback

pub mod buffer;
pub mod chunk;

pub use buffer::{create_shared_queue, ChunkQueue, ScheduledChunk, SharedChunkQueue};
pub use chunk::{
    AllocatorStats, BudgetAllocator, ChunkAllocator, ChunkBuffer, HeapAllocator, OutOfMemory,
};
