//! Chunk memory management
//!
//! The decoder never owns sample memory outright: every buffer it fills
//! (codec names, codec payloads, settings text, chunk samples) comes from a
//! [`ChunkAllocator`]. Allocation is synchronous and fallible; any
//! retry/backoff policy belongs to the allocator, never to the decoder.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Allocation failure reported by a [`ChunkAllocator`]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("out of chunk memory: requested {requested} bytes, {available} available")]
pub struct OutOfMemory {
    pub requested: usize,
    pub available: usize,
}

/// Allocate/free contract between the decoder and chunk memory
pub trait ChunkAllocator {
    /// Hand out a zeroed buffer of exactly `size` bytes
    fn allocate(&self, size: usize) -> Result<ChunkBuffer, OutOfMemory>;

    /// Return a buffer. Dropping a buffer has the same effect.
    fn free(&self, chunk: ChunkBuffer) {
        drop(chunk);
    }
}

impl<A: ChunkAllocator + ?Sized> ChunkAllocator for Arc<A> {
    fn allocate(&self, size: usize) -> Result<ChunkBuffer, OutOfMemory> {
        (**self).allocate(size)
    }

    fn free(&self, chunk: ChunkBuffer) {
        (**self).free(chunk)
    }
}

impl<A: ChunkAllocator + ?Sized> ChunkAllocator for &A {
    fn allocate(&self, size: usize) -> Result<ChunkBuffer, OutOfMemory> {
        (**self).allocate(size)
    }

    fn free(&self, chunk: ChunkBuffer) {
        (**self).free(chunk)
    }
}

fn zeroed(size: usize) -> Option<Vec<u8>> {
    let mut data = Vec::new();
    data.try_reserve_exact(size).ok()?;
    data.resize(size, 0);
    Some(data)
}

/// Buffer of chunk memory.
///
/// If it came from a [`BudgetAllocator`], its bytes go back to the budget
/// when it is dropped.
pub struct ChunkBuffer {
    data: Box<[u8]>,
    lease: Option<Lease>,
}

impl ChunkBuffer {
    /// Wrap memory that is not accounted against any budget
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: data.into_boxed_slice(),
            lease: None,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Stored 32-bit frame words of a PCM chunk, in memory order
    pub fn frame_words(&self) -> impl Iterator<Item = u32> + '_ {
        self.data
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
    }

    /// Interleaved 16-bit samples of a PCM chunk as they were sent on the wire.
    ///
    /// PCM words are stored with their 16-bit halves swapped (`[b2, b3, b0, b1]`
    /// for wire bytes `[b0, b1, b2, b3]`); this undoes that.
    pub fn pcm_samples_i16(&self) -> impl Iterator<Item = i16> + '_ {
        self.data.chunks_exact(4).flat_map(|w| {
            [
                i16::from_le_bytes([w[2], w[3]]),
                i16::from_le_bytes([w[0], w[1]]),
            ]
        })
    }
}

impl PartialEq for ChunkBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for ChunkBuffer {}

impl fmt::Debug for ChunkBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkBuffer")
            .field("len", &self.data.len())
            .field("leased", &self.lease.is_some())
            .finish()
    }
}

struct Lease {
    budget: Arc<Budget>,
    bytes: usize,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.budget.in_use.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

/// Unbounded allocator backed by the global heap
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapAllocator;

impl ChunkAllocator for HeapAllocator {
    fn allocate(&self, size: usize) -> Result<ChunkBuffer, OutOfMemory> {
        zeroed(size)
            .map(ChunkBuffer::from_vec)
            .ok_or(OutOfMemory {
                requested: size,
                available: 0,
            })
    }
}

struct Budget {
    capacity: usize,
    in_use: AtomicUsize,
    allocations: AtomicU64,
    failures: AtomicU64,
}

/// Allocator with a fixed byte budget shared by all its clones.
///
/// Bytes are returned to the budget when the [`ChunkBuffer`] is dropped,
/// which may happen on another thread (the playback scheduler).
#[derive(Clone)]
pub struct BudgetAllocator {
    budget: Arc<Budget>,
}

impl BudgetAllocator {
    pub fn new(capacity: usize) -> Self {
        Self {
            budget: Arc::new(Budget {
                capacity,
                in_use: AtomicUsize::new(0),
                allocations: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.budget.capacity
    }

    pub fn in_use(&self) -> usize {
        self.budget.in_use.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.capacity().saturating_sub(self.in_use())
    }

    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            capacity: self.budget.capacity,
            in_use: self.in_use(),
            allocations: self.budget.allocations.load(Ordering::Relaxed),
            failures: self.budget.failures.load(Ordering::Relaxed),
        }
    }

    fn fail(&self, requested: usize) -> OutOfMemory {
        self.budget.failures.fetch_add(1, Ordering::Relaxed);
        OutOfMemory {
            requested,
            available: self.available(),
        }
    }
}

impl fmt::Debug for BudgetAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BudgetAllocator")
            .field("stats", &self.stats())
            .finish()
    }
}

impl ChunkAllocator for BudgetAllocator {
    fn allocate(&self, size: usize) -> Result<ChunkBuffer, OutOfMemory> {
        let capacity = self.budget.capacity;
        let reserved = self
            .budget
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |in_use| {
                in_use.checked_add(size).filter(|total| *total <= capacity)
            });
        if reserved.is_err() {
            return Err(self.fail(size));
        }

        // From here on the lease gives the bytes back on any exit path.
        let lease = Lease {
            budget: self.budget.clone(),
            bytes: size,
        };
        let Some(data) = zeroed(size) else {
            drop(lease);
            return Err(self.fail(size));
        };

        self.budget.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(ChunkBuffer {
            data: data.into_boxed_slice(),
            lease: Some(lease),
        })
    }
}

/// Allocator statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorStats {
    pub capacity: usize,
    pub in_use: usize,
    pub allocations: u64,
    pub failures: u64,
}
