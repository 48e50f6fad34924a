//! Thread-private scratch memory for packing buffers.

use rayon::iter::{IntoParallelIterator, ParallelIterator};

/// Alignment of every thread buffer in bytes.
pub const CACHE_LINE: usize = 64;

/// Provider of per-thread scratch memory.
///
/// The backend reserves memory at compile time, allocates it once and hands
/// thread `i` the `i`-th slice on every launch.
pub trait MemoryManager: Send {
    /// Requests at least `size` bytes for each of `num_threads` threads.
    fn reserve_thread_memory(&mut self, size: usize, num_threads: usize);

    /// Allocates the reserved memory.
    fn alloc_all_memory(&mut self);

    /// One slice per reserved thread, each at least the reserved size.
    fn thread_memory(&mut self) -> Vec<&mut [u8]>;
}

/// Default memory manager with cache-line aligned, zero-initialized buffers.
///
/// Buffers are allocated from rayon workers so that each one is first
/// touched by a worker thread.
#[derive(Debug, Default)]
pub struct ThreadMemory {
    size: usize,
    num_threads: usize,
    buffers: Vec<Vec<u8>>,
}

impl ThreadMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserved bytes per thread.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl MemoryManager for ThreadMemory {
    fn reserve_thread_memory(&mut self, size: usize, num_threads: usize) {
        self.size = self.size.max(size);
        self.num_threads = self.num_threads.max(num_threads);
    }

    fn alloc_all_memory(&mut self) {
        let allocated = self.buffers.len() == self.num_threads
            && self
                .buffers
                .iter()
                .all(|buffer| buffer.len() >= self.size + CACHE_LINE);
        if allocated || self.size == 0 {
            return;
        }
        let size = self.size + CACHE_LINE;
        self.buffers = (0..self.num_threads)
            .into_par_iter()
            .map(|_| vec![0u8; size])
            .collect();
    }

    fn thread_memory(&mut self) -> Vec<&mut [u8]> {
        let size = self.size;
        if size == 0 || self.buffers.is_empty() {
            return (0..self.num_threads).map(|_| <&mut [u8]>::default()).collect();
        }
        self.buffers
            .iter_mut()
            .map(|buffer| {
                let offset = buffer.as_ptr().align_offset(CACHE_LINE);
                &mut buffer[offset..offset + size]
            })
            .collect()
    }
}
