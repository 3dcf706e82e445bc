//! Size-class memory pool.
//!
//! Services small and medium allocations without falling through to the
//! general-purpose allocator: requests are rounded up to a size class, each
//! class is backed by slab chunks subdivided into equal slots, and freed
//! slots are recycled through per-class free lists. Oversize requests route
//! to a tracked low-level path.
//!
//! Blocks are addressed by an explicit [`PoolHandle`] instead of metadata
//! hidden behind the returned pointer, and out-of-memory is an explicit
//! [`Error::OutOfMemory`] instead of a crash. The outstanding-byte counter is
//! atomic so read-side telemetry works through shared references even when
//! the pool itself is owned by one simulation island at a time.

use crate::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};

/// The size-class quantization step, in bytes.
const GRANULARITY: usize = 64;

/// Requests larger than this bypass the size-class bins.
const MAX_POOLED_SIZE: usize = 4096;

/// Number of size-class bins.
const BIN_COUNT: usize = MAX_POOLED_SIZE / GRANULARITY;

/// Number of slots carved out of each slab chunk.
const CHUNK_SLOTS: usize = 64;

/// Bin index marking a handle that went through the low-level oversize path.
const OVERSIZE_BIN: u32 = u32::MAX;

/// A handle to a block allocated from a [`MemoryPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PoolHandle {
    bin: u32,
    slot: u32,
}

struct Bin {
    slot_size: usize,
    chunks: Vec<Box<[u8]>>,
    free: Vec<u32>,
    live: Vec<bool>,
}

impl Bin {
    fn new(slot_size: usize) -> Self {
        Self {
            slot_size,
            chunks: Vec::new(),
            free: Vec::new(),
            live: Vec::new(),
        }
    }

    fn grow(&mut self) -> Result<(), Error> {
        let chunk_len = self.slot_size * CHUNK_SLOTS;
        let mut buf = Vec::new();
        buf.try_reserve_exact(chunk_len)
            .map_err(|_| Error::OutOfMemory(chunk_len))?;
        buf.resize(chunk_len, 0u8);

        let base = (self.chunks.len() * CHUNK_SLOTS) as u32;
        self.chunks.push(buf.into_boxed_slice());
        self.live.resize(self.live.len() + CHUNK_SLOTS, false);
        // Hand out low slots first.
        for slot in (base..base + CHUNK_SLOTS as u32).rev() {
            self.free.push(slot);
        }
        Ok(())
    }
}

/// A pooled allocator with size-class bins and explicit handles.
pub struct MemoryPool {
    bins: Vec<Bin>,
    oversize: Vec<Option<Box<[u8]>>>,
    oversize_free: Vec<u32>,
    used: AtomicUsize,
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPool {
    /// Creates an empty pool. No memory is reserved until the first
    /// allocation of each size class.
    pub fn new() -> Self {
        let bins = (1..=BIN_COUNT).map(|i| Bin::new(i * GRANULARITY)).collect();
        Self {
            bins,
            oversize: Vec::new(),
            oversize_free: Vec::new(),
            used: AtomicUsize::new(0),
        }
    }

    /// Allocates a zero-initialized block of at least `size` bytes.
    pub fn alloc(&mut self, size: usize) -> Result<PoolHandle, Error> {
        let size = size.max(1);

        if size <= MAX_POOLED_SIZE {
            let bin_id = (size + GRANULARITY - 1) / GRANULARITY - 1;
            let bin = &mut self.bins[bin_id];
            if bin.free.is_empty() {
                bin.grow()?;
            }
            let slot = bin.free.pop().expect("bin freelist is empty after grow");
            bin.live[slot as usize] = true;
            // Freed slots are recycled without re-zeroing.
            bin.chunk_slot_mut(slot).fill(0);
            self.used.fetch_add(bin.slot_size, Ordering::Relaxed);
            return Ok(PoolHandle {
                bin: bin_id as u32,
                slot,
            });
        }

        // Low-level path for oversize blocks.
        let mut buf = Vec::new();
        buf.try_reserve_exact(size)
            .map_err(|_| Error::OutOfMemory(size))?;
        buf.resize(size, 0u8);
        let block = buf.into_boxed_slice();

        let slot = match self.oversize_free.pop() {
            Some(slot) => {
                self.oversize[slot as usize] = Some(block);
                slot
            }
            None => {
                self.oversize.push(Some(block));
                (self.oversize.len() - 1) as u32
            }
        };
        self.used.fetch_add(size, Ordering::Relaxed);
        Ok(PoolHandle {
            bin: OVERSIZE_BIN,
            slot,
        })
    }

    /// Returns a block to the pool.
    ///
    /// Freeing a handle that is not live is ignored (with a warning) rather
    /// than corrupting the free lists.
    pub fn free(&mut self, handle: PoolHandle) {
        if handle.bin == OVERSIZE_BIN {
            match self.oversize.get_mut(handle.slot as usize).and_then(|b| b.take()) {
                Some(block) => {
                    self.used.fetch_sub(block.len(), Ordering::Relaxed);
                    self.oversize_free.push(handle.slot);
                }
                None => log::warn!("pool: ignoring free of dead oversize handle {:?}", handle),
            }
            return;
        }

        let Some(bin) = self.bins.get_mut(handle.bin as usize) else {
            log::warn!("pool: ignoring free of invalid handle {:?}", handle);
            return;
        };
        match bin.live.get_mut(handle.slot as usize) {
            Some(live) if *live => {
                *live = false;
                bin.free.push(handle.slot);
                self.used.fetch_sub(bin.slot_size, Ordering::Relaxed);
            }
            _ => log::warn!("pool: ignoring free of dead handle {:?}", handle),
        }
    }

    /// Shared access to a live block's bytes.
    pub fn block(&self, handle: PoolHandle) -> Option<&[u8]> {
        if handle.bin == OVERSIZE_BIN {
            return self
                .oversize
                .get(handle.slot as usize)
                .and_then(|b| b.as_deref());
        }
        let bin = self.bins.get(handle.bin as usize)?;
        if !*bin.live.get(handle.slot as usize)? {
            return None;
        }
        Some(bin.chunk_slot(handle.slot))
    }

    /// Exclusive access to a live block's bytes.
    pub fn block_mut(&mut self, handle: PoolHandle) -> Option<&mut [u8]> {
        if handle.bin == OVERSIZE_BIN {
            return self
                .oversize
                .get_mut(handle.slot as usize)
                .and_then(|b| b.as_deref_mut());
        }
        let bin = self.bins.get_mut(handle.bin as usize)?;
        if !*bin.live.get(handle.slot as usize)? {
            return None;
        }
        Some(bin.chunk_slot_mut(handle.slot))
    }

    /// Total bytes currently outstanding, rounded to the slot sizes actually
    /// reserved.
    pub fn bytes_in_use(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }
}

impl Bin {
    fn chunk_slot(&self, slot: u32) -> &[u8] {
        let chunk = slot as usize / CHUNK_SLOTS;
        let offset = (slot as usize % CHUNK_SLOTS) * self.slot_size;
        &self.chunks[chunk][offset..offset + self.slot_size]
    }

    fn chunk_slot_mut(&mut self, slot: u32) -> &mut [u8] {
        let chunk = slot as usize / CHUNK_SLOTS;
        let offset = (slot as usize % CHUNK_SLOTS) * self.slot_size;
        &mut self.chunks[chunk][offset..offset + self.slot_size]
    }
}
