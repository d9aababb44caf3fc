//! Block allocators used by the collector and the VM.
//!
//! The allocator is an explicit object shared between the VM and its
//! collector. It is not a process-wide singleton.

use std::cell::RefCell;
use std::rc::Rc;

/// Size classes served by [`TieredPool`].
pub const SIZE_CLASSES: [usize; 10] = [16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192];

/// Default number of blocks reserved per size class.
pub const DEFAULT_BLOCKS_PER_CLASS: usize = 100;

/// A zero-initialised block of memory handed out by an [`Allocator`].
#[derive(Debug)]
pub struct Block {
    bytes: Box<[u8]>,
    requested: usize,
    class: Option<usize>,
}

impl Block {
    /// `None` when the memory cannot be reserved.
    fn new(capacity: usize, requested: usize, class: Option<usize>) -> Option<Self> {
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(capacity).ok()?;
        bytes.resize(capacity, 0u8);
        Some(Self {
            bytes: bytes.into_boxed_slice(),
            requested,
            class,
        })
    }

    /// Size that was requested.
    pub fn size(&self) -> usize {
        self.requested
    }

    /// Actual capacity (the size class for pooled blocks).
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Index into [`SIZE_CLASSES`], or `None` for oversized system blocks.
    pub fn class(&self) -> Option<usize> {
        self.class
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.requested]
    }

    #[cfg(test)]
    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[..self.requested]
    }
}

/// Allocation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocStats {
    pub allocations: usize,
    pub deallocations: usize,
    pub bytes_in_use: usize,
    /// Requests served outside the pools.
    pub fallbacks: usize,
}

/// Source of raw memory blocks.
pub trait Allocator {
    /// Allocate a zeroed block of at least `size` bytes. `None` on failure.
    fn allocate(&mut self, size: usize) -> Option<Block>;

    /// Return a block previously obtained from this allocator.
    fn deallocate(&mut self, block: Block);

    fn stats(&self) -> AllocStats;
}

/// Allocator shared by the VM and its collector.
pub type SharedAllocator = Rc<RefCell<dyn Allocator>>;

/// Size-class pool allocator.
///
/// Each class keeps a free list capped at `blocks_per_class`. Requests larger
/// than the biggest class, or made while a class is exhausted, fall back to
/// a plain heap allocation.
#[derive(Debug)]
pub struct TieredPool {
    free_lists: Vec<Vec<Box<[u8]>>>,
    outstanding: Vec<usize>,
    blocks_per_class: usize,
    stats: AllocStats,
}

impl TieredPool {
    pub fn new() -> Self {
        Self::with_blocks_per_class(DEFAULT_BLOCKS_PER_CLASS)
    }

    pub fn with_blocks_per_class(blocks_per_class: usize) -> Self {
        Self {
            free_lists: SIZE_CLASSES.iter().map(|_| Vec::new()).collect(),
            outstanding: vec![0; SIZE_CLASSES.len()],
            blocks_per_class,
            stats: AllocStats::default(),
        }
    }

    pub fn shared(self) -> SharedAllocator {
        Rc::new(RefCell::new(self))
    }

    /// Smallest class that fits `size`.
    pub fn class_for(size: usize) -> Option<usize> {
        SIZE_CLASSES.iter().position(|&class| size <= class)
    }

    /// Free blocks currently cached for a class.
    pub fn cached(&self, class: usize) -> usize {
        self.free_lists.get(class).map_or(0, Vec::len)
    }
}

impl Default for TieredPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator for TieredPool {
    fn allocate(&mut self, size: usize) -> Option<Block> {
        if size == 0 {
            return None;
        }

        let block = match Self::class_for(size) {
            Some(class) if self.outstanding[class] < self.blocks_per_class => {
                let block = match self.free_lists[class].pop() {
                    Some(mut bytes) => {
                        bytes.fill(0);
                        Block {
                            bytes,
                            requested: size,
                            class: Some(class),
                        }
                    }
                    None => Block::new(SIZE_CLASSES[class], size, Some(class))?,
                };
                self.outstanding[class] += 1;
                block
            }
            _ => {
                let block = Block::new(size, size, None)?;
                self.stats.fallbacks += 1;
                block
            }
        };

        self.stats.allocations += 1;
        self.stats.bytes_in_use += block.capacity();
        Some(block)
    }

    fn deallocate(&mut self, block: Block) {
        self.stats.deallocations += 1;
        self.stats.bytes_in_use = self.stats.bytes_in_use.saturating_sub(block.capacity());
        if let Some(class) = block.class {
            self.outstanding[class] = self.outstanding[class].saturating_sub(1);
            self.free_lists[class].push(block.bytes);
        }
    }

    fn stats(&self) -> AllocStats {
        self.stats
    }
}

/// Unpooled allocator: every request is a fresh heap allocation.
#[derive(Debug, Default)]
pub struct SystemAllocator {
    stats: AllocStats,
}

impl SystemAllocator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Allocator for SystemAllocator {
    fn allocate(&mut self, size: usize) -> Option<Block> {
        if size == 0 {
            return None;
        }
        let block = Block::new(size, size, None)?;
        self.stats.allocations += 1;
        self.stats.bytes_in_use += size;
        Some(block)
    }

    fn deallocate(&mut self, block: Block) {
        self.stats.deallocations += 1;
        self.stats.bytes_in_use = self.stats.bytes_in_use.saturating_sub(block.capacity());
    }

    fn stats(&self) -> AllocStats {
        self.stats
    }
}
