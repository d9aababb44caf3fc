//! Mark-sweep garbage collector over an explicit reference graph.
//!
//! Objects are identified by [`GcHandle`]s, which are never reused, so a stale
//! handle can never alias a newer object. Reachability is recomputed from
//! scratch on every `collect()` and `live_objects()` call.

use std::collections::{HashMap, HashSet};

use super::alloc::{Block, SharedAllocator};

/// Stable handle to a collector-owned object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GcHandle(u64);

impl GcHandle {
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Cumulative collector statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub collections: usize,
    pub total_collected: usize,
    pub explicit_frees: usize,
}

pub struct GarbageCollector {
    allocator: SharedAllocator,
    heap: HashMap<GcHandle, Block>,
    roots: HashSet<GcHandle>,
    references: HashMap<GcHandle, Vec<GcHandle>>,
    next_handle: u64,
    stats: GcStats,
}

impl GarbageCollector {
    pub fn new(allocator: SharedAllocator) -> Self {
        Self {
            allocator,
            heap: HashMap::new(),
            roots: HashSet::new(),
            references: HashMap::new(),
            next_handle: 1,
            stats: GcStats::default(),
        }
    }

    /// Allocate an object of `size` bytes. Returns `None` if the allocator
    /// fails.
    pub fn allocate(&mut self, size: usize) -> Option<GcHandle> {
        let block = self.allocator.borrow_mut().allocate(size)?;
        let handle = GcHandle(self.next_handle);
        self.next_handle += 1;
        self.heap.insert(handle, block);
        Some(handle)
    }

    /// Add `handle` to the root set. Ignored if it is not on the heap.
    pub fn mark_root(&mut self, handle: GcHandle) {
        if self.heap.contains_key(&handle) {
            self.roots.insert(handle);
        }
    }

    pub fn clear_roots(&mut self) {
        self.roots.clear();
    }

    /// Record an edge `from -> to`. Ignored unless both are on the heap.
    pub fn add_reference(&mut self, from: GcHandle, to: GcHandle) {
        if self.heap.contains_key(&from) && self.heap.contains_key(&to) {
            self.references.entry(from).or_default().push(to);
        }
    }

    /// Free every object not reachable from the roots. Returns the number of
    /// objects freed.
    pub fn collect(&mut self) -> usize {
        let reachable = self.mark();
        let garbage: HashSet<GcHandle> = self
            .heap
            .keys()
            .filter(|handle| !reachable.contains(handle))
            .copied()
            .collect();

        for &handle in &garbage {
            self.release(handle);
        }
        self.purge_edges(|handle| garbage.contains(handle));

        self.stats.collections += 1;
        self.stats.total_collected += garbage.len();
        garbage.len()
    }

    /// Free `handle` immediately. Freeing twice or freeing an unknown handle
    /// does nothing.
    pub fn deallocate(&mut self, handle: GcHandle) {
        if !self.heap.contains_key(&handle) {
            return;
        }
        self.release(handle);
        self.purge_edges(|h| *h == handle);
        self.stats.explicit_frees += 1;
    }

    pub fn heap_size(&self) -> usize {
        self.heap.len()
    }

    /// Number of objects the next `collect()` would keep.
    pub fn live_objects(&self) -> usize {
        self.mark().len()
    }

    /// Bytes requested by objects currently on the heap.
    pub fn heap_bytes(&self) -> usize {
        self.heap.values().map(Block::size).sum()
    }

    pub fn contains(&self, handle: GcHandle) -> bool {
        self.heap.contains_key(&handle)
    }

    pub fn is_root(&self, handle: GcHandle) -> bool {
        self.roots.contains(&handle)
    }

    pub fn references_of(&self, handle: GcHandle) -> &[GcHandle] {
        self.references.get(&handle).map_or(&[], Vec::as_slice)
    }

    /// True if `handle` appears anywhere in the reference graph.
    pub fn is_referenced_anywhere(&self, handle: GcHandle) -> bool {
        self.references.contains_key(&handle)
            || self.references.values().any(|targets| targets.contains(&handle))
    }

    pub fn stats(&self) -> GcStats {
        self.stats
    }

    /// Free every object regardless of reachability.
    pub fn clear(&mut self) {
        let handles: Vec<GcHandle> = self.heap.keys().copied().collect();
        for handle in handles {
            self.release(handle);
        }
        self.references.clear();
    }

    /// Iterative depth-first traversal from the roots.
    fn mark(&self) -> HashSet<GcHandle> {
        let mut visited = HashSet::new();
        let mut worklist: Vec<GcHandle> = self
            .roots
            .iter()
            .filter(|handle| self.heap.contains_key(handle))
            .copied()
            .collect();

        while let Some(handle) = worklist.pop() {
            if !visited.insert(handle) {
                continue;
            }
            if let Some(targets) = self.references.get(&handle) {
                for &target in targets {
                    if self.heap.contains_key(&target) && !visited.contains(&target) {
                        worklist.push(target);
                    }
                }
            }
        }

        visited
    }

    fn release(&mut self, handle: GcHandle) {
        self.roots.remove(&handle);
        if let Some(block) = self.heap.remove(&handle) {
            self.allocator.borrow_mut().deallocate(block);
        }
    }

    /// Drop adjacency entries whose key or target matches `dead`, plus any
    /// edge pointing off the heap.
    fn purge_edges(&mut self, dead: impl Fn(&GcHandle) -> bool) {
        let heap = &self.heap;
        self.references.retain(|from, targets| {
            if dead(from) || !heap.contains_key(from) {
                return false;
            }
            targets.retain(|to| !dead(to) && heap.contains_key(to));
            !targets.is_empty()
        });
    }
}

impl Drop for GarbageCollector {
    fn drop(&mut self) {
        self.clear();
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::vm::alloc::TieredPool;
    use proptest::prelude::*;

    /// Reference reachability: naive fixed point over the edge list.
    fn closure(n: usize, roots: &[usize], edges: &[(usize, usize)]) -> HashSet<usize> {
        let mut reached: HashSet<usize> = roots.iter().copied().filter(|&r| r < n).collect();
        loop {
            let before = reached.len();
            for &(from, to) in edges {
                if reached.contains(&from) && to < n {
                    reached.insert(to);
                }
            }
            if reached.len() == before {
                return reached;
            }
        }
    }

    proptest! {
        /// Whatever the graph, collect() keeps exactly the closure of the
        /// roots and leaves no dangling edges behind.
        #[test]
        fn collect_matches_reachability(
            n in 1usize..24,
            roots in prop::collection::vec(0usize..24, 0..6),
            edges in prop::collection::vec((0usize..24, 0usize..24), 0..48),
        ) {
            let mut gc = GarbageCollector::new(TieredPool::new().shared());
            let handles: Vec<GcHandle> = (0..n).map(|_| gc.allocate(16).unwrap()).collect();
            for &r in &roots {
                if r < n {
                    gc.mark_root(handles[r]);
                }
            }
            for &(from, to) in &edges {
                if from < n && to < n {
                    gc.add_reference(handles[from], handles[to]);
                }
            }

            let expected = closure(n, &roots, &edges);
            let before = gc.heap_size();
            let live = gc.live_objects();
            prop_assert_eq!(live, expected.len());

            let collected = gc.collect();
            prop_assert_eq!(before - collected, live);

            for (i, &handle) in handles.iter().enumerate() {
                prop_assert_eq!(gc.contains(handle), expected.contains(&i));
                if !expected.contains(&i) {
                    prop_assert!(!gc.is_referenced_anywhere(handle));
                }
            }
        }

        /// Deallocating in any order, with repeats, frees each object once.
        #[test]
        fn deallocate_is_idempotent(order in prop::collection::vec(0usize..8, 0..32)) {
            let mut gc = GarbageCollector::new(TieredPool::new().shared());
            let handles: Vec<GcHandle> = (0..8).map(|_| gc.allocate(8).unwrap()).collect();
            let mut freed = HashSet::new();
            for &i in &order {
                gc.deallocate(handles[i]);
                freed.insert(i);
                prop_assert_eq!(gc.heap_size(), 8 - freed.len());
            }
            prop_assert_eq!(gc.stats().explicit_frees, freed.len());
        }
    }
}
