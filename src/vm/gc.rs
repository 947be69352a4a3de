//! Stop-the-world mark-sweep collector.
//!
//! Mark bits live in a set owned by the collector rather than on the
//! objects, so marking only needs shared access to the heap.

use std::collections::HashSet;
use std::time::Instant;

use tracing::debug;

use super::heap::{Heap, HeapAddr};
use super::value::Value;

/// GC statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcStats {
    pub cycles: usize,
    pub freed_objects: usize,
    pub total_pause_us: u64,
    pub max_pause_us: u64,
}

/// Outcome of a single collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionReport {
    pub marked: usize,
    pub freed: usize,
}

#[derive(Debug, Default)]
pub struct GarbageCollector {
    marks: HashSet<HeapAddr>,
    stats: GcStats,
}

impl GarbageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    pub fn is_marked(&self, addr: HeapAddr) -> bool {
        self.marks.contains(&addr)
    }

    /// Run a full cycle over `roots`: clear marks, mark, sweep.
    pub fn collect(&mut self, heap: &mut Heap, roots: &[Value]) -> CollectionReport {
        let start = Instant::now();

        self.marks.clear();
        self.mark(heap, roots);
        let freed = self.sweep(heap);
        heap.reset_alloc_counter();

        let pause_us = start.elapsed().as_micros() as u64;
        self.stats.cycles += 1;
        self.stats.freed_objects += freed;
        self.stats.total_pause_us += pause_us;
        self.stats.max_pause_us = self.stats.max_pause_us.max(pause_us);

        let report = CollectionReport {
            marked: self.marks.len(),
            freed,
        };
        debug!(
            target: "iris::gc",
            cycle = self.stats.cycles,
            marked = report.marked,
            freed = report.freed,
            pause_us,
            "collection finished"
        );
        report
    }

    /// Mark phase: mark everything reachable from `roots`.
    ///
    /// Roots that name a missing object are skipped; a root can outlive
    /// the object it pointed at when it was left over from a prior pass.
    pub fn mark(&mut self, heap: &Heap, roots: &[Value]) {
        let mut worklist: Vec<HeapAddr> = roots.iter().filter_map(Value::as_addr).collect();

        while let Some(addr) = worklist.pop() {
            let Ok(object) = heap.get(addr) else {
                continue;
            };
            if !self.marks.insert(addr) {
                continue;
            }
            worklist.extend(object.trace().filter(|child| !self.marks.contains(child)));
        }
    }

    /// Sweep phase: free every unmarked object. Returns how many were freed.
    pub fn sweep(&mut self, heap: &mut Heap) -> usize {
        let dead: Vec<HeapAddr> = heap
            .addresses()
            .filter(|addr| !self.marks.contains(addr))
            .collect();
        for addr in &dead {
            heap.free(*addr);
        }
        dead.len()
    }
}
