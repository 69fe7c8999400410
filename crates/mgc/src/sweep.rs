//! Sweep Phase - Reclaiming Unmarked Blocks
//!
//! One task per span. A sweeper owns its span exclusively, so bitmap
//! updates are plain writes; the only shared structures it touches are the
//! heap's class lists (through one bulk free per span) and the free span
//! pool.
//!
//! Per allocated block:
//!
//! | bits                | action                                         |
//! |---------------------|------------------------------------------------|
//! | Marked              | survivor: clear Marked                         |
//! | Special, unmarked   | offer to the finalizer machinery; keep if taken |
//! | otherwise           | reset to boundary-only and free                |

use crate::heap::{num_classes, Heap, Span, PAGE_SIZE};
use crate::util::nanotime;
use std::sync::Arc;

/// Decides the fate of an unreachable Special block
pub trait SpecialHandler: Sync {
    /// True when the block must stay allocated this cycle
    fn handle_special(&self, obj: usize, size: usize) -> bool;
}

/// Per-worker sweep counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepStats {
    /// In-use spans visited
    pub nspan: u64,
    pub freed_objects: u64,
    pub freed_bytes: u64,
    /// `(objects, bytes)` freed per size class; class 0 is large objects
    pub by_class: Vec<(u64, u64)>,
    /// Unreachable blocks kept for their finalizer
    pub finalizers_queued: u64,
    /// Debug mode: marked blocks the verification pass never reached
    pub spurious_marks: u64,
}

impl Default for SweepStats {
    fn default() -> Self {
        Self {
            nspan: 0,
            freed_objects: 0,
            freed_bytes: 0,
            by_class: vec![(0, 0); num_classes()],
            finalizers_queued: 0,
            spurious_marks: 0,
        }
    }
}

impl SweepStats {
    pub fn merge(&mut self, other: &SweepStats) {
        self.nspan += other.nspan;
        self.freed_objects += other.freed_objects;
        self.freed_bytes += other.freed_bytes;
        for (acc, add) in self.by_class.iter_mut().zip(&other.by_class) {
            acc.0 += add.0;
            acc.1 += add.1;
        }
        self.finalizers_queued += other.finalizers_queued;
        self.spurious_marks += other.spurious_marks;
    }

    /// Apply the freed counts to the heap's accounting
    pub fn fold_into(&self, heap: &Heap) {
        for (class, &(objects, bytes)) in self.by_class.iter().enumerate() {
            heap.note_freed(class, objects, bytes as usize);
        }
    }

    fn note(&mut self, class: usize, bytes: usize) {
        self.freed_objects += 1;
        self.freed_bytes += bytes as u64;
        self.by_class[class].0 += 1;
        self.by_class[class].1 += bytes as u64;
    }
}

/// Sweeps spans handed to it one at a time
pub struct Sweeper<'a> {
    heap: &'a Heap,
    specials: &'a dyn SpecialHandler,
    debug_mark: bool,
    now: u64,
    stats: SweepStats,
}

impl<'a> Sweeper<'a> {
    pub fn new(heap: &'a Heap, specials: &'a dyn SpecialHandler, debug_mark: bool) -> Self {
        Self {
            heap,
            specials,
            debug_mark,
            now: nanotime(),
            stats: SweepStats::default(),
        }
    }

    pub fn stats(&self) -> &SweepStats {
        &self.stats
    }

    pub fn into_stats(self) -> SweepStats {
        self.stats
    }

    /// Sweep one span
    pub fn sweep_span(&mut self, span: &Arc<Span>) {
        if !span.in_use() {
            span.stamp_unused(self.now);
            return;
        }
        self.stats.nspan += 1;

        let heap = self.heap;
        let bitmap = heap.bitmap();
        let class = span.sizeclass();
        let size = span.object_size();
        let n = span.object_count();
        let base = span.base();

        let mut head = 0usize;
        let mut end = 0usize;
        let mut nfree = 0usize;
        for i in 0..n {
            let p = base + i * size;
            let slot = bitmap.slot(p);
            let bits = slot.bits();
            if !bits.allocated() {
                continue;
            }

            if bits.marked() {
                if self.debug_mark {
                    if !bits.special() {
                        self.stats.spurious_marks += 1;
                        log::warn!("sweep: found spurious mark on {:#x}", p);
                    }
                    bitmap.set_special_at(&slot, false, true);
                }
                bitmap.clear_marked(&slot);
                continue;
            }

            // In debug mode Special doubles as the second mark bit, so any
            // block may have a finalizer.
            if (self.debug_mark || bits.special()) && self.specials.handle_special(p, size) {
                self.stats.finalizers_queued += 1;
                continue;
            }

            bitmap.reset_to_boundary(&slot);
            self.stats.note(class, size);
            if class == 0 {
                bitmap.unmark_span(p, PAGE_SIZE);
                heap.free_span(span);
            } else {
                span.types.clear_entry(i);
                if head == 0 {
                    head = p;
                } else {
                    // SAFETY: `end` is a block reclaimed just above.
                    unsafe { *(end as *mut usize) = p };
                }
                end = p;
                nfree += 1;
            }
        }

        if nfree > 0 {
            heap.free_objects(span, head, end, nfree);
        }
    }
}
