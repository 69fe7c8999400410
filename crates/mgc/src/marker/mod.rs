//! Marker Module - Parallel Mark Phase
//!
//! Marking is a flood fill over the heap starting from the roots:
//!
//! ```text
//!  roots ──ParFor──> scan_block(root) ──push──> local work buffer
//!                         ^                          │
//!                         └──── pop / get_full ──────┘
//!                                    │ handoff when others idle
//!                                    v
//!                               shared pool
//! ```
//!
//! Every value in a scanned block that falls inside the arena is treated
//! as a possible pointer. It is resolved to the start of its block (bitmap
//! boundary, backward scan within the bitmap word, then the span table),
//! marked, and queued unless the block holds no pointers. Traversal depth
//! never touches the native stack: pending objects live in pooled buffers.

pub mod bitmap;
pub mod gc_threads;
pub mod parfor;
pub mod roots;
pub mod workbuf;

pub use bitmap::{BitmapIndex, Bits};
pub use parfor::{ParFor, StealStats};
pub use roots::{Root, RootSet, RootSources};
pub use workbuf::{OwnedWorkbuf, WorkPool, WORKBUF_CAPACITY};

use crate::heap::Heap;
use crate::util::{Alignment, BackoffStats, WORD};

/// Per-worker marking counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MarkStats {
    /// Blocks marked by this worker
    pub nmarked: u64,
    /// Buffers split for idle workers
    pub nhandoff: u64,
    /// Objects moved by those splits
    pub nhandoffcnt: u64,
    pub backoff: BackoffStats,
}

impl MarkStats {
    pub fn merge(&mut self, other: &MarkStats) {
        self.nmarked += other.nmarked;
        self.nhandoff += other.nhandoff;
        self.nhandoffcnt += other.nhandoffcnt;
        self.backoff.merge(&other.backoff);
    }
}

/// One marking worker
pub struct MarkWorker<'a> {
    heap: &'a Heap,
    pool: &'a WorkPool,
    nproc: usize,
    handoff_min: usize,
    stats: MarkStats,
}

impl<'a> MarkWorker<'a> {
    /// `nproc` is the number of workers marking concurrently in this cycle
    pub fn new(heap: &'a Heap, pool: &'a WorkPool, nproc: usize, handoff_min: usize) -> Self {
        Self {
            heap,
            pool,
            nproc,
            handoff_min,
            stats: MarkStats::default(),
        }
    }

    pub fn stats(&self) -> MarkStats {
        self.stats
    }

    /// Scan one root region
    #[inline]
    pub fn mark_root(&mut self, root: &Root) {
        self.scan_block(root.ptr, root.len);
    }

    /// Take work from the shared pool until marking terminates
    pub fn drain(&mut self) {
        self.scan_block(0, 0);
    }

    /// Start of the block `v` points into, if any
    fn resolve(&self, v: usize) -> Option<usize> {
        if let Some(obj) = self.heap.bitmap().find_block_start(v) {
            return Some(obj);
        }
        let span = self.heap.lookup_span(v)?;
        if !span.in_use() {
            return None;
        }
        match span.sizeclass() {
            0 => Some(span.base()),
            _ => {
                if v >= span.limit() {
                    return None;
                }
                Some(span.base() + span.object_index(v) * span.elemsize())
            }
        }
    }

    /// Scan `[b, b + n)` and everything reachable from it
    ///
    /// `b == 0` starts from the shared pool instead. A root scan returns
    /// once its local buffer is empty; a drain (or any scan with a single
    /// worker) keeps pulling full buffers until the pool terminates.
    pub fn scan_block(&mut self, b: usize, n: usize) {
        if n > isize::MAX as usize {
            crate::fatal!("scan_block: implausible length {:#x} at {:#x}", n, b);
        }
        let heap = self.heap;
        let pool = self.pool;
        let bitmap = heap.bitmap();
        let arena_start = bitmap.arena_start();
        let arena_used = bitmap.arena_used();
        let parallel = self.nproc > 1;
        let keep_working = b == 0 || self.nproc == 1;

        let mut wbuf: Option<OwnedWorkbuf<'a>> = None;
        let (mut b, mut n) = (b, n);
        loop {
            if b != 0 {
                let start = Alignment::align_up(b, WORD);
                let words = n.saturating_sub(start - b) / WORD;
                for i in 0..words {
                    // SAFETY: roots name readable memory and reached blocks
                    // are allocated; nothing moves while the world is stopped.
                    let v = unsafe { std::ptr::read((start + i * WORD) as *const usize) };
                    if v < arena_start || v >= arena_used {
                        continue;
                    }
                    let obj = match self.resolve(v) {
                        Some(obj) => obj,
                        None => continue,
                    };

                    let slot = bitmap.slot(obj);
                    let bits = slot.bits();
                    if !bits.needs_mark() {
                        continue;
                    }
                    if !bitmap.try_mark(&slot, parallel) {
                        continue;
                    }
                    self.stats.nmarked += 1;
                    if bits.no_pointers() {
                        continue;
                    }

                    let mut buf = match wbuf.take() {
                        Some(buf)
                            if buf.len() > self.handoff_min
                                && pool.nwait() > 0
                                && !pool.has_full() =>
                        {
                            let (kept, moved) = pool.handoff(buf);
                            self.stats.nhandoff += 1;
                            self.stats.nhandoffcnt += moved as u64;
                            kept
                        }
                        Some(buf) if !buf.is_full() => buf,
                        old => pool.get_empty(old),
                    };
                    buf.push(obj);
                    wbuf = Some(buf);
                }
            }

            // Next block: local buffer first, then the pool.
            let next = loop {
                if let Some(obj) = wbuf.as_mut().and_then(|buf| buf.pop()) {
                    break obj;
                }
                if !keep_working {
                    if let Some(buf) = wbuf.take() {
                        pool.put_empty(buf);
                    }
                    return;
                }
                match pool.get_full(wbuf.take(), &mut self.stats.backoff) {
                    Some(buf) => wbuf = Some(buf),
                    None => return,
                }
            };

            b = next;
            n = match heap.lookup_span(b) {
                Some(span) => span.object_size(),
                None => crate::fatal!("scan_block: queued object {:#x} has no span", b),
            };
        }
    }
}

/// Single-threaded re-walk of the roots after the parallel pass
///
/// Uses the Special bit as a second mark bit and reports every reachable
/// block the parallel pass left unmarked. Returns how many it found.
pub fn debug_mark(heap: &Heap, roots: &[Root]) -> u64 {
    let bitmap = heap.bitmap();
    let mut stack: Vec<(usize, usize)> = roots.iter().rev().map(|r| (r.ptr, r.len)).collect();
    let mut missed = 0;

    while let Some((b, n)) = stack.pop() {
        let start = Alignment::align_up(b, WORD);
        let words = n.saturating_sub(start - b) / WORD;
        for i in 0..words {
            // SAFETY: as in `scan_block`.
            let v = unsafe { std::ptr::read((start + i * WORD) as *const usize) };
            if !bitmap.contains(v) {
                continue;
            }
            let span = match heap.lookup_span(v) {
                Some(span) if span.in_use() => span,
                _ => continue,
            };
            let obj = match span.sizeclass() {
                0 => span.base(),
                _ => {
                    if v >= span.limit() {
                        continue;
                    }
                    span.base() + span.object_index(v) * span.elemsize()
                }
            };

            let slot = bitmap.slot(obj);
            let bits = slot.bits();
            if !bits.allocated() || bits.special() {
                continue;
            }
            bitmap.set_special_at(&slot, true, true);
            if !bits.marked() {
                missed += 1;
                log::warn!(
                    "debug mark: found unmarked block {:#x} in {:#x}",
                    obj,
                    start + i * WORD
                );
            }
            if !bits.no_pointers() {
                stack.push((obj, span.object_size()));
            }
        }
    }
    missed
}
