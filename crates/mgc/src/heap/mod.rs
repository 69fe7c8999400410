//! Heap Module - Arena, Spans and Allocation
//!
//! The allocator the collector works against. It owns the arena (and with
//! it the mark bitmap), the span table, per-class central free lists and
//! the heap counters.
//!
//! ```text
//!  context cache ──refill──> central[class] ──grow──> free spans / arena
//!        ^                        ^   │
//!        └──── release_cache ─────┘   └── free_objects (bulk, from sweep)
//! ```
//!
//! Lock order: `central[class]` → `span.alloc` → `free_spans`.

pub mod arena;
pub mod cache;
pub mod size_class;
pub mod span;

pub use arena::Arena;
pub use cache::LocalCache;
pub use size_class::{num_classes, SIZE_CLASSES};
pub use span::{Span, SpanState, SpanTable, SpanTypes, TypeCompression, BYTES_TYPE_SLOTS};

use crate::error::{GcError, Result};
use crate::marker::bitmap::BitmapIndex;
use crate::util::{nanotime, Alignment, WORD};
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// log2 of the heap page size
pub const PAGE_SHIFT: usize = 12;
/// Heap page size in bytes
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Largest object served from a size class
pub const MAX_SMALL_SIZE: usize = 32 * 1024;

/// Per-class central free list
struct Central {
    /// Spans with at least one free object
    nonempty: Vec<Arc<Span>>,
}

/// Free spans keyed by page count
#[derive(Default)]
struct FreeSpans {
    by_pages: BTreeMap<usize, Vec<Arc<Span>>>,
}

impl FreeSpans {
    fn take(&mut self, npages: usize) -> Option<Arc<Span>> {
        let list = self.by_pages.get_mut(&npages)?;
        let span = list.pop();
        if list.is_empty() {
            self.by_pages.remove(&npages);
        }
        span
    }

    fn put(&mut self, span: Arc<Span>) {
        self.by_pages.entry(span.npages()).or_default().push(span);
    }
}

/// Allocation counters for one size class
#[derive(Default)]
pub struct ClassCounters {
    pub nmalloc: AtomicU64,
    pub nfree: AtomicU64,
}

/// Heap-wide counters
#[derive(Default)]
pub struct HeapCounters {
    /// Bytes in allocated objects
    pub heap_alloc: AtomicUsize,
    pub nmalloc: AtomicU64,
    pub nfree: AtomicU64,
    /// Pages in in-use spans
    pub inuse_pages: AtomicUsize,
    /// Bytes returned to the OS by the scavenger
    pub released: AtomicUsize,
}

/// Point-in-time copy of the heap counters
#[derive(Debug, Clone, Default)]
pub struct HeapSnapshot {
    pub heap_alloc: usize,
    pub heap_sys: usize,
    pub heap_inuse: usize,
    pub heap_released: usize,
    pub nmalloc: u64,
    pub nfree: u64,
    /// `(size, nmalloc, nfree)` per class; class 0 aggregates large objects
    pub by_size: Vec<(usize, u64, u64)>,
}

/// The heap
pub struct Heap {
    arena: Arena,
    spans: SpanTable,
    central: Box<[CachePadded<Mutex<Central>>]>,
    free_spans: Mutex<FreeSpans>,
    counters: HeapCounters,
    by_size: Box<[ClassCounters]>,
    /// Cache for allocations the heap makes on its own behalf
    internal: Mutex<LocalCache>,
}

impl Heap {
    /// Reserve an arena of `arena_size` bytes
    pub fn new(arena_size: usize) -> Result<Self> {
        let arena = Arena::reserve(arena_size)?;
        let spans = SpanTable::new(arena.start(), arena.capacity_pages());
        let central = (0..num_classes())
            .map(|_| {
                CachePadded::new(Mutex::new(Central {
                    nonempty: Vec::new(),
                }))
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let by_size = (0..num_classes())
            .map(|_| ClassCounters::default())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            arena,
            spans,
            central,
            free_spans: Mutex::new(FreeSpans::default()),
            counters: HeapCounters::default(),
            by_size,
            internal: Mutex::new(LocalCache::new()),
        })
    }

    #[inline]
    pub fn bitmap(&self) -> &BitmapIndex {
        self.arena.bitmap()
    }

    #[inline]
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    #[inline]
    pub fn spans(&self) -> &SpanTable {
        &self.spans
    }

    #[inline]
    pub fn counters(&self) -> &HeapCounters {
        &self.counters
    }

    /// Bytes currently held by allocated objects
    #[inline]
    pub fn heap_alloc(&self) -> usize {
        self.counters.heap_alloc.load(Ordering::Acquire)
    }

    /// Allocated objects right now
    pub fn live_objects(&self) -> u64 {
        let nmalloc = self.counters.nmalloc.load(Ordering::Acquire);
        let nfree = self.counters.nfree.load(Ordering::Acquire);
        nmalloc.saturating_sub(nfree)
    }

    /// Allocate `size` zeroed bytes, refilling `cache` as needed
    ///
    /// The returned block is recorded as allocated in the bitmap.
    pub fn alloc(&self, cache: &mut LocalCache, size: usize, no_pointers: bool) -> Result<usize> {
        let (v, block, class) = match SIZE_CLASSES.class_for(size) {
            Some(class) => {
                let v = match cache.pop(class) {
                    Some(v) => v,
                    None => {
                        self.refill(cache, class)?;
                        cache.pop(class).ok_or(GcError::OutOfMemory {
                            requested: size,
                            available: self.arena.remaining(),
                        })?
                    }
                };
                (v, SIZE_CLASSES.size(class), class)
            }
            None => {
                if size > self.arena.capacity() {
                    return Err(GcError::OutOfMemory {
                        requested: size,
                        available: self.arena.remaining(),
                    });
                }
                let npages = Alignment::div_round_up(size, PAGE_SIZE);
                let span = self.alloc_span(npages)?;
                span.init(0, npages * PAGE_SIZE, span.base() + size);
                (span.base(), npages * PAGE_SIZE, 0)
            }
        };

        // SAFETY: [v, v + block) is a free block inside the arena owned by
        // the caller from here on.
        unsafe { std::ptr::write_bytes(v as *mut u8, 0, block) };
        if cfg!(debug_assertions) {
            self.bitmap().check_freed(v, block);
        }
        self.bitmap().mark_allocated(v, block, no_pointers, false);

        self.counters.heap_alloc.fetch_add(block, Ordering::AcqRel);
        self.counters.nmalloc.fetch_add(1, Ordering::Relaxed);
        self.by_size[class].nmalloc.fetch_add(1, Ordering::Relaxed);
        Ok(v)
    }

    /// Allocation on the heap's own behalf (type tables)
    fn alloc_internal(&self, size: usize) -> Result<usize> {
        let mut cache = self.internal.lock();
        self.alloc(&mut cache, size, true)
    }

    /// Move a batch of free objects of `class` into `cache`
    fn refill(&self, cache: &mut LocalCache, class: usize) -> Result<()> {
        let size = SIZE_CLASSES.size(class);
        let batch = (64 * 1024 / size).clamp(2, 32);
        let mut central = self.central[class].lock();

        let mut taken = 0;
        while taken < batch {
            let span = match central.nonempty.last() {
                Some(span) => Arc::clone(span),
                None => {
                    if taken > 0 {
                        break;
                    }
                    let span = self.grow_class(class)?;
                    central.nonempty.push(Arc::clone(&span));
                    span.alloc.lock().in_central = true;
                    span
                }
            };

            let mut alloc = span.alloc.lock();
            while taken < batch && alloc.freelist != 0 {
                let v = alloc.freelist;
                // SAFETY: free objects hold the link to the next one in
                // their first word.
                alloc.freelist = unsafe { *(v as *const usize) };
                alloc.allocated += 1;
                cache.push(class, v);
                taken += 1;
            }
            if alloc.freelist == 0 {
                alloc.in_central = false;
                drop(alloc);
                central.nonempty.pop();
            }
        }
        Ok(())
    }

    /// Fresh span for `class`, threaded into a free list
    fn grow_class(&self, class: usize) -> Result<Arc<Span>> {
        let size = SIZE_CLASSES.size(class);
        let npages = SIZE_CLASSES.alloc_pages(class);
        let span = self.alloc_span(npages)?;
        let n = span.len() / size;
        let base = span.base();
        span.init(class, size, base + n * size);

        self.bitmap()
            .mark_span(base, size, n, n * size < span.len());

        let mut alloc = span.alloc.lock();
        let mut next = 0;
        for i in (0..n).rev() {
            let v = base + i * size;
            // SAFETY: v is inside the span just handed to us.
            unsafe { *(v as *mut usize) = next };
            next = v;
        }
        alloc.freelist = next;
        alloc.allocated = 0;
        drop(alloc);
        Ok(span)
    }

    /// A span of exactly `npages`, reused or carved from the arena
    fn alloc_span(&self, npages: usize) -> Result<Arc<Span>> {
        let mut free = self.free_spans.lock();
        let span = match free.take(npages) {
            Some(span) => span,
            None => {
                let v = self.arena.grow(npages)?;
                let span = Arc::new(Span::new(v, npages));
                self.spans.insert(Arc::clone(&span));
                span
            }
        };
        drop(free);
        if span.is_released() {
            self.counters
                .released
                .fetch_sub(span.len(), Ordering::Relaxed);
        }
        self.counters
            .inuse_pages
            .fetch_add(npages, Ordering::Relaxed);
        Ok(span)
    }

    /// Return a span to the free pool. Its bitmap must already be cleared.
    pub fn free_span(&self, span: &Arc<Span>) {
        span.reset_free();
        self.counters
            .inuse_pages
            .fetch_sub(span.npages(), Ordering::Relaxed);
        self.free_spans.lock().put(Arc::clone(span));
    }

    /// Give `n` objects of a small-object span back to its class at once
    ///
    /// `head..end` is a chain linked through each object's first word;
    /// `end`'s link is overwritten. A span left with no objects handed out
    /// goes back to the free span pool.
    pub fn free_objects(&self, span: &Arc<Span>, head: usize, end: usize, n: usize) {
        let class = span.sizeclass();
        let mut central = self.central[class].lock();
        let mut alloc = span.alloc.lock();

        // SAFETY: end is a reclaimed object of this span.
        unsafe { *(end as *mut usize) = alloc.freelist };
        alloc.freelist = head;
        if n > alloc.allocated {
            crate::fatal!(
                "free_objects: span {:#x} frees {} of {} objects",
                span.base(),
                n,
                alloc.allocated
            );
        }
        alloc.allocated -= n;

        if alloc.allocated == 0 {
            let listed = alloc.in_central;
            alloc.freelist = 0;
            alloc.in_central = false;
            drop(alloc);
            if listed {
                central.nonempty.retain(|s| !Arc::ptr_eq(s, span));
            }
            drop(central);
            self.bitmap().unmark_span(span.base(), span.len());
            self.free_span(span);
        } else if !alloc.in_central {
            alloc.in_central = true;
            drop(alloc);
            central.nonempty.push(Arc::clone(span));
        }
    }

    /// Return every object in `cache` to its central list
    pub fn release_cache(&self, cache: &mut LocalCache) {
        for (_, v) in cache.drain() {
            let span = match self.span_of(v) {
                Some(span) => span,
                None => crate::fatal!("release_cache: object {:#x} has no span", v),
            };
            self.free_objects(&span, v, v, 1);
        }
    }

    /// Release the heap's own cache as well
    pub fn release_internal_cache(&self) {
        let mut cache = self.internal.lock();
        self.release_cache(&mut cache);
    }

    /// Owning handle of the span containing `addr`
    pub(crate) fn span_of(&self, addr: usize) -> Option<Arc<Span>> {
        if !self.bitmap().contains(addr) {
            return None;
        }
        self.spans.lookup_owned(addr)
    }

    /// Span covering `addr`, in use or not
    #[inline]
    pub fn lookup_span(&self, addr: usize) -> Option<&Span> {
        if !self.bitmap().contains(addr) {
            return None;
        }
        self.spans.lookup(addr)
    }

    /// Base and size of the allocated block containing `addr`
    pub fn lookup_object(&self, addr: usize) -> Option<(usize, usize)> {
        let span = self.lookup_span(addr)?;
        if !span.in_use() {
            return None;
        }
        let (base, size) = match span.sizeclass() {
            0 => (span.base(), span.len()),
            _ => {
                if addr >= span.limit() {
                    return None;
                }
                let size = span.elemsize();
                (span.base() + span.object_index(addr) * size, size)
            }
        };
        if !self.bitmap().bits(base).allocated() {
            return None;
        }
        Some((base, size))
    }

    /// True if `v` is the start of an allocated block
    pub fn is_allocated(&self, v: usize) -> bool {
        matches!(self.lookup_object(v), Some((base, _)) if base == v)
    }

    /// Fold sweep results into the counters
    pub fn note_freed(&self, class: usize, objects: u64, bytes: usize) {
        if objects == 0 {
            return;
        }
        self.counters.heap_alloc.fetch_sub(bytes, Ordering::AcqRel);
        self.counters.nfree.fetch_add(objects, Ordering::Relaxed);
        self.by_size[class].nfree.fetch_add(objects, Ordering::Relaxed);
    }

    /// Record a type for the object at `obj` (0 clears it)
    ///
    /// Tables for small-object spans start byte-compressed and widen to one
    /// word per object once more than seven distinct types appear.
    pub fn set_object_type(&self, obj: usize, typ: usize) -> Result<()> {
        match self.lookup_object(obj) {
            Some((base, _)) if base == obj => {}
            _ => return Err(GcError::InvalidPointer { address: obj }),
        }
        let span = self
            .span_of(obj)
            .ok_or(GcError::InvalidPointer { address: obj })?;
        let _guard = span.types_lock.lock();
        let index = span.object_index(obj);
        let n = span.object_count();

        match span.types.compression() {
            TypeCompression::Empty if typ == 0 => {}
            TypeCompression::Empty | TypeCompression::Single if span.sizeclass() == 0 => {
                if typ == 0 {
                    span.types.clear();
                } else {
                    span.types.set(TypeCompression::Single, typ);
                }
            }
            TypeCompression::Empty => {
                let table = self.alloc_internal(BYTES_TYPE_SLOTS * WORD + n)?;
                // SAFETY: fresh zeroed table sized for n objects.
                unsafe {
                    *((table + WORD) as *mut usize) = typ;
                    *((table + BYTES_TYPE_SLOTS * WORD + index) as *mut u8) = 1;
                }
                span.types.set(TypeCompression::Bytes, table);
            }
            TypeCompression::Bytes => {
                let table = span.types.data();
                let slot = if typ == 0 {
                    Some(0)
                } else {
                    (1..BYTES_TYPE_SLOTS).find(|&j| {
                        // SAFETY: header words of a live table.
                        let t = unsafe { *((table + j * WORD) as *const usize) };
                        t == typ || t == 0
                    })
                };
                match slot {
                    Some(j) => unsafe {
                        // SAFETY: as above.
                        *((table + j * WORD) as *mut usize) = if j == 0 { 0 } else { typ };
                        *((table + BYTES_TYPE_SLOTS * WORD + index) as *mut u8) = j as u8;
                    },
                    None => {
                        let words = self.alloc_internal(n * WORD)?;
                        for i in 0..n {
                            let t = if i == index { typ } else { span.types.get(i) };
                            // SAFETY: fresh table of n words.
                            unsafe { *((words + i * WORD) as *mut usize) = t };
                        }
                        span.types.set(TypeCompression::Words, words);
                    }
                }
            }
            TypeCompression::Words => {
                // SAFETY: live table of one word per object.
                unsafe { *((span.types.data() + index * WORD) as *mut usize) = typ };
            }
            TypeCompression::Single => span.types.set(TypeCompression::Single, typ),
        }
        Ok(())
    }

    /// Recorded type of the object at `obj`, 0 when none
    pub fn object_type(&self, obj: usize) -> usize {
        match self.lookup_span(obj) {
            Some(span) if span.in_use() => {
                let _guard = span.types_lock.lock();
                span.types.get(span.object_index(obj))
            }
            _ => 0,
        }
    }

    /// Write a text dump of the heap to `out`
    ///
    /// One line per span in address order, followed for in-use spans by
    /// one indented line per allocated block: address, size, the bitmap
    /// flags that are set and the recorded type, if any.
    ///
    /// ```text
    /// heap 0x7f0000000000-0x7f0004000000 used 0x7f0000003000 alloc 112 objects 2
    /// span 0x7f0000000000 pages 1 class 3 elemsize 48
    ///   0x7f0000000000 48 marked type 0x2a
    /// span 0x7f0000001000 pages 2 free released
    /// ```
    ///
    /// Consistent only while the world is stopped.
    pub fn dump<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let bitmap = self.bitmap();
        writeln!(
            out,
            "heap {:#x}-{:#x} used {:#x} alloc {} objects {}",
            self.arena.start(),
            self.arena.end(),
            self.arena.used(),
            self.heap_alloc(),
            self.live_objects()
        )?;

        let mut spans = self.spans.snapshot();
        spans.sort_by_key(|span| span.base());
        for span in &spans {
            if !span.in_use() {
                let released = if span.is_released() { " released" } else { "" };
                writeln!(
                    out,
                    "span {:#x} pages {} free{}",
                    span.base(),
                    span.npages(),
                    released
                )?;
                continue;
            }

            let size = span.object_size();
            writeln!(
                out,
                "span {:#x} pages {} class {} elemsize {}",
                span.base(),
                span.npages(),
                span.sizeclass(),
                size
            )?;
            for i in 0..span.object_count() {
                let obj = span.base() + i * size;
                let bits = bitmap.bits(obj);
                if !bits.allocated() {
                    continue;
                }
                write!(out, "  {:#x} {}", obj, size)?;
                if bits.no_pointers() {
                    write!(out, " noscan")?;
                }
                if bits.marked() {
                    write!(out, " marked")?;
                }
                if bits.special() {
                    write!(out, " special")?;
                }
                let typ = self.object_type(obj);
                if typ != 0 {
                    write!(out, " type {:#x}", typ)?;
                }
                writeln!(out)?;
            }
        }
        Ok(())
    }

    /// Give the memory of spans idle for at least `idle_for` back to the OS
    ///
    /// Returns the number of bytes released.
    pub fn scavenge(&self, idle_for: Duration) -> usize {
        let now = nanotime();
        let limit = idle_for.as_nanos() as u64;
        let free = self.free_spans.lock();
        let mut released = 0;
        for span in free.by_pages.values().flatten() {
            let since = span.unused_since();
            if since == 0 || span.is_released() || now.saturating_sub(since) < limit {
                continue;
            }
            self.arena.release(span.base(), span.len());
            span.set_released();
            released += span.len();
        }
        drop(free);
        self.counters.released.fetch_add(released, Ordering::Relaxed);
        released
    }

    /// Consistent only while the world is stopped
    pub fn snapshot(&self) -> HeapSnapshot {
        let bitmap = self.bitmap();
        HeapSnapshot {
            heap_alloc: self.heap_alloc(),
            heap_sys: (self.arena.used() - self.arena.start()) + bitmap.mapped(),
            heap_inuse: self.counters.inuse_pages.load(Ordering::Relaxed) * PAGE_SIZE,
            heap_released: self.counters.released.load(Ordering::Relaxed),
            nmalloc: self.counters.nmalloc.load(Ordering::Relaxed),
            nfree: self.counters.nfree.load(Ordering::Relaxed),
            by_size: self
                .by_size
                .iter()
                .enumerate()
                .map(|(class, c)| {
                    (
                        SIZE_CLASSES.size(class),
                        c.nmalloc.load(Ordering::Relaxed),
                        c.nfree.load(Ordering::Relaxed),
                    )
                })
                .collect(),
        }
    }
}
