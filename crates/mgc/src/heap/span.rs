//! Spans - Contiguous Page Runs
//!
//! A span covers `npages` pages starting at a page boundary. It is either
//! free or in use; an in-use span holds one large object (size class 0) or
//! an array of equal-sized small objects. Spans are never split or
//! coalesced, so their page range is fixed for life and a free span is only
//! reused for a request of exactly its page count.

use super::{PAGE_SHIFT, PAGE_SIZE};
use crate::heap::size_class::SIZE_CLASSES;
use crate::util::WORD;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SpanState {
    Free = 0,
    InUse = 1,
}

/// Encoding of a span's per-object type table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeCompression {
    /// No type information recorded
    Empty = 0,
    /// Large span: `data` is the type of its only object
    Single = 1,
    /// `data` points to one word per object
    Words = 2,
    /// `data` points to [`BYTES_TYPE_SLOTS`] type words followed by one
    /// index byte per object
    Bytes = 3,
}

impl TypeCompression {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => TypeCompression::Single,
            2 => TypeCompression::Words,
            3 => TypeCompression::Bytes,
            _ => TypeCompression::Empty,
        }
    }
}

/// Type words stored in front of a byte-compressed table. Slot 0 means
/// "no type", so seven distinct types fit.
pub const BYTES_TYPE_SLOTS: usize = 8;

/// Optional per-object type metadata
///
/// `data` is the one word the root enumerator treats as a root when the
/// table lives in the collected heap.
pub struct SpanTypes {
    compression: AtomicU8,
    data: AtomicUsize,
}

impl SpanTypes {
    fn new() -> Self {
        Self {
            compression: AtomicU8::new(TypeCompression::Empty as u8),
            data: AtomicUsize::new(0),
        }
    }

    pub fn compression(&self) -> TypeCompression {
        TypeCompression::from_u8(self.compression.load(Ordering::Acquire))
    }

    pub fn data(&self) -> usize {
        self.data.load(Ordering::Acquire)
    }

    /// Address of the word holding the table pointer
    pub fn data_addr(&self) -> usize {
        &self.data as *const AtomicUsize as usize
    }

    pub(crate) fn set(&self, compression: TypeCompression, data: usize) {
        self.data.store(data, Ordering::Release);
        self.compression.store(compression as u8, Ordering::Release);
    }

    pub(crate) fn clear(&self) {
        self.set(TypeCompression::Empty, 0);
    }

    /// Forget the type of object `index`; the span's sweeper owns it
    pub(crate) fn clear_entry(&self, index: usize) {
        let data = self.data();
        // SAFETY: the table was sized for every object of the span and is
        // kept alive by its root for the whole cycle.
        unsafe {
            match self.compression() {
                TypeCompression::Words => *((data + index * WORD) as *mut usize) = 0,
                TypeCompression::Bytes => {
                    *((data + BYTES_TYPE_SLOTS * WORD + index) as *mut u8) = 0
                }
                TypeCompression::Empty | TypeCompression::Single => {}
            }
        }
    }

    /// Recorded type of object `index`, 0 when none
    pub fn get(&self, index: usize) -> usize {
        let data = self.data();
        // SAFETY: see `clear_entry`.
        unsafe {
            match self.compression() {
                TypeCompression::Empty => 0,
                TypeCompression::Single => data,
                TypeCompression::Words => *((data + index * WORD) as *const usize),
                TypeCompression::Bytes => {
                    let slot = *((data + BYTES_TYPE_SLOTS * WORD + index) as *const u8) as usize;
                    *((data + slot * WORD) as *const usize)
                }
            }
        }
    }
}

/// Free-list state of a small-object span, guarded by its class lock
pub(crate) struct SpanAlloc {
    /// First free object; each free object's first word links to the next
    pub freelist: usize,
    /// Objects handed out (allocated or sitting in a context cache)
    pub allocated: usize,
    /// Listed in its class's non-empty list
    pub in_central: bool,
}

/// A run of pages
pub struct Span {
    base: usize,
    npages: usize,
    state: AtomicU8,
    sizeclass: AtomicUsize,
    elemsize: AtomicUsize,
    limit: AtomicUsize,
    unused_since: AtomicU64,
    released: AtomicBool,
    pub types: SpanTypes,
    pub(crate) types_lock: Mutex<()>,
    pub(crate) alloc: Mutex<SpanAlloc>,
}

impl Span {
    pub(crate) fn new(base: usize, npages: usize) -> Self {
        Self {
            base,
            npages,
            state: AtomicU8::new(SpanState::Free as u8),
            sizeclass: AtomicUsize::new(0),
            elemsize: AtomicUsize::new(0),
            limit: AtomicUsize::new(base),
            unused_since: AtomicU64::new(0),
            released: AtomicBool::new(false),
            types: SpanTypes::new(),
            types_lock: Mutex::new(()),
            alloc: Mutex::new(SpanAlloc {
                freelist: 0,
                allocated: 0,
                in_central: false,
            }),
        }
    }

    /// Turn a free span into an in-use one
    pub(crate) fn init(&self, sizeclass: usize, elemsize: usize, limit: usize) {
        self.sizeclass.store(sizeclass, Ordering::Relaxed);
        self.elemsize.store(elemsize, Ordering::Relaxed);
        self.limit.store(limit, Ordering::Relaxed);
        self.unused_since.store(0, Ordering::Relaxed);
        self.released.store(false, Ordering::Relaxed);
        self.types.clear();
        {
            let mut alloc = self.alloc.lock();
            alloc.freelist = 0;
            alloc.allocated = 0;
            alloc.in_central = false;
        }
        self.state.store(SpanState::InUse as u8, Ordering::Release);
    }

    /// Turn an in-use span back into a free one
    pub(crate) fn reset_free(&self) {
        self.state.store(SpanState::Free as u8, Ordering::Release);
        self.sizeclass.store(0, Ordering::Relaxed);
        self.elemsize.store(0, Ordering::Relaxed);
        self.limit.store(self.base, Ordering::Relaxed);
        self.unused_since.store(0, Ordering::Relaxed);
        self.types.clear();
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    #[inline]
    pub fn npages(&self) -> usize {
        self.npages
    }

    /// Bytes covered by the span
    #[inline]
    pub fn len(&self) -> usize {
        self.npages << PAGE_SHIFT
    }

    #[inline]
    pub fn state(&self) -> SpanState {
        if self.state.load(Ordering::Acquire) == SpanState::InUse as u8 {
            SpanState::InUse
        } else {
            SpanState::Free
        }
    }

    #[inline]
    pub fn in_use(&self) -> bool {
        self.state() == SpanState::InUse
    }

    #[inline]
    pub fn sizeclass(&self) -> usize {
        self.sizeclass.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn elemsize(&self) -> usize {
        self.elemsize.load(Ordering::Relaxed)
    }

    /// End of the last whole object
    #[inline]
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Relaxed)
    }

    /// Objects laid out in this span
    pub fn object_count(&self) -> usize {
        match self.sizeclass() {
            0 => 1,
            class => {
                (SIZE_CLASSES.alloc_pages(class) << PAGE_SHIFT) / SIZE_CLASSES.size(class)
            }
        }
    }

    /// Size the collector scans for an object in this span
    #[inline]
    pub fn object_size(&self) -> usize {
        match self.sizeclass() {
            0 => self.len(),
            class => SIZE_CLASSES.size(class),
        }
    }

    /// Index of the object containing `addr`
    #[inline]
    pub fn object_index(&self, addr: usize) -> usize {
        match self.sizeclass() {
            0 => 0,
            _ => (addr - self.base) / self.elemsize(),
        }
    }

    pub fn unused_since(&self) -> u64 {
        self.unused_since.load(Ordering::Relaxed)
    }

    /// Record when a free span was first seen unused
    pub(crate) fn stamp_unused(&self, now: u64) {
        let _ = self
            .unused_since
            .compare_exchange(0, now, Ordering::Relaxed, Ordering::Relaxed);
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Relaxed)
    }

    pub(crate) fn set_released(&self) {
        self.released.store(true, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Span")
            .field("base", &format_args!("{:#x}", self.base))
            .field("npages", &self.npages)
            .field("state", &self.state())
            .field("sizeclass", &self.sizeclass())
            .finish()
    }
}

/// Page-to-span map plus the list of every span ever created
pub struct SpanTable {
    arena_start: usize,
    page_map: Box<[AtomicPtr<Span>]>,
    all: RwLock<Vec<Arc<Span>>>,
}

impl SpanTable {
    pub fn new(arena_start: usize, capacity_pages: usize) -> Self {
        let page_map = (0..capacity_pages)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            arena_start,
            page_map,
            all: RwLock::new(Vec::new()),
        }
    }

    /// Register a newly carved span
    pub(crate) fn insert(&self, span: Arc<Span>) {
        let first = (span.base() - self.arena_start) / PAGE_SIZE;
        let ptr = Arc::as_ptr(&span) as *mut Span;
        for page in first..first + span.npages() {
            self.page_map[page].store(ptr, Ordering::Release);
        }
        self.all.write().push(span);
    }

    /// Span covering `addr`; the caller has checked `addr` is in the arena
    #[inline]
    pub fn lookup(&self, addr: usize) -> Option<&Span> {
        let page = (addr - self.arena_start) / PAGE_SIZE;
        let ptr = self.page_map.get(page)?.load(Ordering::Acquire);
        if ptr.is_null() {
            return None;
        }
        // SAFETY: spans are owned by `all` and never removed, so the
        // pointer stays valid as long as the table does.
        Some(unsafe { &*ptr })
    }

    /// Like [`lookup`](Self::lookup), returning a counted handle
    pub fn lookup_owned(&self, addr: usize) -> Option<Arc<Span>> {
        let page = (addr - self.arena_start) / PAGE_SIZE;
        let ptr = self.page_map.get(page)?.load(Ordering::Acquire);
        if ptr.is_null() {
            return None;
        }
        // SAFETY: ptr came from `Arc::as_ptr` on a span that `all` keeps
        // alive forever; bumping the count first makes `from_raw` balanced.
        unsafe {
            Arc::increment_strong_count(ptr as *const Span);
            Some(Arc::from_raw(ptr as *const Span))
        }
    }

    /// Every span, in creation order
    pub fn snapshot(&self) -> Vec<Arc<Span>> {
        self.all.read().clone()
    }

    pub fn len(&self) -> usize {
        self.all.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
