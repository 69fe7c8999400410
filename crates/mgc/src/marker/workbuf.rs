//! Work Buffers - Shared Pool of Grey Objects
//!
//! Marking workers exchange pending objects in fixed-size buffers. Buffers
//! move between two lock-free stacks:
//!
//! ```text
//!            get_empty                      handoff / get_empty(old)
//!  empty ──────────────> worker (owns 1) ───────────────────────────> full
//!    ^                                                                 │
//!    └──────────── put_empty / get_full(old) <──── get_full ───────────┘
//! ```
//!
//! A buffer is owned by exactly one worker between a pop and the next push;
//! [`OwnedWorkbuf`] is the only way to touch its contents.
//!
//! Stack heads pack `(buffer index + 1, push count)` into one `AtomicU64`.
//! Each push bumps the pushed buffer's count, so a head that was popped and
//! pushed again never compares equal to a stale snapshot.
//!
//! Buffers are carved from chunks allocated under a lock and are never
//! individually freed; the pool keeps them for every later cycle.

use crate::util::{Backoff, BackoffStats, WORD};
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};

/// Bytes per work buffer, header included
const WORKBUF_SIZE: usize = 4096;

/// Pointers one buffer holds
pub const WORKBUF_CAPACITY: usize = (WORKBUF_SIZE - 3 * WORD) / WORD;

/// Buffers allocated per chunk
const CHUNK_BUFS: usize = 256;

/// Upper bound on chunks (1 GiB of buffers)
const MAX_CHUNKS: usize = 1024;

struct LfNode {
    next: AtomicU64,
    pushcnt: AtomicU32,
}

struct WorkbufData {
    nobj: usize,
    obj: [usize; WORKBUF_CAPACITY],
}

/// One buffer of pending objects
pub struct Workbuf {
    node: LfNode,
    data: UnsafeCell<WorkbufData>,
}

// SAFETY: `data` is only reached through an `OwnedWorkbuf`, and the pool
// hands each buffer to one owner at a time.
unsafe impl Sync for Workbuf {}

impl Workbuf {
    fn new() -> Self {
        Self {
            node: LfNode {
                next: AtomicU64::new(0),
                pushcnt: AtomicU32::new(0),
            },
            data: UnsafeCell::new(WorkbufData {
                nobj: 0,
                obj: [0; WORKBUF_CAPACITY],
            }),
        }
    }
}

/// Exclusive handle to a buffer popped from the pool
pub struct OwnedWorkbuf<'p> {
    index: u32,
    buf: &'p Workbuf,
}

impl<'p> OwnedWorkbuf<'p> {
    #[inline]
    fn data(&mut self) -> &mut WorkbufData {
        // SAFETY: this handle is the buffer's only owner.
        unsafe { &mut *self.buf.data.get() }
    }

    #[inline]
    fn data_ref(&self) -> &WorkbufData {
        // SAFETY: as above.
        unsafe { &*self.buf.data.get() }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data_ref().nobj
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() == WORKBUF_CAPACITY
    }

    /// Append an object; the caller checked `is_full` first
    #[inline]
    pub fn push(&mut self, obj: usize) {
        let data = self.data();
        debug_assert!(data.nobj < WORKBUF_CAPACITY);
        data.obj[data.nobj] = obj;
        data.nobj += 1;
    }

    #[inline]
    pub fn pop(&mut self) -> Option<usize> {
        let data = self.data();
        if data.nobj == 0 {
            return None;
        }
        data.nobj -= 1;
        Some(data.obj[data.nobj])
    }

    pub fn clear(&mut self) {
        self.data().nobj = 0;
    }
}

/// Treiber stack of buffer indices with a push-count tag
struct LfStack {
    head: CachePadded<AtomicU64>,
}

#[inline]
fn pack(index: u32, pushcnt: u32) -> u64 {
    (index as u64 + 1) | ((pushcnt as u64) << 32)
}

#[inline]
fn unpack(head: u64) -> u32 {
    (head as u32).wrapping_sub(1)
}

impl LfStack {
    fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicU64::new(0)),
        }
    }

    fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == 0
    }

    fn push(&self, pool: &WorkPool, index: u32) {
        let node = &pool.buf(index).node;
        let pushcnt = node.pushcnt.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let new = pack(index, pushcnt);
        let mut old = self.head.load(Ordering::Relaxed);
        loop {
            node.next.store(old, Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(old, new, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => old = actual,
            }
        }
    }

    fn pop(&self, pool: &WorkPool) -> Option<u32> {
        let mut old = self.head.load(Ordering::Acquire);
        loop {
            if old == 0 {
                return None;
            }
            let index = unpack(old);
            // Buffers are never freed, so reading a stale node is harmless;
            // the tag makes the CAS fail if it moved.
            let next = pool.buf(index).node.next.load(Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(old, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(index),
                Err(actual) => old = actual,
            }
        }
    }
}

struct Storage {
    chunks: Vec<Box<[Workbuf]>>,
    used: usize,
}

/// Pool of work buffers shared by all marking workers
pub struct WorkPool {
    full: LfStack,
    empty: LfStack,
    nproc: AtomicU32,
    nwait: CachePadded<AtomicU32>,
    aborted: AtomicBool,
    chunk_ptrs: Box<[AtomicPtr<Workbuf>]>,
    storage: Mutex<Storage>,
}

impl WorkPool {
    pub fn new() -> Self {
        let pool = Self {
            full: LfStack::new(),
            empty: LfStack::new(),
            nproc: AtomicU32::new(1),
            nwait: CachePadded::new(AtomicU32::new(0)),
            aborted: AtomicBool::new(false),
            chunk_ptrs: (0..MAX_CHUNKS)
                .map(|_| AtomicPtr::new(std::ptr::null_mut()))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            storage: Mutex::new(Storage {
                chunks: Vec::new(),
                used: 0,
            }),
        };
        pool.check_alignment();
        pool
    }

    /// Fatal if the stack heads cannot be updated atomically
    pub fn check_alignment(&self) {
        for head in [&*self.full.head, &*self.empty.head] {
            let addr = head as *const AtomicU64 as usize;
            if addr % std::mem::align_of::<u64>() != 0 {
                crate::fatal!("work pool head {:#x} is misaligned", addr);
            }
        }
    }

    /// Prepare for a cycle with `nproc` workers
    ///
    /// Work left behind by an abandoned cycle is discarded.
    pub fn reset(&self, nproc: usize) {
        if self.aborted.swap(false, Ordering::AcqRel) {
            while let Some(index) = self.full.pop(self) {
                self.own(index).clear();
                self.empty.push(self, index);
            }
        }
        if !self.full.is_empty() {
            crate::fatal!("work pool: full list not empty at cycle start");
        }
        self.nproc.store(nproc as u32, Ordering::Release);
        self.nwait.store(0, Ordering::Release);
    }

    #[inline]
    fn buf(&self, index: u32) -> &Workbuf {
        let index = index as usize;
        let chunk = self.chunk_ptrs[index / CHUNK_BUFS].load(Ordering::Acquire);
        debug_assert!(!chunk.is_null());
        // SAFETY: index was handed out by `alloc`, which published the
        // chunk before returning; chunks live as long as the pool.
        unsafe { &*chunk.add(index % CHUNK_BUFS) }
    }

    fn own(&self, index: u32) -> OwnedWorkbuf<'_> {
        OwnedWorkbuf {
            index,
            buf: self.buf(index),
        }
    }

    /// A never-used buffer, growing the storage by a chunk when needed
    fn alloc(&self) -> u32 {
        let mut storage = self.storage.lock();
        if storage.used == storage.chunks.len() * CHUNK_BUFS {
            let chunk_no = storage.chunks.len();
            if chunk_no == MAX_CHUNKS {
                crate::fatal!("work pool: out of work buffers");
            }
            let chunk: Box<[Workbuf]> = (0..CHUNK_BUFS).map(|_| Workbuf::new()).collect();
            self.chunk_ptrs[chunk_no].store(chunk.as_ptr() as *mut Workbuf, Ordering::Release);
            storage.chunks.push(chunk);
        }
        let index = storage.used;
        storage.used += 1;
        index as u32
    }

    /// Buffers allocated so far
    pub fn allocated(&self) -> usize {
        self.storage.lock().used
    }

    /// Publish `old` (if any) as full and return an empty buffer
    pub fn get_empty(&self, old: Option<OwnedWorkbuf<'_>>) -> OwnedWorkbuf<'_> {
        if let Some(old) = old {
            self.full.push(self, old.index);
        }
        let index = match self.empty.pop(self) {
            Some(index) => index,
            None => self.alloc(),
        };
        let mut b = self.own(index);
        debug_assert!(b.is_empty());
        b.clear();
        b
    }

    /// Return a drained buffer
    pub fn put_empty(&self, b: OwnedWorkbuf<'_>) {
        debug_assert!(b.is_empty());
        self.empty.push(self, b.index);
    }

    /// Return `old` (if any) as empty and take a full buffer
    ///
    /// With several workers, waits while others may still publish work.
    /// `None` means every worker is idle and the pool holds no work: the
    /// marking pass is over. After [`WorkPool::abort`] it also means a
    /// worker died and the pass will never be complete.
    pub fn get_full(
        &self,
        old: Option<OwnedWorkbuf<'_>>,
        stats: &mut BackoffStats,
    ) -> Option<OwnedWorkbuf<'_>> {
        if let Some(mut old) = old {
            old.clear();
            self.empty.push(self, old.index);
        }
        if let Some(index) = self.full.pop(self) {
            return Some(self.own(index));
        }
        let nproc = self.nproc.load(Ordering::Acquire);
        if nproc <= 1 {
            return None;
        }

        self.nwait.fetch_add(1, Ordering::AcqRel);
        let mut backoff = Backoff::for_work_pool();
        loop {
            if !self.full.is_empty() {
                self.nwait.fetch_sub(1, Ordering::AcqRel);
                if let Some(index) = self.full.pop(self) {
                    return Some(self.own(index));
                }
                self.nwait.fetch_add(1, Ordering::AcqRel);
            }
            if self.nwait.load(Ordering::Acquire) == nproc || self.is_aborted() {
                return None;
            }
            backoff.snooze(stats);
        }
    }

    /// Split `b`: publish it with its lower half, keep a new buffer holding
    /// the upper half
    pub fn handoff<'p>(&'p self, mut b: OwnedWorkbuf<'p>) -> (OwnedWorkbuf<'p>, usize) {
        let mut b1 = self.get_empty(None);
        let n = b.len() / 2;
        {
            let src = b.data();
            let keep = src.nobj - n;
            let dst = b1.data();
            dst.obj[..n].copy_from_slice(&src.obj[keep..keep + n]);
            dst.nobj = n;
            src.nobj = keep;
        }
        self.full.push(self, b.index);
        (b1, n)
    }

    /// Release every worker waiting in `get_full`
    ///
    /// A worker that unwinds never counts itself idle, so the others would
    /// wait for it forever.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Workers currently idle in `get_full`
    #[inline]
    pub fn nwait(&self) -> u32 {
        self.nwait.load(Ordering::Acquire)
    }

    #[inline]
    pub fn has_full(&self) -> bool {
        !self.full.is_empty()
    }
}

impl Default for WorkPool {
    fn default() -> Self {
        Self::new()
    }
}
