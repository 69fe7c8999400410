//! Mark Bitmap - Per-Word Allocation State
//!
//! Every heap word owns four bits in a side bitmap that lives immediately
//! below the arena and grows toward lower addresses:
//!
//! ```text
//!            bitmap (grows down)               arena (grows up)
//!   ... | word 2 | word 1 | word 0 | arena_start ............ arena_used
//!                                  ^
//!   heap word at offset `off` -> bitmap word `off / 16`, shift `off % 16`
//! ```
//!
//! One bitmap word covers [`WORDS_PER_BITMAP_WORD`] heap words; the four bits
//! of heap word `i` (within that group) sit at `i`, `i + 16`, `i + 32` and
//! `i + 48` on a 64-bit target:
//!
//! | bit                    | meaning                                       |
//! |------------------------|-----------------------------------------------|
//! | Allocated              | first word of an allocated block              |
//! | NoPointers / Boundary  | allocated: holds no pointers; free: a block starts here |
//! | Marked                 | reached in the current cycle                  |
//! | Special                | has a finalizer or is profiled                |
//!
//! Nothing outside this module shifts or masks bitmap words.

use crate::util::WORD;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Heap words described by one bitmap word
pub const WORDS_PER_BITMAP_WORD: usize = usize::BITS as usize / 4;

/// Distance between the four bits of one heap word
pub const BIT_SHIFT: usize = WORDS_PER_BITMAP_WORD;

pub const BIT_ALLOCATED: usize = 1;
pub const BIT_NO_POINTERS: usize = 1 << BIT_SHIFT;
pub const BIT_BLOCK_BOUNDARY: usize = 1 << BIT_SHIFT;
pub const BIT_MARKED: usize = 1 << (2 * BIT_SHIFT);
pub const BIT_SPECIAL: usize = 1 << (3 * BIT_SHIFT);

/// All four bits of one heap word
pub const BIT_MASK: usize = BIT_ALLOCATED | BIT_NO_POINTERS | BIT_MARKED | BIT_SPECIAL;

/// Granularity in which the bitmap region is accounted as mapped
pub const BITMAP_CHUNK: usize = 8192;

/// Bits of one heap word, shifted down to the low positions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bits(usize);

impl Bits {
    #[inline]
    pub fn allocated(self) -> bool {
        self.0 & BIT_ALLOCATED != 0
    }

    #[inline]
    pub fn no_pointers(self) -> bool {
        self.0 & BIT_NO_POINTERS != 0
    }

    #[inline]
    pub fn boundary(self) -> bool {
        self.0 & BIT_BLOCK_BOUNDARY != 0
    }

    #[inline]
    pub fn marked(self) -> bool {
        self.0 & BIT_MARKED != 0
    }

    #[inline]
    pub fn special(self) -> bool {
        self.0 & BIT_SPECIAL != 0
    }

    /// Allocated, or a free block boundary
    #[inline]
    pub fn starts_block(self) -> bool {
        self.0 & (BIT_ALLOCATED | BIT_BLOCK_BOUNDARY) != 0
    }

    /// Allocated and not yet marked
    #[inline]
    pub fn needs_mark(self) -> bool {
        self.0 & (BIT_ALLOCATED | BIT_MARKED) == BIT_ALLOCATED
    }
}

/// Location of one heap word's bits
#[derive(Clone, Copy)]
pub struct BitSlot<'a> {
    word: &'a AtomicUsize,
    index: usize,
    shift: usize,
}

impl<'a> BitSlot<'a> {
    #[inline]
    pub fn bits(&self) -> Bits {
        Bits(self.word.load(Ordering::Acquire) >> self.shift)
    }

    /// Bitmap word index, counted downward from `arena_start`
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn shift(&self) -> usize {
        self.shift
    }

    /// Replace this word's four bits with `bits`, leaving its neighbours
    /// intact. CAS unless the caller is the only writer of this bitmap word.
    #[inline]
    fn replace(&self, bits: usize, exclusive: bool) {
        let mask = BIT_MASK << self.shift;
        let new_bits = bits << self.shift;
        if exclusive {
            let old = self.word.load(Ordering::Relaxed);
            self.word.store((old & !mask) | new_bits, Ordering::Release);
            return;
        }
        let mut old = self.word.load(Ordering::Relaxed);
        loop {
            match self.word.compare_exchange_weak(
                old,
                (old & !mask) | new_bits,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => old = actual,
            }
        }
    }

    /// Set or clear a single bit of this word
    #[inline]
    fn update(&self, bit: usize, on: bool, exclusive: bool) {
        let bit = bit << self.shift;
        if exclusive {
            let old = self.word.load(Ordering::Relaxed);
            let new = if on { old | bit } else { old & !bit };
            self.word.store(new, Ordering::Release);
            return;
        }
        if on {
            self.word.fetch_or(bit, Ordering::AcqRel);
        } else {
            self.word.fetch_and(!bit, Ordering::AcqRel);
        }
    }
}

/// Bitmap index over one arena
///
/// The caller guarantees the memory `[arena_start - arena_len / 16,
/// arena_end)` stays valid for the lifetime of the index.
pub struct BitmapIndex {
    arena_start: usize,
    arena_end: usize,
    arena_used: AtomicUsize,
    bitmap_mapped: AtomicUsize,
}

impl BitmapIndex {
    /// # Safety
    /// `arena_start` must be word aligned and the bitmap region below it
    /// (`(arena_end - arena_start) / WORDS_PER_BITMAP_WORD` bytes) plus the
    /// arena itself must be readable and writable for as long as the index
    /// is used.
    pub unsafe fn new(arena_start: usize, arena_end: usize) -> Self {
        debug_assert!(arena_start % WORD == 0);
        Self {
            arena_start,
            arena_end,
            arena_used: AtomicUsize::new(arena_start),
            bitmap_mapped: AtomicUsize::new(0),
        }
    }

    /// Bytes of bitmap needed to cover `arena_len` bytes of arena
    pub fn bitmap_len(arena_len: usize) -> usize {
        arena_len / WORDS_PER_BITMAP_WORD
    }

    #[inline]
    pub fn arena_start(&self) -> usize {
        self.arena_start
    }

    #[inline]
    pub fn arena_end(&self) -> usize {
        self.arena_end
    }

    #[inline]
    pub fn arena_used(&self) -> usize {
        self.arena_used.load(Ordering::Acquire)
    }

    /// Bytes of bitmap accounted as mapped
    pub fn mapped(&self) -> usize {
        self.bitmap_mapped.load(Ordering::Acquire)
    }

    /// Address inside `[arena_start, arena_used)`
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.arena_start && addr < self.arena_used()
    }

    /// Advance `arena_used` and grow the mapped bitmap region with it.
    ///
    /// Called by the heap with its growth lock held.
    pub(crate) fn grow(&self, new_used: usize) {
        if new_used > self.arena_end || new_used < self.arena_used() {
            crate::fatal!(
                "bitmap grow: arena_used {:#x} outside [{:#x}, {:#x}]",
                new_used,
                self.arena_used(),
                self.arena_end
            );
        }
        self.map_bits(new_used);
        self.arena_used.store(new_used, Ordering::Release);
    }

    fn map_bits(&self, arena_used: usize) {
        let need = Self::bitmap_len(arena_used - self.arena_start);
        let need = need.div_ceil(BITMAP_CHUNK) * BITMAP_CHUNK;
        if need > self.mapped() {
            self.bitmap_mapped.store(need, Ordering::Release);
        }
    }

    #[inline]
    fn word_at(&self, index: usize) -> &AtomicUsize {
        let addr = self.arena_start - (index + 1) * WORD;
        // SAFETY: index < arena_len / (WORD * WORDS_PER_BITMAP_WORD), so
        // addr lies in the bitmap region the constructor's caller vouched for.
        unsafe { &*(addr as *const AtomicUsize) }
    }

    /// Bits of the heap word containing `addr`
    ///
    /// Fatal outside `[arena_start, arena_used)`.
    #[inline]
    pub fn slot(&self, addr: usize) -> BitSlot<'_> {
        if !self.contains(addr) {
            crate::fatal!(
                "bitmap: pointer {:#x} outside arena [{:#x}, {:#x})",
                addr,
                self.arena_start,
                self.arena_used()
            );
        }
        let off = (addr - self.arena_start) / WORD;
        let index = off / WORDS_PER_BITMAP_WORD;
        if (index + 1) * WORD > self.mapped() {
            crate::fatal!(
                "bitmap: pointer {:#x} inconsistent with mapped bitmap ({} bytes)",
                addr,
                self.mapped()
            );
        }
        BitSlot {
            word: self.word_at(index),
            index,
            shift: off % WORDS_PER_BITMAP_WORD,
        }
    }

    /// Heap address described by `(bitmap word index, shift)`
    pub fn address_of(&self, index: usize, shift: usize) -> usize {
        self.arena_start + (index * WORDS_PER_BITMAP_WORD + shift) * WORD
    }

    #[inline]
    pub fn bits(&self, addr: usize) -> Bits {
        self.slot(addr).bits()
    }

    fn check_range(&self, v: usize, len: usize, what: &str) {
        if v < self.arena_start || v + len > self.arena_used() {
            crate::fatal!("{}: bad pointer {:#x}+{}", what, v, len);
        }
    }

    /// Record a fresh allocation of `size` bytes at `v`
    pub fn mark_allocated(&self, v: usize, size: usize, no_pointers: bool, exclusive: bool) {
        self.check_range(v, size, "mark_allocated");
        let mut bits = BIT_ALLOCATED;
        if no_pointers {
            bits |= BIT_NO_POINTERS;
        }
        self.slot(v).replace(bits, exclusive);
    }

    /// Turn the block at `v` back into a free block boundary
    pub fn mark_freed(&self, v: usize, size: usize, exclusive: bool) {
        self.check_range(v, size, "mark_freed");
        self.slot(v).replace(BIT_BLOCK_BOUNDARY, exclusive);
    }

    /// Fatal if the block at `v` is still allocated
    pub fn check_freed(&self, v: usize, _size: usize) {
        if !self.contains(v) {
            return;
        }
        if self.bits(v).allocated() {
            crate::fatal!("check_freed: double free or free of live block {:#x}", v);
        }
    }

    /// Lay out `n` free blocks of `size` bytes starting at `v`
    ///
    /// With `leftover`, one extra boundary is written after the last block so
    /// a tail fragment never looks like part of it.
    pub fn mark_span(&self, v: usize, size: usize, n: usize, leftover: bool) {
        self.check_range(v, size * n, "mark_span");
        let count = if leftover { n + 1 } else { n };
        let mut p = v;
        for _ in 0..count {
            if !self.contains(p) {
                break;
            }
            self.slot(p).replace(BIT_BLOCK_BOUNDARY, true);
            p += size;
        }
    }

    /// Zero all bits for `[v, v + len)`
    ///
    /// Both `v` and `len` must cover whole bitmap words.
    pub fn unmark_span(&self, v: usize, len: usize) {
        self.check_range(v, len, "unmark_span");
        let off = (v - self.arena_start) / WORD;
        if off % WORDS_PER_BITMAP_WORD != 0 {
            crate::fatal!("unmark_span: unaligned pointer {:#x}", v);
        }
        let words = len / WORD;
        if words % WORDS_PER_BITMAP_WORD != 0 {
            crate::fatal!("unmark_span: unaligned length {}", len);
        }
        let first = off / WORDS_PER_BITMAP_WORD;
        for index in first..first + words / WORDS_PER_BITMAP_WORD {
            self.word_at(index).store(0, Ordering::Release);
        }
    }

    /// Set Marked; false when it was already set
    #[inline]
    pub fn try_mark(&self, slot: &BitSlot<'_>, parallel: bool) -> bool {
        let bit = BIT_MARKED << slot.shift;
        if !parallel {
            let old = slot.word.load(Ordering::Relaxed);
            if old & bit != 0 {
                return false;
            }
            slot.word.store(old | bit, Ordering::Relaxed);
            return true;
        }
        // Same word protocol as `BitSlot::replace` narrowed to one bit: the
        // OR leaves neighbouring words' bits alone and one worker wins.
        slot.word.fetch_or(bit, Ordering::AcqRel) & bit == 0
    }

    /// Clear Marked on a survivor; the sweeper owns the span
    #[inline]
    pub fn clear_marked(&self, slot: &BitSlot<'_>) {
        slot.update(BIT_MARKED, false, true);
    }

    /// Reset a reclaimed block to "free boundary only"
    #[inline]
    pub fn reset_to_boundary(&self, slot: &BitSlot<'_>) {
        slot.replace(BIT_BLOCK_BOUNDARY, true);
    }

    pub fn is_special(&self, v: usize) -> bool {
        self.bits(v).special()
    }

    pub fn set_special(&self, v: usize, on: bool) {
        self.slot(v).update(BIT_SPECIAL, on, false);
    }

    /// Set the Special bit through an already located slot
    #[inline]
    pub(crate) fn set_special_at(&self, slot: &BitSlot<'_>, on: bool, exclusive: bool) {
        slot.update(BIT_SPECIAL, on, exclusive);
    }

    /// Resolve `addr` to the start of the block containing it using the
    /// bitmap alone: the word itself, then earlier words covered by the
    /// same bitmap word. `None` means the span table has to decide.
    #[inline]
    pub fn find_block_start(&self, addr: usize) -> Option<usize> {
        let obj = addr & !(WORD - 1);
        let slot = self.slot(obj);
        let xbits = slot.word.load(Ordering::Acquire);
        if Bits(xbits >> slot.shift).starts_block() {
            return Some(obj);
        }
        let mut shift = slot.shift;
        let mut p = obj;
        while shift > 0 {
            shift -= 1;
            p -= WORD;
            if Bits(xbits >> shift).starts_block() {
                return Some(p);
            }
        }
        None
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Heap-backed bitmap + arena for tests that run without a real heap
    pub(crate) struct TestArena {
        _mem: Vec<usize>,
        pub index: BitmapIndex,
    }

    impl TestArena {
        pub(crate) fn new(arena_words: usize) -> Self {
            let bitmap_words = arena_words / WORDS_PER_BITMAP_WORD;
            let mut mem = vec![0usize; bitmap_words + arena_words];
            let base = mem.as_mut_ptr() as usize;
            let start = base + bitmap_words * WORD;
            let end = start + arena_words * WORD;
            let index = unsafe { BitmapIndex::new(start, end) };
            index.grow(end);
            Self { _mem: mem, index }
        }
    }

    #[test]
    fn test_slot_address_round_trip() {
        let arena = TestArena::new(4096);
        let bm = &arena.index;
        for word in [0usize, 1, 15, 16, 17, 255, 4095] {
            let addr = bm.arena_start() + word * WORD;
            let slot = bm.slot(addr);
            assert_eq!(slot.index(), word / WORDS_PER_BITMAP_WORD);
            assert_eq!(slot.shift(), word % WORDS_PER_BITMAP_WORD);
            assert_eq!(bm.address_of(slot.index(), slot.shift()), addr);
        }
    }

    #[test]
    fn test_mark_allocated_and_freed() {
        let arena = TestArena::new(1024);
        let bm = &arena.index;
        let v = bm.arena_start() + 3 * WORD;

        bm.mark_allocated(v, 32, true, false);
        let bits = bm.bits(v);
        assert!(bits.allocated());
        assert!(bits.no_pointers());
        assert!(!bits.marked());

        bm.mark_freed(v, 32, false);
        let bits = bm.bits(v);
        assert!(!bits.allocated());
        assert!(bits.boundary());
        bm.check_freed(v, 32);
    }

    #[test]
    fn test_neighbouring_words_do_not_interfere() {
        let arena = TestArena::new(1024);
        let bm = &arena.index;
        let a = bm.arena_start();
        let b = a + WORD;

        bm.mark_allocated(a, WORD, false, false);
        bm.mark_allocated(b, WORD, true, false);
        assert!(bm.try_mark(&bm.slot(a), true));
        assert!(!bm.try_mark(&bm.slot(a), true));
        assert!(!bm.bits(b).marked());
        assert!(bm.bits(b).no_pointers());
        assert!(!bm.bits(a).no_pointers());
    }

    #[test]
    fn test_find_block_start_scans_backward_within_bitmap_word() {
        let arena = TestArena::new(1024);
        let bm = &arena.index;
        let obj = bm.arena_start() + 2 * WORD;
        bm.mark_allocated(obj, 8 * WORD, false, true);

        assert_eq!(bm.find_block_start(obj), Some(obj));
        assert_eq!(bm.find_block_start(obj + 5 * WORD + 3), Some(obj));
        // First word of the next bitmap word cannot see back across.
        let far = bm.arena_start() + WORDS_PER_BITMAP_WORD * WORD;
        assert_eq!(bm.find_block_start(far), None);
    }

    #[test]
    fn test_mark_span_and_unmark_span() {
        let arena = TestArena::new(2048);
        let bm = &arena.index;
        let v = bm.arena_start();
        let size = 48;

        bm.mark_span(v, size, 10, true);
        for i in 0..=10 {
            assert!(bm.bits(v + i * size).boundary(), "block {}", i);
        }
        assert!(!bm.bits(v + WORD).boundary());

        let len = WORDS_PER_BITMAP_WORD * WORD * 4;
        bm.unmark_span(v, len);
        for i in 0..10 {
            assert!(!bm.bits(v + i * size).starts_block());
        }
    }

    #[test]
    #[should_panic(expected = "unmark_span: unaligned pointer")]
    fn test_unmark_span_rejects_unaligned_pointer() {
        let arena = TestArena::new(1024);
        let bm = &arena.index;
        bm.unmark_span(bm.arena_start() + WORD, WORDS_PER_BITMAP_WORD * WORD);
    }

    #[test]
    #[should_panic(expected = "outside arena")]
    fn test_slot_outside_arena_is_fatal() {
        let arena = TestArena::new(1024);
        let bm = &arena.index;
        bm.slot(bm.arena_start() - WORD);
    }

    #[test]
    fn test_special_bit() {
        let arena = TestArena::new(1024);
        let bm = &arena.index;
        let v = bm.arena_start() + 64;
        bm.mark_allocated(v, 64, false, false);
        assert!(!bm.is_special(v));
        bm.set_special(v, true);
        assert!(bm.is_special(v));
        assert!(bm.bits(v).allocated());
        bm.set_special(v, false);
        assert!(!bm.is_special(v));
    }

    #[test]
    fn test_parallel_marking_marks_each_word_once() {
        let arena = TestArena::new(WORDS_PER_BITMAP_WORD * 8);
        let bm = &arena.index;
        let start = bm.arena_start();
        for i in 0..WORDS_PER_BITMAP_WORD * 8 {
            bm.mark_allocated(start + i * WORD, WORD, false, true);
        }

        let wins = AtomicUsize::new(0);
        crossbeam::scope(|s| {
            for _ in 0..4 {
                s.spawn(|_| {
                    for i in 0..WORDS_PER_BITMAP_WORD * 8 {
                        if bm.try_mark(&bm.slot(start + i * WORD), true) {
                            wins.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        })
        .unwrap();

        assert_eq!(wins.load(Ordering::Relaxed), WORDS_PER_BITMAP_WORD * 8);
        for i in 0..WORDS_PER_BITMAP_WORD * 8 {
            let bits = bm.bits(start + i * WORD);
            assert!(bits.allocated() && bits.marked());
        }
    }
}
