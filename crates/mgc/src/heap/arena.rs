//! Arena - Reserved Address Space
//!
//! One anonymous mapping holds the mark bitmap followed by the arena:
//!
//! ```text
//! map_base                 arena_start                         arena_end
//!    | slack |   bitmap    |   pages handed out ->  | unused ...     |
//!                          ^ page aligned            ^ arena_used
//! ```
//!
//! `arena_used` only grows. Pages below it are either in an in-use span or
//! in a free span waiting for reuse.

use super::PAGE_SIZE;
use crate::error::{GcError, Result};
use crate::marker::bitmap::BitmapIndex;
use crate::util::Alignment;
use memmap2::MmapMut;

/// Reserved arena plus its bitmap
pub struct Arena {
    bitmap: BitmapIndex,
    // Keeps the reservation alive; never accessed directly.
    _map: MmapMut,
}

impl Arena {
    /// Reserve `arena_size` bytes of arena and the bitmap that covers it
    pub fn reserve(arena_size: usize) -> Result<Self> {
        let os_page = page_size::get();
        if os_page > PAGE_SIZE && os_page % PAGE_SIZE != 0 {
            return Err(GcError::HeapInitialization(format!(
                "system page size {} incompatible with heap page size {}",
                os_page, PAGE_SIZE
            )));
        }
        let align = PAGE_SIZE.max(os_page);
        let arena_size = Alignment::align_up(arena_size, PAGE_SIZE);
        let bitmap_len = Alignment::align_up(BitmapIndex::bitmap_len(arena_size), align);
        let total = bitmap_len + arena_size + align;

        let map = MmapMut::map_anon(total).map_err(|e| {
            GcError::HeapInitialization(format!("failed to reserve {} bytes: {}", total, e))
        })?;

        let base = map.as_ptr() as usize;
        let arena_start = Alignment::align_up(base + bitmap_len, align);
        let arena_end = arena_start + arena_size;
        debug_assert!(arena_end <= base + total);

        // SAFETY: [arena_start - bitmap_len, arena_end) lies inside `map`,
        // which lives as long as the index.
        let bitmap = unsafe { BitmapIndex::new(arena_start, arena_end) };

        log::debug!(
            "arena reserved: {:#x}..{:#x} ({} MB, bitmap {} KB)",
            arena_start,
            arena_end,
            arena_size >> 20,
            bitmap_len >> 10
        );

        Ok(Self { bitmap, _map: map })
    }

    #[inline]
    pub fn bitmap(&self) -> &BitmapIndex {
        &self.bitmap
    }

    #[inline]
    pub fn start(&self) -> usize {
        self.bitmap.arena_start()
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.bitmap.arena_end()
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.bitmap.arena_used()
    }

    /// Bytes still available above `arena_used`
    pub fn remaining(&self) -> usize {
        self.end() - self.used()
    }

    /// Hand out `npages` fresh pages from the top of the arena
    ///
    /// Caller holds the heap growth lock.
    pub(crate) fn grow(&self, npages: usize) -> Result<usize> {
        let bytes = match npages.checked_mul(PAGE_SIZE) {
            Some(bytes) if bytes <= self.remaining() => bytes,
            _ => {
                return Err(GcError::OutOfMemory {
                    requested: npages.saturating_mul(PAGE_SIZE),
                    available: self.remaining(),
                })
            }
        };
        let v = self.used();
        self.bitmap.grow(v + bytes);
        Ok(v)
    }

    /// Page number of `addr` relative to `arena_start`
    #[inline]
    pub fn page_index(&self, addr: usize) -> usize {
        (addr - self.start()) / PAGE_SIZE
    }

    /// Bytes the arena can hold in total
    pub fn capacity(&self) -> usize {
        self.end() - self.start()
    }

    /// Pages the arena can hold in total
    pub fn capacity_pages(&self) -> usize {
        self.capacity() / PAGE_SIZE
    }

    /// Return the physical memory of `[v, v + len)` to the OS.
    ///
    /// The range reads back as zero afterwards.
    #[cfg(unix)]
    pub(crate) fn release(&self, v: usize, len: usize) -> bool {
        // SAFETY: the range is page aligned and inside the mapping; the
        // span it belongs to is free, so nothing references its contents.
        unsafe { libc::madvise(v as *mut libc::c_void, len, libc::MADV_DONTNEED) == 0 }
    }

    #[cfg(not(unix))]
    pub(crate) fn release(&self, v: usize, len: usize) -> bool {
        // SAFETY: as above; zeroing by hand keeps reuse semantics intact.
        unsafe { std::ptr::write_bytes(v as *mut u8, 0, len) };
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MB;

    #[test]
    fn test_reserve_layout() {
        let arena = Arena::reserve(4 * MB).expect("reserve should succeed");
        assert_eq!(arena.start() % PAGE_SIZE, 0);
        assert_eq!(arena.end() - arena.start(), 4 * MB);
        assert_eq!(arena.used(), arena.start());
        assert_eq!(arena.capacity_pages(), 4 * MB / PAGE_SIZE);
    }

    #[test]
    fn test_grow_until_exhausted() {
        let arena = Arena::reserve(16 * PAGE_SIZE).unwrap();
        let a = arena.grow(10).unwrap();
        assert_eq!(a, arena.start());
        let b = arena.grow(6).unwrap();
        assert_eq!(b, a + 10 * PAGE_SIZE);
        assert!(matches!(
            arena.grow(1),
            Err(GcError::OutOfMemory { .. })
        ));
        assert!(arena.bitmap().mapped() >= BitmapIndex::bitmap_len(16 * PAGE_SIZE));
    }

    #[test]
    fn test_grow_page_count_overflow_is_out_of_memory() {
        let arena = Arena::reserve(16 * PAGE_SIZE).unwrap();
        let used = arena.used();
        match arena.grow(usize::MAX / PAGE_SIZE + 1) {
            Err(GcError::OutOfMemory {
                requested,
                available,
            }) => {
                assert_eq!(requested, usize::MAX);
                assert_eq!(available, 16 * PAGE_SIZE);
            }
            other => panic!("expected OutOfMemory, got {:?}", other),
        }
        assert_eq!(arena.used(), used);
        assert_eq!(arena.grow(16).unwrap(), arena.start());
    }
}
