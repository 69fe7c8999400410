//! Local Cache - Per-Context Free Objects
//!
//! Each execution context refills a small stash of free objects per size
//! class from the central lists, so most allocations take no shared lock.
//! Cached objects are free as far as the bitmap is concerned; the collector
//! returns every cache to the central lists at the start of a cycle.

use super::size_class::num_classes;

/// Free objects held by one context
pub struct LocalCache {
    lists: Vec<Vec<usize>>,
}

impl LocalCache {
    pub fn new() -> Self {
        Self {
            lists: (0..num_classes()).map(|_| Vec::new()).collect(),
        }
    }

    #[inline]
    pub(crate) fn pop(&mut self, class: usize) -> Option<usize> {
        self.lists[class].pop()
    }

    #[inline]
    pub(crate) fn push(&mut self, class: usize, v: usize) {
        self.lists[class].push(v);
    }

    /// Objects currently cached across all classes
    pub fn cached_objects(&self) -> usize {
        self.lists.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.iter().all(Vec::is_empty)
    }

    /// Empty the cache, yielding `(class, object)` pairs
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.lists
            .iter_mut()
            .enumerate()
            .flat_map(|(class, list)| list.drain(..).map(move |v| (class, v)))
    }
}

impl Default for LocalCache {
    fn default() -> Self {
        Self::new()
    }
}
