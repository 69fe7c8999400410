//! Size Classes
//!
//! Small objects are rounded up to one of a fixed set of sizes; each class
//! allocates spans of a fixed page count, chosen so that the unusable tail
//! of a span wastes at most one eighth of it.

use super::{PAGE_SIZE, MAX_SMALL_SIZE};
use lazy_static::lazy_static;

/// Element sizes of the small classes. Class 0 is reserved for large spans.
const CLASS_SIZES: &[usize] = &[
    0, 8, 16, 32, 48, 64, 80, 96, 112, 128, 144, 160, 176, 192, 208, 224, 240, 256, 288, 320,
    352, 384, 416, 448, 480, 512, 576, 640, 704, 768, 896, 1024, 1152, 1280, 1408, 1536, 1664,
    2048, 2304, 2560, 2816, 3072, 3328, 4096, 4608, 5376, 6144, 6528, 6784, 6912, 8192, 9472,
    10240, 10880, 12288, 13568, 14336, 16384, 18432, 19072, 20480, 21760, 24576, 27264, 28672,
    32768,
];

/// Number of size classes, including the large class 0
pub fn num_classes() -> usize {
    CLASS_SIZES.len()
}

/// Immutable per-class table
pub struct SizeClassTable {
    sizes: Vec<usize>,
    alloc_pages: Vec<usize>,
}

lazy_static! {
    pub static ref SIZE_CLASSES: SizeClassTable = SizeClassTable::build();
}

impl SizeClassTable {
    fn build() -> Self {
        let sizes = CLASS_SIZES.to_vec();
        let mut alloc_pages = vec![0; sizes.len()];
        for (class, &size) in sizes.iter().enumerate().skip(1) {
            let mut alloc = PAGE_SIZE;
            while alloc % size > alloc / 8 {
                alloc += PAGE_SIZE;
            }
            alloc_pages[class] = alloc / PAGE_SIZE;
        }
        Self { sizes, alloc_pages }
    }

    /// Element size of `class`
    #[inline]
    pub fn size(&self, class: usize) -> usize {
        self.sizes[class]
    }

    /// Pages per span of `class`
    #[inline]
    pub fn alloc_pages(&self, class: usize) -> usize {
        self.alloc_pages[class]
    }

    /// Smallest class holding `size` bytes; `None` for large objects
    pub fn class_for(&self, size: usize) -> Option<usize> {
        if size > MAX_SMALL_SIZE {
            return None;
        }
        let size = size.max(1);
        let idx = match self.sizes[1..].binary_search(&size) {
            Ok(i) => i,
            Err(i) => i,
        };
        Some(idx + 1)
    }

    /// Objects per span of `class`
    pub fn objects_per_span(&self, class: usize) -> usize {
        (self.alloc_pages(class) * PAGE_SIZE) / self.size(class)
    }
}
