//! Size class table and lookup functions.
//!
//! Objects are bucketed into size classes; each class has its own central
//! free list. The table is generated by `build.rs` from `sweepalloc.toml`.
//! Index 0 is a sentinel and is never served.

use crate::config::PAGE_SIZE;

/// Information about a single size class.
#[derive(Clone, Copy, Debug)]
pub struct SizeClassInfo {
    /// Object size for this class (bytes).
    pub size: usize,
    /// Pages fetched from the page heap per central-list growth.
    pub pages: usize,
}

impl SizeClassInfo {
    pub const fn objects_per_span(&self) -> usize {
        (self.pages * PAGE_SIZE) / self.size
    }
}

include!(concat!(env!("OUT_DIR"), "/size_class_gen.rs"));

/// Largest object size served by a size class.
pub const MAX_SMALL_SIZE: usize = SIZE_CLASSES[NUM_SIZE_CLASSES - 1].size;

/// Direct lookup for sizes up to 1024 bytes in 8-byte steps.
const SMALL_LOOKUP_MAX: usize = 1024;
const SMALL_LOOKUP_LEN: usize = SMALL_LOOKUP_MAX / 8 + 1;

static SMALL_LOOKUP: [u8; SMALL_LOOKUP_LEN] = const {
    let mut table = [0u8; SMALL_LOOKUP_LEN];
    let mut i = 0;
    while i < SMALL_LOOKUP_LEN {
        let size = i * 8;
        let mut cls = 1;
        while cls < NUM_SIZE_CLASSES && SIZE_CLASSES[cls].size < size {
            cls += 1;
        }
        // 0 marks "no class", for tables whose largest class is under 1 KiB.
        table[i] = if cls < NUM_SIZE_CLASSES { cls as u8 } else { 0 };
        i += 1;
    }
    table
};

/// Map an object size to its size class index.
///
/// Size 0 maps to the smallest class. Sizes above [`MAX_SMALL_SIZE`] return 0.
#[inline]
pub fn size_to_class(size: usize) -> usize {
    if size > MAX_SMALL_SIZE {
        return 0;
    }
    if size <= SMALL_LOOKUP_MAX {
        return SMALL_LOOKUP[size.div_ceil(8)] as usize;
    }
    // First class whose size is >= `size`.
    1 + SIZE_CLASSES[1..].partition_point(|c| c.size < size)
}

/// Object size for a given size class.
#[inline]
pub fn class_to_size(cls: usize) -> usize {
    SIZE_CLASSES[cls].size
}

/// Pages fetched per growth for a given size class.
#[inline]
pub fn class_to_pages(cls: usize) -> usize {
    SIZE_CLASSES[cls].pages
}

/// Get the size class info for a given class index.
#[inline]
pub fn class_info(cls: usize) -> &'static SizeClassInfo {
    &SIZE_CLASSES[cls]
}
