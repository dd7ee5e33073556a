//! OS virtual memory for the page heap.
//!
//! `page_alloc` returns zero-filled, page-aligned memory straight from the
//! OS (mmap on Unix, VirtualAlloc on Windows). Under Miri the system
//! allocator stands in so the unsafe span bookkeeping can still be checked.

cfg_if::cfg_if! {
    if #[cfg(miri)] {
        mod miri;
        use miri as os;
    } else if #[cfg(windows)] {
        mod windows;
        use windows as os;
    } else if #[cfg(unix)] {
        mod unix;
        use unix as os;
    }
}

/// Allocate `size` bytes of zeroed virtual memory, aligned to the OS page.
/// Returns null on failure.
///
/// # Safety
/// Caller must release the memory with `page_dealloc(ptr, size)` or keep it
/// for the life of the process.
#[inline]
pub unsafe fn page_alloc(size: usize) -> *mut u8 {
    stat_inc!(os_alloc_count);
    stat_add!(os_alloc_bytes, size);
    unsafe { os::page_alloc(size) }
}

/// Release memory obtained from `page_alloc`.
///
/// # Safety
/// `ptr` must come from `page_alloc(size)` and must not be used afterwards.
#[inline]
pub unsafe fn page_dealloc(ptr: *mut u8, size: usize) {
    unsafe { os::page_dealloc(ptr, size) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;

    #[test]
    fn test_alloc_is_zeroed_and_aligned() {
        unsafe {
            let size = PAGE_SIZE * 4;
            let ptr = page_alloc(size);
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % 4096, 0);
            for i in 0..size {
                assert_eq!(*ptr.add(i), 0);
            }
            *ptr = 0xAA;
            *ptr.add(size - 1) = 0xBB;
            assert_eq!(*ptr, 0xAA);
            assert_eq!(*ptr.add(size - 1), 0xBB);
            page_dealloc(ptr, size);
        }
    }
}
