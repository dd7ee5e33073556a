//! std::alloc backing for Miri, which cannot execute mmap or VirtualAlloc.

extern crate alloc;

use crate::config::PAGE_SIZE;
use core::alloc::Layout;

fn layout(size: usize) -> Option<Layout> {
    Layout::from_size_align(size, PAGE_SIZE).ok()
}

pub unsafe fn page_alloc(size: usize) -> *mut u8 {
    match layout(size) {
        Some(layout) => unsafe { alloc::alloc::alloc_zeroed(layout) },
        None => core::ptr::null_mut(),
    }
}

pub unsafe fn page_dealloc(ptr: *mut u8, size: usize) {
    if let Some(layout) = layout(size) {
        unsafe { alloc::alloc::dealloc(ptr, layout) };
    }
}
