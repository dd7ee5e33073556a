//! Page Heap (back-end): manages spans of contiguous pages.
//!
//! Responsibilities:
//! - Allocate spans of N pages (searching free lists, splitting larger spans)
//! - Deallocate spans (coalescing with adjacent free spans)
//! - Grow the heap by requesting memory from the OS
//! - Register spans in the page map
//!
//! Pages that have held objects are dirty (`needs_zero`). Dirtiness follows
//! the pages through splits and merges and is cleared when a span is handed
//! to a central free list, so every fresh span starts out zeroed.

use crate::central_free_list::PageSource;
use crate::config::{MAX_PAGES, MIN_GROW_PAGES, PAGE_SHIFT, PAGE_SIZE};
use crate::pagemap::PageMap;
use crate::platform;
use crate::span::{self, ListId, Span, SpanList, SpanState};
use crate::sync::SpinMutex;
use core::ptr::{self, NonNull};

pub struct PageHeap {
    /// free_lists[k] holds free spans of exactly k pages (index 0 unused).
    free_lists: [SpanList; MAX_PAGES + 1],
    /// Free spans larger than MAX_PAGES pages.
    large_spans: SpanList,
    pagemap: &'static PageMap,
}

// SAFETY: PageHeap is only accessed through a SpinMutex. Raw pointers within
// point to OS-allocated memory that outlives any thread.
unsafe impl Send for PageHeap {}

impl PageHeap {
    pub const fn new(pagemap: &'static PageMap) -> Self {
        Self {
            free_lists: [const { SpanList::new() }; MAX_PAGES + 1],
            large_spans: SpanList::new(),
            pagemap,
        }
    }

    /// Allocate a span of exactly `num_pages` pages.
    /// Returns a pointer to the Span, or null on failure.
    ///
    /// # Safety
    ///
    /// Caller must hold exclusive access (via the enclosing `SpinMutex`).
    pub unsafe fn allocate_span(&mut self, num_pages: usize) -> *mut Span {
        assert!(num_pages > 0);

        if num_pages <= MAX_PAGES {
            for n in num_pages..=MAX_PAGES {
                if !self.free_lists[n].is_empty() {
                    let s = unsafe { self.free_lists[n].pop() };
                    return unsafe { self.carve_span(s, num_pages) };
                }
            }
        }

        let best = unsafe { self.find_best_large_span(num_pages) };
        if !best.is_null() {
            unsafe { self.large_spans.remove(best) };
            return unsafe { self.carve_span(best, num_pages) };
        }

        unsafe { self.grow_heap(num_pages) }
    }

    /// Return a span to the free lists, coalescing with free neighbours.
    ///
    /// # Safety
    ///
    /// `span` must be a valid, in-use span previously returned by
    /// `allocate_span`, no longer referenced by any central list.
    pub unsafe fn deallocate_span(&mut self, span: *mut Span) {
        unsafe {
            if (*span).state != SpanState::InUse {
                fatal!("page heap: span {:p} released twice", span);
            }
            if (*span).list != ListId::Unlinked || (*span).in_cache {
                fatal!("page heap: span {:p} released while still owned by a central list", span);
            }
            debug_log!(
                "[page_heap] release {} pages at page {}",
                (*span).num_pages,
                (*span).start_page
            );
            (*span).state = SpanState::Free;
            (*span).size_class = 0;
            (*span).elem_size = 0;
            (*span).freelist = ptr::null_mut();
            (*span).limit = 0;
            (*span).allocated_count = 0;
        }

        let span = unsafe { self.coalesce_left(span) };
        let span = unsafe { self.coalesce_right(span) };

        // Coalescing only probes the pages just outside a free span.
        unsafe { self.pagemap.register_span_endpoints(span) };
        unsafe { self.insert_free(span) };
    }

    /// Number of free pages held across all free lists.
    pub fn free_pages(&self) -> usize {
        let mut total = 0;
        for list in self.free_lists.iter().chain(core::iter::once(&self.large_spans)) {
            let mut s = list.head;
            while !s.is_null() {
                unsafe {
                    total += (*s).num_pages;
                    s = (*s).next;
                }
            }
        }
        total
    }

    /// Split a span: use the first `num_pages` pages, return the remainder
    /// to the free lists. Returns the (now in-use) span.
    unsafe fn carve_span(&mut self, span: *mut Span, num_pages: usize) -> *mut Span {
        let total = unsafe { (*span).num_pages };
        assert!(total >= num_pages);

        if total > num_pages {
            let remainder = span::alloc_span();
            if remainder.is_null() {
                // No metadata for the remainder: hand out the whole run.
                unsafe {
                    (*span).state = SpanState::InUse;
                    self.pagemap.register_span(span);
                }
                return span;
            }

            stat_inc!(span_splits);
            unsafe {
                (*remainder).start_page = (*span).start_page + num_pages;
                (*remainder).num_pages = total - num_pages;
                (*remainder).state = SpanState::Free;
                (*remainder).needs_zero = (*span).needs_zero;
                (*span).num_pages = num_pages;

                self.pagemap.register_span_endpoints(remainder);
                self.insert_free(remainder);
            }
        }

        unsafe {
            (*span).state = SpanState::InUse;
            self.pagemap.register_span(span);
        }
        span
    }

    unsafe fn insert_free(&mut self, span: *mut Span) {
        let n = unsafe { (*span).num_pages };
        if n <= MAX_PAGES {
            unsafe { self.free_lists[n].push(span) };
        } else {
            unsafe { self.large_spans.push(span) };
        }
    }

    unsafe fn remove_free(&mut self, span: *mut Span) {
        let n = unsafe { (*span).num_pages };
        if n <= MAX_PAGES {
            unsafe { self.free_lists[n].remove(span) };
        } else {
            unsafe { self.large_spans.remove(span) };
        }
    }

    /// Find the best-fit span in large_spans that has >= num_pages.
    unsafe fn find_best_large_span(&self, num_pages: usize) -> *mut Span {
        let mut best: *mut Span = ptr::null_mut();
        let mut best_pages = usize::MAX;
        let mut current = self.large_spans.head;

        while !current.is_null() {
            let n = unsafe { (*current).num_pages };
            if n >= num_pages && n < best_pages {
                best = current;
                best_pages = n;
                if n == num_pages {
                    break;
                }
            }
            current = unsafe { (*current).next };
        }
        best
    }

    /// Request pages from the OS and create a new span.
    unsafe fn grow_heap(&mut self, num_pages: usize) -> *mut Span {
        let alloc_pages = num_pages.max(MIN_GROW_PAGES);
        let start_page = match unsafe { os_pages(alloc_pages) } {
            Some(p) => p,
            None if alloc_pages > num_pages => return unsafe { self.grow_heap_exact(num_pages) },
            None => return ptr::null_mut(),
        };
        debug_log!("[page_heap] grow by {} pages at page {}", alloc_pages, start_page);

        let s = span::alloc_span();
        if s.is_null() {
            // The pages stay mapped; the heap never unmaps.
            return ptr::null_mut();
        }

        unsafe {
            (*s).start_page = start_page;
            (*s).num_pages = alloc_pages;
            (*s).state = SpanState::InUse;
            self.carve_span(s, num_pages)
        }
    }

    /// Fallback: allocate exactly num_pages from the OS.
    unsafe fn grow_heap_exact(&mut self, num_pages: usize) -> *mut Span {
        let Some(start_page) = (unsafe { os_pages(num_pages) }) else {
            return ptr::null_mut();
        };

        let s = span::alloc_span();
        if s.is_null() {
            return ptr::null_mut();
        }

        unsafe {
            (*s).start_page = start_page;
            (*s).num_pages = num_pages;
            (*s).state = SpanState::InUse;
            self.pagemap.register_span(s);
        }
        s
    }

    /// Try to merge with the free span immediately before `span`.
    unsafe fn coalesce_left(&mut self, span: *mut Span) -> *mut Span {
        let start = unsafe { (*span).start_page };
        if start == 0 {
            return span;
        }

        let left = self.pagemap.get(start - 1);
        if left.is_null() {
            return span;
        }

        unsafe {
            if (*left).state != SpanState::Free || (*left).end_page() != start {
                return span;
            }

            self.remove_free(left);
            (*left).num_pages += (*span).num_pages;
            (*left).needs_zero |= (*span).needs_zero;
            span::dealloc_span(span);
            stat_inc!(span_coalesces);
            left
        }
    }

    /// Try to merge with the free span immediately after `span`.
    unsafe fn coalesce_right(&mut self, span: *mut Span) -> *mut Span {
        let end_page = unsafe { (*span).end_page() };

        let right = self.pagemap.get(end_page);
        if right.is_null() {
            return span;
        }

        unsafe {
            if (*right).state != SpanState::Free || (*right).start_page != end_page {
                return span;
            }

            self.remove_free(right);
            (*span).num_pages += (*right).num_pages;
            (*span).needs_zero |= (*right).needs_zero;
            span::dealloc_span(right);
            stat_inc!(span_coalesces);
            span
        }
    }
}

/// Map `num_pages` heap pages from the OS and return the first page ID.
///
/// The OS page may be smaller than the heap page; a misaligned mapping is
/// retried one heap page larger and the slack in front is left unused.
unsafe fn os_pages(num_pages: usize) -> Option<usize> {
    let bytes = num_pages * PAGE_SIZE;
    let ptr = unsafe { platform::page_alloc(bytes) };
    if ptr.is_null() {
        return None;
    }
    if (ptr as usize) % PAGE_SIZE == 0 {
        return Some((ptr as usize) >> PAGE_SHIFT);
    }

    unsafe { platform::page_dealloc(ptr, bytes) };
    let ptr = unsafe { platform::page_alloc(bytes + PAGE_SIZE) };
    if ptr.is_null() {
        return None;
    }
    Some((ptr as usize).div_ceil(PAGE_SIZE))
}

impl PageSource for SpinMutex<PageHeap> {
    fn allocate(&self, num_pages: usize, size_class: usize) -> Option<NonNull<Span>> {
        let span = NonNull::new(unsafe { self.lock().allocate_span(num_pages) })?;
        let s = span.as_ptr();
        // The span is exclusively ours now; zero it outside the heap lock.
        unsafe {
            (*s).size_class = size_class;
            if (*s).needs_zero {
                ptr::write_bytes((*s).start_addr(), 0, (*s).byte_size());
                (*s).needs_zero = false;
            }
        }
        Some(span)
    }

    unsafe fn release(&self, span: *mut Span) {
        unsafe { self.lock().deallocate_span(span) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    // Each test creates its own PageMap to avoid interference
    fn make_heap() -> (&'static PageMap, PageHeap) {
        let pm = Box::leak(Box::new(PageMap::new()));
        let heap = PageHeap::new(pm);
        (pm, heap)
    }

    #[test]
    fn test_allocate_single_page() {
        let (pm, mut heap) = make_heap();
        unsafe {
            let span = heap.allocate_span(1);
            assert!(!span.is_null());
            assert_eq!((*span).num_pages, 1);
            assert_eq!((*span).state, SpanState::InUse);
            assert_eq!((*span).start_addr() as usize % PAGE_SIZE, 0);
            assert_eq!(pm.get((*span).start_page), span);

            // The rest of the growth increment is free.
            assert_eq!(heap.free_pages(), MIN_GROW_PAGES - 1);
            heap.deallocate_span(span);
            assert_eq!(heap.free_pages(), MIN_GROW_PAGES);
        }
    }

    #[test]
    fn test_allocate_beyond_grow_increment() {
        let (_pm, mut heap) = make_heap();
        unsafe {
            let span = heap.allocate_span(MIN_GROW_PAGES + 3);
            assert!(!span.is_null());
            assert_eq!((*span).num_pages, MIN_GROW_PAGES + 3);
            heap.deallocate_span(span);
        }
    }

    #[test]
    fn test_splitting_and_coalescing() {
        let (pm, mut heap) = make_heap();
        unsafe {
            let a = heap.allocate_span(5);
            let b = heap.allocate_span(5);
            assert_eq!((*b).start_page, (*a).end_page());
            assert_eq!(pm.get((*a).start_page + 4), a);

            heap.deallocate_span(a);
            heap.deallocate_span(b);
            // Everything merged back into one run.
            assert_eq!(heap.free_pages(), MIN_GROW_PAGES);
            let whole = heap.allocate_span(MIN_GROW_PAGES);
            assert_eq!((*whole).num_pages, MIN_GROW_PAGES);
            heap.deallocate_span(whole);
        }
    }

    #[test]
    fn test_dirty_pages_survive_coalescing() {
        let (_pm, mut heap) = make_heap();
        unsafe {
            let a = heap.allocate_span(2);
            let b = heap.allocate_span(2);
            (*b).needs_zero = true;
            heap.deallocate_span(b);
            heap.deallocate_span(a);

            let again = heap.allocate_span(4);
            assert!((*again).needs_zero);
            heap.deallocate_span(again);
        }
    }

    #[test]
    #[should_panic(expected = "still owned")]
    fn test_release_linked_span_is_fatal() {
        let (_pm, mut heap) = make_heap();
        unsafe {
            let s = heap.allocate_span(1);
            (*s).list = ListId::NonEmpty;
            heap.deallocate_span(s);
        }
    }

    #[test]
    fn test_page_source_zeroes_dirty_span() {
        let pm = Box::leak(Box::new(PageMap::new()));
        let heap = SpinMutex::new(PageHeap::new(pm));
        unsafe {
            let s = heap.allocate(2, 3).unwrap().as_ptr();
            assert_eq!((*s).size_class, 3);
            let base = (*s).start_addr();
            ptr::write_bytes(base, 0xAB, (*s).byte_size());
            (*s).needs_zero = true;
            heap.release(s);

            let t = heap.allocate(2, 3).unwrap().as_ptr();
            assert_eq!((*t).start_addr(), base);
            assert!(!(*t).needs_zero);
            let bytes = core::slice::from_raw_parts((*t).start_addr(), (*t).byte_size());
            assert!(bytes.iter().all(|&b| b == 0));
            heap.release(t);
        }
    }

    #[test]
    fn test_many_allocations() {
        let (_pm, mut heap) = make_heap();
        let mut spans = Vec::new();
        unsafe {
            for _ in 0..100 {
                let s = heap.allocate_span(1);
                assert!(!s.is_null());
                spans.push(s);
            }
            for s in spans {
                heap.deallocate_span(s);
            }
        }
        assert_eq!(heap.free_pages(), MIN_GROW_PAGES);
    }
}
