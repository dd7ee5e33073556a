//! Span Cache (front-end): one checked-out span per size class.
//!
//! A cache owns its spans outright while they are checked out, so the fast
//! path is a pop from the span's free list with no synchronization. When a
//! span runs dry the cache hands it back with `uncache_span` and checks out
//! another with `cache_span`.
//!
//! Objects are never freed through the cache. They come back to the central
//! lists only by being swept.

use crate::central_free_list::CentralCache;
use crate::size_class::NUM_SIZE_CLASSES;
use crate::span::{FreeObject, Span};
use core::ptr::{self, NonNull};

/// Per-thread cache of checked-out spans.
pub struct SpanCache {
    spans: [*mut Span; NUM_SIZE_CLASSES],
}

impl Default for SpanCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SpanCache {
    pub const fn new() -> Self {
        Self {
            spans: [ptr::null_mut(); NUM_SIZE_CLASSES],
        }
    }

    /// The span currently checked out for `size_class`, or null.
    #[inline]
    pub fn cached_span(&self, size_class: usize) -> *mut Span {
        self.spans[size_class]
    }

    /// Allocate one object of `size_class`.
    ///
    /// The object's memory is zeroed if its span has held objects before;
    /// otherwise only the free-list link is cleared. Returns `None` for the
    /// sentinel class or when the page heap is exhausted.
    ///
    /// # Safety
    ///
    /// Every call on this cache must pass the same `central`.
    #[inline]
    pub unsafe fn alloc(&mut self, central: &CentralCache<'_>, size_class: usize) -> Option<NonNull<u8>> {
        if size_class == 0 || size_class >= NUM_SIZE_CLASSES {
            return None;
        }

        let mut span = self.spans[size_class];
        if span.is_null() || unsafe { (*span).freelist.is_null() } {
            span = unsafe { self.refill(central, size_class)? };
        }

        unsafe {
            let obj = (*span).freelist;
            (*span).freelist = (*obj).next;
            (*span).allocated_count += 1;
            if (*span).needs_zero {
                ptr::write_bytes(obj.cast::<u8>(), 0, (*span).elem_size);
            } else {
                (*obj).next = ptr::null_mut();
            }
            NonNull::new(obj.cast::<u8>())
        }
    }

    /// Swap the exhausted span for `size_class` for a fresh one.
    #[cold]
    unsafe fn refill(&mut self, central: &CentralCache<'_>, size_class: usize) -> Option<*mut Span> {
        let list = central.get(size_class);
        let old = core::mem::replace(&mut self.spans[size_class], ptr::null_mut());
        if !old.is_null() {
            unsafe { list.uncache_span(old) };
        }

        let span = list.cache_span()?.as_ptr();
        debug_log!("[span_cache] class {} refilled with span {:p}", size_class, span);
        self.spans[size_class] = span;
        Some(span)
    }

    /// Hand every checked-out span back to its central list.
    ///
    /// Must run before the cache is dropped and before the collector starts
    /// a new sweep cycle.
    ///
    /// # Safety
    ///
    /// `central` must be the cache's central lists.
    pub unsafe fn release_all(&mut self, central: &CentralCache<'_>) {
        for (size_class, slot) in self.spans.iter_mut().enumerate() {
            let span = core::mem::replace(slot, ptr::null_mut());
            if !span.is_null() {
                unsafe { central.get(size_class).uncache_span(span) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::central_free_list::{HeapContext, NoPacing};
    use crate::page_heap::PageHeap;
    use crate::pagemap::PageMap;
    use crate::size_class;
    use crate::span::Membership;
    use crate::sweep::MarkSweeper;
    use crate::sweepgen::SweepGen;
    use crate::sync::SpinMutex;
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    fn make_test_env() -> CentralCache<'static> {
        let pm: &'static PageMap = Box::leak(Box::new(PageMap::new()));
        CentralCache::new(HeapContext {
            sweepgen: Box::leak(Box::new(SweepGen::new())),
            pages: Box::leak(Box::new(SpinMutex::new(PageHeap::new(pm)))),
            layout: pm,
            pacer: &NoPacing,
            sweeper: &MarkSweeper,
        })
    }

    #[test]
    fn test_alloc_from_one_span() {
        let central = make_test_env();
        let mut sc = SpanCache::new();
        let cls = size_class::size_to_class(32);

        unsafe {
            let a = sc.alloc(&central, cls).unwrap();
            let b = sc.alloc(&central, cls).unwrap();
            assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 32);

            let s = sc.cached_span(cls);
            assert_eq!((*s).allocated_count, 2);
            assert_eq!((*s).membership(), Membership::Cached);

            sc.release_all(&central);
            assert!(sc.cached_span(cls).is_null());
            assert_eq!((*s).membership(), Membership::NonEmpty);
        }
    }

    #[test]
    fn test_refill_swaps_exhausted_span() {
        let central = make_test_env();
        let mut sc = SpanCache::new();
        let cls = size_class::size_to_class(1024);
        let per_span = size_class::class_info(cls).objects_per_span();

        unsafe {
            let ptrs: Vec<_> = (0..per_span + 1).map(|_| sc.alloc(&central, cls).unwrap()).collect();
            let second = sc.cached_span(cls);
            assert_eq!((*second).allocated_count, 1);
            // The first span went back full and sits on `empty`.
            assert_eq!(central.get(cls).lengths(), (0, 2));

            let mut sorted: Vec<usize> = ptrs.iter().map(|p| p.as_ptr() as usize).collect();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted.len(), per_span + 1);
            sc.release_all(&central);
        }
    }

    #[test]
    fn test_dirty_span_hands_out_zeroed_objects() {
        let central = make_test_env();
        let mut sc = SpanCache::new();
        let cls = size_class::size_to_class(48);

        unsafe {
            let keep = sc.alloc(&central, cls).unwrap();
            let dirty = sc.alloc(&central, cls).unwrap();
            ptr::write_bytes(dirty.as_ptr(), 0x5A, 48);
            let s = sc.cached_span(cls);
            sc.release_all(&central);

            // Mark `keep`, then sweep: `dirty` is reclaimed.
            (*s).mark_object(keep.as_ptr() as usize);
            let sg = central.get(cls).context().sweepgen.start_cycle();
            assert_eq!(central.sweep_all(), 1);
            assert_eq!((*s).sweep_state(sg), crate::SweepState::Swept);
            assert!((*s).needs_zero);

            let again = sc.alloc(&central, cls).unwrap();
            assert_eq!(again, dirty);
            let bytes = core::slice::from_raw_parts(again.as_ptr(), 48);
            assert!(bytes.iter().all(|&b| b == 0));
            sc.release_all(&central);
        }
    }

    #[test]
    fn test_sentinel_class_is_refused() {
        let central = make_test_env();
        let mut sc = SpanCache::new();
        unsafe {
            assert!(sc.alloc(&central, 0).is_none());
            assert!(sc.alloc(&central, NUM_SIZE_CLASSES).is_none());
        }
    }
}
