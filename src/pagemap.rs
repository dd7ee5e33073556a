//! 3-level radix tree mapping page IDs to Span pointers.
//!
//! Covers a 48-bit address space. With 4 KiB pages that is 36 bits of page
//! ID, split as root 12 bits, mid 12 bits, leaf 12 bits; larger pages
//! shrink the leaf level.
//!
//! The root is stored inline. Mid and leaf nodes are allocated from the OS
//! on first use and installed with a compare-and-swap, so writers touching
//! different pages need no common lock. Reads are lock-free.
//!
//! The map is also the heap's address-range metadata: [`SpanLayout`] resets
//! a span's entries when it is carved or fully reclaimed, and
//! [`PageMap::find_object`] turns an interior pointer into its object.

use crate::central_free_list::SpanLayout;
use crate::config::{PAGE_SHIFT, PAGE_SIZE};
use crate::platform;
use crate::span::{Span, SpanState};
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

const ADDRESS_BITS: usize = 48;
const ROOT_BITS: usize = 12;
const MID_BITS: usize = 12;
const LEAF_BITS: usize = ADDRESS_BITS - PAGE_SHIFT - ROOT_BITS - MID_BITS;

const ROOT_LEN: usize = 1 << ROOT_BITS;
const MID_LEN: usize = 1 << MID_BITS;
const LEAF_LEN: usize = 1 << LEAF_BITS;

const MID_SHIFT: usize = LEAF_BITS;
const ROOT_SHIFT: usize = LEAF_BITS + MID_BITS;

const MID_MASK: usize = (1 << MID_BITS) - 1;
const LEAF_MASK: usize = (1 << LEAF_BITS) - 1;

#[repr(C)]
struct MidNode {
    children: [AtomicPtr<LeafNode>; MID_LEN],
}

#[repr(C)]
struct LeafNode {
    spans: [AtomicPtr<Span>; LEAF_LEN],
}

/// 3-level radix tree for page_id -> *mut Span lookup.
pub struct PageMap {
    root: [AtomicPtr<MidNode>; ROOT_LEN],
}

unsafe impl Send for PageMap {}
unsafe impl Sync for PageMap {}

impl PageMap {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            root: [const { AtomicPtr::new(ptr::null_mut()) }; ROOT_LEN],
        }
    }

    /// Look up the span for a given page ID. Returns null if not set.
    #[inline]
    pub fn get(&self, page_id: usize) -> *mut Span {
        let root_idx = page_id >> ROOT_SHIFT;
        if root_idx >= ROOT_LEN {
            return ptr::null_mut();
        }

        let mid = self.root[root_idx].load(Ordering::Acquire);
        if mid.is_null() {
            return ptr::null_mut();
        }

        let leaf = unsafe { (*mid).children[(page_id >> MID_SHIFT) & MID_MASK].load(Ordering::Acquire) };
        if leaf.is_null() {
            return ptr::null_mut();
        }

        unsafe { (*leaf).spans[page_id & LEAF_MASK].load(Ordering::Acquire) }
    }

    /// Set the span for a given page ID.
    ///
    /// # Safety
    /// Concurrent writers must not target the same page ID. The span
    /// pointer must be valid or null.
    pub unsafe fn set(&self, page_id: usize, span: *mut Span) {
        let root_idx = page_id >> ROOT_SHIFT;
        assert!(root_idx < ROOT_LEN, "page_id out of range for page map");

        let mid = unsafe { install(&self.root[root_idx]) };
        let leaf = unsafe { install(&(*mid).children[(page_id >> MID_SHIFT) & MID_MASK]) };
        unsafe { (*leaf).spans[page_id & LEAF_MASK].store(span, Ordering::Release) };
    }

    /// Register a span for all pages it covers.
    ///
    /// # Safety
    /// The caller must own `span`.
    pub unsafe fn register_span(&self, span: *mut Span) {
        let start = unsafe { (*span).start_page };
        let end = unsafe { (*span).end_page() };
        for page_id in start..end {
            unsafe { self.set(page_id, span) };
        }
    }

    /// Register only the first and last pages of a free span.
    ///
    /// Coalescing only ever looks at the pages just outside a free span, so
    /// its endpoints are enough. In-use spans need every page registered.
    ///
    /// # Safety
    /// The caller must own `span`.
    pub unsafe fn register_span_endpoints(&self, span: *mut Span) {
        let start = unsafe { (*span).start_page };
        let count = unsafe { (*span).num_pages };
        unsafe { self.set(start, span) };
        if count > 1 {
            unsafe { self.set(start + count - 1, span) };
        }
    }

    /// Map an interior address to the in-use small-object span holding it
    /// and the base address of its object slot.
    pub fn find_object(&self, addr: usize) -> Option<(*mut Span, *mut u8)> {
        let span = self.get(addr >> PAGE_SHIFT);
        if span.is_null() {
            return None;
        }
        let s = unsafe { &*span };
        if s.state != SpanState::InUse || s.size_class == 0 {
            return None;
        }
        let idx = s.object_index(addr)?;
        Some((span, s.object_at(idx)))
    }

    /// Set the mark bit of the object containing `addr`.
    ///
    /// # Safety
    /// No sweep may be running on the span holding `addr`.
    pub unsafe fn mark(&self, addr: usize) -> bool {
        match self.find_object(addr) {
            Some((span, _)) => unsafe { (*span).mark_object(addr) },
            None => false,
        }
    }
}

impl SpanLayout for PageMap {
    unsafe fn reset_layout(&self, span: *mut Span) {
        unsafe {
            (*span).marks.clear();
            self.register_span(span);
        }
    }
}

/// Load the node behind `slot`, creating it if absent. A thread that loses
/// the installation race frees its node and uses the winner's.
unsafe fn install<T>(slot: &AtomicPtr<T>) -> *mut T {
    let node = slot.load(Ordering::Acquire);
    if !node.is_null() {
        return node;
    }

    let bytes = core::mem::size_of::<T>().next_multiple_of(PAGE_SIZE);
    // Zeroed pages are valid nodes: every AtomicPtr starts null.
    let fresh = unsafe { platform::page_alloc(bytes) }.cast::<T>();
    assert!(!fresh.is_null(), "failed to allocate page map node");

    match slot.compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => fresh,
        Err(winner) => {
            unsafe { platform::page_dealloc(fresh.cast::<u8>(), bytes) };
            winner
        }
    }
}
