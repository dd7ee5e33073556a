//! Span management: metadata for contiguous runs of pages carved into
//! equal-size object slots, the doubly-linked lists that hold them, and a
//! slab allocator for Span structs themselves.

use crate::config::{MARK_WORDS, PAGE_SHIFT, PAGE_SIZE};
use crate::platform;
use crate::sweepgen::SweepState;
use crate::sync::SpinMutex;
use core::ptr;
use core::sync::atomic::{AtomicU32, Ordering};

/// Page-heap state of a span.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum SpanState {
    /// Span is free in the page heap's free lists.
    Free = 0,
    /// Span is handed out to a size class.
    InUse = 1,
}

/// Which central list a span is physically linked into.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ListId {
    Unlinked = 0,
    NonEmpty = 1,
    Empty = 2,
}

/// Logical owner of a span, as seen by its central free list.
///
/// Exactly one applies at any observation point. A span checked out to a
/// cache stays physically linked on `empty`, but reads as `Cached`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Membership {
    NonEmpty,
    Empty,
    Cached,
    Heap,
}

/// An intrusive free list node stored inside a free object slot.
/// The `next` pointer occupies the first word of the slot.
#[repr(C)]
pub struct FreeObject {
    pub next: *mut FreeObject,
}

/// One mark bit per object slot, set by the collector and consumed by sweep.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct MarkBits {
    words: [u64; MARK_WORDS],
}

impl Default for MarkBits {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkBits {
    pub const fn new() -> Self {
        Self {
            words: [0; MARK_WORDS],
        }
    }

    #[inline]
    pub fn get(&self, idx: usize) -> bool {
        self.words[idx / 64] & (1 << (idx % 64)) != 0
    }

    #[inline]
    pub fn set(&mut self, idx: usize) {
        self.words[idx / 64] |= 1 << (idx % 64);
    }

    pub fn clear(&mut self) {
        self.words = [0; MARK_WORDS];
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// Metadata for a contiguous run of pages.
///
/// Span structs are allocated from a dedicated slab allocator (not from the
/// heap we're managing) to avoid bootstrapping issues.
///
/// While a span is linked into a central list, every field except
/// `sweepgen` is modified only under that list's lock, or by the single
/// thread that won the sweep claim on it.
#[repr(C)]
pub struct Span {
    /// Starting page ID (address >> PAGE_SHIFT).
    pub start_page: usize,
    /// Number of pages in this span.
    pub num_pages: usize,
    /// Size class index (0 while free in the page heap).
    pub size_class: usize,
    /// Object size for the assigned size class.
    pub elem_size: usize,
    /// Page-heap state.
    pub state: SpanState,
    /// Number of objects currently allocated from this span (`ref`).
    pub allocated_count: u32,
    /// Head of the intrusive free list of unallocated objects within this span.
    pub freelist: *mut FreeObject,
    /// Address one past the last usable slot.
    pub limit: usize,
    /// Previous span in a doubly-linked list.
    pub prev: *mut Span,
    /// Next span in a doubly-linked list.
    pub next: *mut Span,
    /// Sweep generation stamp, see [`crate::sweepgen`].
    pub sweepgen: AtomicU32,
    /// Checked out to a [`crate::SpanCache`].
    pub in_cache: bool,
    /// Memory must be cleared before objects are handed out again.
    pub needs_zero: bool,
    /// Central list currently holding this span.
    pub list: ListId,
    /// Collector mark bits, one per slot.
    pub marks: MarkBits,
}

impl Span {
    /// The base address of the memory region this span covers.
    #[inline]
    pub fn start_addr(&self) -> *mut u8 {
        (self.start_page << PAGE_SHIFT) as *mut u8
    }

    /// Total bytes covered by this span.
    #[inline]
    pub fn byte_size(&self) -> usize {
        self.num_pages * PAGE_SIZE
    }

    /// One past the last page ID in this span.
    #[inline]
    pub fn end_page(&self) -> usize {
        self.start_page + self.num_pages
    }

    /// Number of object slots the span holds.
    #[inline]
    pub fn capacity(&self) -> u32 {
        if self.elem_size == 0 {
            fatal!("span at page {} has no object size", self.start_page);
        }
        (self.byte_size() / self.elem_size) as u32
    }

    /// Unallocated slots: `capacity - ref`.
    #[inline]
    pub fn free_count(&self) -> u32 {
        self.capacity() - self.allocated_count
    }

    /// Slot index holding `addr`, if `addr` lies inside a usable slot.
    #[inline]
    pub fn object_index(&self, addr: usize) -> Option<usize> {
        let base = self.start_addr() as usize;
        if addr < base || addr >= self.limit || self.elem_size == 0 {
            return None;
        }
        Some((addr - base) / self.elem_size)
    }

    /// Address of slot `idx`.
    #[inline]
    pub fn object_at(&self, idx: usize) -> *mut u8 {
        (self.start_addr() as usize + idx * self.elem_size) as *mut u8
    }

    /// Set the mark bit for the object containing `addr`.
    /// Returns false if `addr` is not inside a slot of this span.
    pub fn mark_object(&mut self, addr: usize) -> bool {
        match self.object_index(addr) {
            Some(idx) => {
                self.marks.set(idx);
                true
            }
            None => false,
        }
    }

    #[inline]
    pub fn sweep_state(&self, sg: u32) -> SweepState {
        SweepState::classify(self.sweepgen.load(Ordering::Acquire), sg)
    }

    /// Claim exclusive responsibility for sweeping this span.
    ///
    /// Succeeds for exactly one caller per cycle: the one whose
    /// compare-and-swap moves the stamp from `sg - 2` to `sg - 1`.
    #[inline]
    pub fn try_claim_sweep(&self, sg: u32) -> bool {
        self.sweepgen
            .compare_exchange(
                sg.wrapping_sub(2),
                sg.wrapping_sub(1),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Publish the span as swept for generation `sg`.
    #[inline]
    pub fn set_swept(&self, sg: u32) {
        self.sweepgen.store(sg, Ordering::Release);
    }

    #[inline]
    pub fn is_linked(&self) -> bool {
        self.list != ListId::Unlinked
    }

    pub fn membership(&self) -> Membership {
        if self.in_cache {
            return Membership::Cached;
        }
        match self.list {
            ListId::NonEmpty => Membership::NonEmpty,
            ListId::Empty => Membership::Empty,
            ListId::Unlinked => Membership::Heap,
        }
    }

    /// Number of entries on the span's free list.
    ///
    /// # Safety
    ///
    /// The free list must not be mutated concurrently.
    pub unsafe fn freelist_len(&self) -> usize {
        let mut n = 0;
        let mut obj = self.freelist;
        while !obj.is_null() {
            n += 1;
            obj = unsafe { (*obj).next };
        }
        n
    }
}

/// A doubly-linked list of spans with O(1) insertion at either end.
pub struct SpanList {
    pub head: *mut Span,
    pub tail: *mut Span,
    pub count: usize,
}

impl Default for SpanList {
    fn default() -> Self {
        Self::new()
    }
}

impl SpanList {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            count: 0,
        }
    }

    /// Prepend a span to the front of the list.
    ///
    /// # Safety
    ///
    /// `span` must be a valid, non-null pointer to a `Span` not already in a list.
    pub unsafe fn push(&mut self, span: *mut Span) {
        unsafe {
            (*span).next = self.head;
            (*span).prev = ptr::null_mut();
            if self.head.is_null() {
                self.tail = span;
            } else {
                (*self.head).prev = span;
            }
            self.head = span;
        }
        self.count += 1;
    }

    /// Append a span to the back of the list.
    ///
    /// # Safety
    ///
    /// `span` must be a valid, non-null pointer to a `Span` not already in a list.
    pub unsafe fn push_back(&mut self, span: *mut Span) {
        unsafe {
            (*span).prev = self.tail;
            (*span).next = ptr::null_mut();
            if self.tail.is_null() {
                self.head = span;
            } else {
                (*self.tail).next = span;
            }
            self.tail = span;
        }
        self.count += 1;
    }

    /// Remove a specific span from the list.
    ///
    /// # Safety
    ///
    /// `span` must be a valid pointer to a `Span` that is currently in this list.
    pub unsafe fn remove(&mut self, span: *mut Span) {
        unsafe {
            let prev = (*span).prev;
            let next = (*span).next;
            if prev.is_null() {
                self.head = next;
            } else {
                (*prev).next = next;
            }
            if next.is_null() {
                self.tail = prev;
            } else {
                (*next).prev = prev;
            }
            (*span).prev = ptr::null_mut();
            (*span).next = ptr::null_mut();
        }
        self.count -= 1;
    }

    /// Pop the first span from the list.
    ///
    /// # Safety
    ///
    /// The list's internal pointers must be valid (maintained by `push`/`remove`).
    pub unsafe fn pop(&mut self) -> *mut Span {
        let span = self.head;
        if !span.is_null() {
            unsafe { self.remove(span) };
        }
        span
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }
}

/// Allocates Span structs from OS pages, avoiding use of the managed heap.
/// Bump allocation within one-page slabs, with a free list for recycled spans.
struct SpanSlab {
    recycled: *mut Span,
    bump_ptr: *mut u8,
    bump_end: *mut u8,
}

// SAFETY: SpanSlab is only accessed through a SpinMutex. The raw pointers
// point to OS memory that is never returned.
unsafe impl Send for SpanSlab {}

impl SpanSlab {
    const fn new() -> Self {
        Self {
            recycled: ptr::null_mut(),
            bump_ptr: ptr::null_mut(),
            bump_end: ptr::null_mut(),
        }
    }

    unsafe fn alloc(&mut self) -> *mut Span {
        if !self.recycled.is_null() {
            let span = self.recycled;
            self.recycled = unsafe { (*span).next };
            return span;
        }

        let size = core::mem::size_of::<Span>();
        let align = core::mem::align_of::<Span>();
        let aligned = (self.bump_ptr as usize + align - 1) & !(align - 1);

        if !self.bump_ptr.is_null() && aligned + size <= self.bump_end as usize {
            self.bump_ptr = (aligned + size) as *mut u8;
            return aligned as *mut Span;
        }

        let slab_bytes = size.next_multiple_of(PAGE_SIZE);
        let slab = unsafe { platform::page_alloc(slab_bytes) };
        if slab.is_null() {
            return ptr::null_mut();
        }
        // Fresh pages are page-aligned, which satisfies Span's alignment.
        self.bump_ptr = unsafe { slab.add(size) };
        self.bump_end = unsafe { slab.add(slab_bytes) };
        slab.cast::<Span>()
    }

    unsafe fn dealloc(&mut self, span: *mut Span) {
        unsafe { (*span).next = self.recycled };
        self.recycled = span;
    }
}

static SPAN_SLAB: SpinMutex<SpanSlab> = SpinMutex::new(SpanSlab::new());

/// Allocate a new Span struct, zero-initialized.
pub fn alloc_span() -> *mut Span {
    let span = unsafe { SPAN_SLAB.lock().alloc() };
    if !span.is_null() {
        // All-zero is a valid Span: null pointers, Free, Unlinked, stamp 0.
        unsafe { ptr::write_bytes(span as *mut u8, 0, core::mem::size_of::<Span>()) };
    }
    span
}

/// Return a Span struct to the slab allocator for reuse.
///
/// # Safety
///
/// `span` must have been returned by [`alloc_span`] and must not be in any list.
pub unsafe fn dealloc_span(span: *mut Span) {
    unsafe { SPAN_SLAB.lock().dealloc(span) };
}
