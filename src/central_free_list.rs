//! Central Free List (middle-end): per-size-class pools of spans.
//!
//! Each size class owns two span lists under one lock: `nonempty` (spans
//! with free objects) and `empty` (spans with no free objects, or checked
//! out to a cache). Caches take whole spans with [`CentralFreeList::cache_span`]
//! and give them back with [`CentralFreeList::uncache_span`]; the sweeper
//! returns reclaimed objects with [`CentralFreeList::free_span`].
//!
//! Spans owed a sweep are swept lazily, by whichever thread first claims
//! them through their generation stamp. The list lock is never held while
//! sweeping or while talking to the page heap.

use crate::size_class::{self, NUM_SIZE_CLASSES};
use crate::span::{FreeObject, ListId, Span, SpanList};
use crate::sweepgen::{SweepGen, SweepState};
use crate::sync::SpinMutex;
use core::ptr::{self, NonNull};

/// Page-level heap: the source of fresh spans and the sink of free ones.
pub trait PageSource: Sync {
    /// Allocate a run of `num_pages` pages tagged with `size_class`.
    /// Returns `None` when the heap cannot grow.
    fn allocate(&self, num_pages: usize, size_class: usize) -> Option<NonNull<Span>>;

    /// Take back a span whose objects are all free.
    ///
    /// # Safety
    ///
    /// `span` must have come from `allocate`, be unlinked from every central
    /// list, and not be used by the caller afterwards.
    unsafe fn release(&self, span: *mut Span);
}

/// Address-range metadata used to identify pointers into a span.
pub trait SpanLayout: Sync {
    /// Re-tag the span's address range for its current object layout.
    ///
    /// # Safety
    ///
    /// The caller must exclusively own `span`.
    unsafe fn reset_layout(&self, span: *mut Span);
}

/// Sweep pacing. Charged once per span acquisition, before any list lock is
/// taken, and may sweep unrelated spans synchronously.
pub trait SweepPacer: Sync {
    fn deduct_sweep_credit(&self, object_size: usize, span_bytes: usize);
}

/// A pacer that never forces sweeping.
pub struct NoPacing;

impl SweepPacer for NoPacing {
    #[inline]
    fn deduct_sweep_credit(&self, _object_size: usize, _span_bytes: usize) {}
}

/// The synchronous sweep routine.
pub trait Sweeper: Sync {
    /// Sweep `span`, handing reclaimed objects to `central.free_span(.., preserve)`.
    /// Returns whether the span went back to the page heap.
    ///
    /// On return the span's stamp must equal the current generation.
    ///
    /// # Safety
    ///
    /// The caller must have claimed the span (stamp moved to `sg - 1`), and
    /// the span must belong to `central`.
    unsafe fn sweep(&self, central: &CentralFreeList<'_>, span: *mut Span, preserve: bool) -> bool;
}

/// Collaborators shared by every central free list of one heap.
#[derive(Clone, Copy)]
pub struct HeapContext<'a> {
    pub sweepgen: &'a SweepGen,
    pub pages: &'a dyn PageSource,
    pub layout: &'a dyn SpanLayout,
    pub pacer: &'a dyn SweepPacer,
    pub sweeper: &'a dyn Sweeper,
}

/// The two lists guarded by the central lock.
struct SpanLists {
    nonempty: SpanList,
    empty: SpanList,
}

// SAFETY: Only accessed through the owning SpinMutex.
unsafe impl Send for SpanLists {}

impl SpanLists {
    const fn new() -> Self {
        Self {
            nonempty: SpanList::new(),
            empty: SpanList::new(),
        }
    }

    fn list_mut(&mut self, id: ListId) -> &mut SpanList {
        match id {
            ListId::NonEmpty => &mut self.nonempty,
            ListId::Empty => &mut self.empty,
            ListId::Unlinked => fatal!("no central list for an unlinked span"),
        }
    }

    /// Remove `span` from whichever list holds it. No-op if unlinked.
    unsafe fn unlink(&mut self, span: *mut Span) {
        let id = unsafe { (*span).list };
        if id == ListId::Unlinked {
            return;
        }
        unsafe {
            self.list_mut(id).remove(span);
            (*span).list = ListId::Unlinked;
        }
    }

    unsafe fn insert_front(&mut self, id: ListId, span: *mut Span) {
        unsafe {
            self.unlink(span);
            self.list_mut(id).push(span);
            (*span).list = id;
        }
    }

    /// Swept spans always go to the back: `cache_span` relies on this order
    /// to stop scanning `empty` at the first swept span.
    unsafe fn insert_back(&mut self, id: ListId, span: *mut Span) {
        unsafe {
            self.unlink(span);
            self.list_mut(id).push_back(span);
            (*span).list = id;
        }
    }
}

/// Central free list for a single size class.
pub struct CentralFreeList<'a> {
    size_class: usize,
    lists: SpinMutex<SpanLists>,
    ctx: HeapContext<'a>,
}

impl<'a> CentralFreeList<'a> {
    pub const fn new(size_class: usize, ctx: HeapContext<'a>) -> Self {
        Self {
            size_class,
            lists: SpinMutex::new(SpanLists::new()),
            ctx,
        }
    }

    #[inline]
    pub fn size_class(&self) -> usize {
        self.size_class
    }

    #[inline]
    pub fn context(&self) -> &HeapContext<'a> {
        &self.ctx
    }

    /// Lengths of the `(nonempty, empty)` lists.
    pub fn lengths(&self) -> (usize, usize) {
        let lists = self.lists.lock();
        (lists.nonempty.count, lists.empty.count)
    }

    /// Visit every linked span, `nonempty` front to back then `empty`,
    /// with the list lock held.
    pub fn for_each_span(&self, mut f: impl FnMut(*mut Span, ListId)) {
        let lists = self.lists.lock();
        for (list, id) in [(&lists.nonempty, ListId::NonEmpty), (&lists.empty, ListId::Empty)] {
            let mut s = list.head;
            while !s.is_null() {
                f(s, id);
                s = unsafe { (*s).next };
            }
        }
    }

    /// Check out a span with at least one free object for a cache.
    ///
    /// Returns `None` only when the page heap cannot supply a new span.
    pub fn cache_span(&self) -> Option<NonNull<Span>> {
        stat_inc!(cache_span_calls);
        let info = size_class::class_info(self.size_class);
        self.ctx
            .pacer
            .deduct_sweep_credit(info.size, info.pages * crate::config::PAGE_SIZE);

        let mut lists = self.lists.lock();
        let sg = self.ctx.sweepgen.current();

        let span = 'found: loop {
            let mut s = lists.nonempty.head;
            while !s.is_null() {
                let next = unsafe { (*s).next };
                let state = unsafe { (*s).sweep_state(sg) };

                if state == SweepState::NeedsSweep && unsafe { (*s).try_claim_sweep(sg) } {
                    // Ours to sweep. It goes to `empty` now since a cache will own it.
                    unsafe { lists.insert_back(ListId::Empty, s) };
                    drop(lists);
                    stat_inc!(inline_sweeps);
                    debug_log!("[cache_span] class {} sweeping nonempty span {:p}", self.size_class, s);
                    unsafe { self.ctx.sweeper.sweep(self, s, true) };
                    break 'found s;
                }
                if unsafe { (*s).sweep_state(sg) } == SweepState::Sweeping {
                    // A background sweeper owns it; never wait.
                    stat_inc!(sweep_skips);
                    s = next;
                    continue;
                }
                unsafe { lists.insert_back(ListId::Empty, s) };
                drop(lists);
                break 'found s;
            }

            let mut s = lists.empty.head;
            while !s.is_null() {
                let next = unsafe { (*s).next };
                let state = unsafe { (*s).sweep_state(sg) };

                if state == SweepState::NeedsSweep && unsafe { (*s).try_claim_sweep(sg) } {
                    // An empty span that may free objects once swept.
                    unsafe { lists.insert_back(ListId::Empty, s) };
                    drop(lists);
                    stat_inc!(inline_sweeps);
                    debug_log!("[cache_span] class {} sweeping empty span {:p}", self.size_class, s);
                    unsafe { self.ctx.sweeper.sweep(self, s, true) };
                    if unsafe { !(*s).freelist.is_null() } {
                        break 'found s;
                    }
                    // Still full. Other threads may have changed both lists
                    // meanwhile, so rescan from `nonempty`.
                    lists = self.lists.lock();
                    continue 'found;
                }
                if unsafe { (*s).sweep_state(sg) } == SweepState::Sweeping {
                    stat_inc!(sweep_skips);
                    s = next;
                    continue;
                }
                // Swept and still full. Everything behind it is swept or
                // being swept, so nothing further down can help.
                break;
            }
            drop(lists);

            let fresh = self.grow()?.as_ptr();
            stat_inc!(cache_span_grows);
            unsafe { self.lists.lock().insert_back(ListId::Empty, fresh) };
            break 'found fresh;
        };

        unsafe {
            let cap = (*span).capacity();
            if cap == (*span).allocated_count {
                fatal!("cache_span: span {:p} has no free objects (capacity {})", span, cap);
            }
            if (*span).freelist.is_null() {
                fatal!("cache_span: span {:p} has an empty free list", span);
            }
            (*span).in_cache = true;
        }
        NonNull::new(span)
    }

    /// Return a span previously checked out with [`Self::cache_span`].
    ///
    /// # Safety
    ///
    /// `span` must have been returned by `cache_span` on this list and not
    /// uncached since.
    pub unsafe fn uncache_span(&self, span: *mut Span) {
        stat_inc!(uncache_calls);
        let mut lists = self.lists.lock();
        unsafe {
            (*span).in_cache = false;
            if (*span).allocated_count == 0 {
                fatal!("uncache_span: span {:p} was never allocated from", span);
            }
            if (*span).free_count() > 0 {
                lists.insert_front(ListId::NonEmpty, span);
            }
        }
    }

    /// Return `n` reclaimed objects, linked from `head` to `tail`, to `span`.
    ///
    /// With `preserve`, list membership is left to the caller (the inline
    /// sweep in [`Self::cache_span`]). Returns whether the span was handed
    /// back to the page heap.
    ///
    /// # Safety
    ///
    /// `head..=tail` must be a valid chain of `n` free slots of `span`, and
    /// the caller must own the sweep of `span`.
    pub unsafe fn free_span(
        &self,
        span: *mut Span,
        n: u32,
        head: *mut FreeObject,
        tail: *mut FreeObject,
        preserve: bool,
    ) -> bool {
        stat_inc!(free_span_calls);
        stat_add!(objects_reclaimed, n);
        unsafe {
            if (*span).in_cache {
                fatal!("free_span: span {:p} is cached", span);
            }
            if n == 0 || head.is_null() || tail.is_null() {
                fatal!("free_span: empty batch for span {:p}", span);
            }
            if n > (*span).allocated_count {
                fatal!(
                    "free_span: reclaiming {} objects from span {:p} with {} allocated",
                    n,
                    span,
                    (*span).allocated_count
                );
            }

            let was_empty = (*span).freelist.is_null();
            (*tail).next = (*span).freelist;
            (*span).freelist = head;
            (*span).allocated_count -= n;
            (*span).needs_zero = true;

            if preserve {
                if !(*span).is_linked() {
                    fatal!("free_span: cannot preserve unlinked span {:p}", span);
                }
                (*span).set_swept(self.ctx.sweepgen.current());
                return false;
            }

            let mut lists = self.lists.lock();
            if was_empty {
                lists.insert_front(ListId::NonEmpty, span);
            }
            // Publishing the stamp lets the span be cached again, so it must
            // follow the list move above.
            (*span).set_swept(self.ctx.sweepgen.current());

            if (*span).allocated_count != 0 {
                return false;
            }

            lists.unlink(span);
            (*span).freelist = ptr::null_mut();
            drop(lists);

            stat_inc!(spans_released);
            debug_log!("[free_span] class {} releasing span {:p}", self.size_class, span);
            self.ctx.layout.reset_layout(span);
            self.ctx.pages.release(span);
        }
        true
    }

    /// Fetch a new span from the page heap and carve it into objects.
    ///
    /// The span is returned unlinked; the caller links it.
    pub fn grow(&self) -> Option<NonNull<Span>> {
        let info = size_class::class_info(self.size_class);
        let span = self.ctx.pages.allocate(info.pages, self.size_class)?;
        let s = span.as_ptr();
        debug_log!("[grow] class {} got {} pages at {:p}", self.size_class, info.pages, s);

        unsafe {
            if !(*s).freelist.is_null() {
                fatal!("grow: span {:p} from the page heap has a free list", s);
            }
            (*s).elem_size = info.size;
            let n = (*s).capacity() as usize;
            if n == 0 {
                fatal!("grow: class {} span {:p} holds no objects", self.size_class, s);
            }

            let base = (*s).start_addr() as usize;
            let mut tail = base as *mut FreeObject;
            for i in 1..n {
                let obj = (base + i * info.size) as *mut FreeObject;
                (*tail).next = obj;
                tail = obj;
            }
            (*tail).next = ptr::null_mut();

            (*s).freelist = base as *mut FreeObject;
            (*s).limit = base + n * info.size;
            (*s).allocated_count = 0;
            (*s).in_cache = false;
            (*s).list = ListId::Unlinked;
            (*s).set_swept(self.ctx.sweepgen.current());

            self.ctx.layout.reset_layout(s);
        }
        Some(span)
    }

    /// Claim and sweep one span of this class that still needs sweeping.
    ///
    /// Returns false when no linked span is owed a sweep. Cached spans are
    /// left for their cache to release first.
    ///
    /// A span claimed on `empty` is moved to its back before the sweep, so
    /// a span that stays full never sits ahead of one still owed a sweep.
    /// The collector must not start a cycle while this runs.
    pub fn sweep_one(&self) -> bool {
        let claimed = {
            let mut lists = self.lists.lock();
            // Read under the lock so every linked span was stamped no later
            // than `sg`.
            let sg = self.ctx.sweepgen.current();
            let mut found = None;
            'scan: for id in [ListId::NonEmpty, ListId::Empty] {
                let mut s = lists.list_mut(id).head;
                while !s.is_null() {
                    // The stamp goes first: `in_cache` of a span being
                    // handed to a cache is written outside the lock.
                    unsafe {
                        if (*s).sweep_state(sg) == SweepState::NeedsSweep
                            && !(*s).in_cache
                            && (*s).try_claim_sweep(sg)
                        {
                            found = Some((s, id));
                            break 'scan;
                        }
                        s = (*s).next;
                    }
                }
            }
            match found {
                Some((s, ListId::Empty)) => {
                    unsafe { lists.insert_back(ListId::Empty, s) };
                    s
                }
                Some((s, _)) => s,
                None => return false,
            }
        };

        stat_inc!(background_sweeps);
        unsafe { self.ctx.sweeper.sweep(self, claimed, false) };
        true
    }
}

/// Central free lists for every size class of one heap.
pub struct CentralCache<'a> {
    lists: [CentralFreeList<'a>; NUM_SIZE_CLASSES],
}

impl<'a> CentralCache<'a> {
    pub fn new(ctx: HeapContext<'a>) -> Self {
        Self {
            lists: core::array::from_fn(|cls| CentralFreeList::new(cls, ctx)),
        }
    }

    /// Get the central free list for a size class.
    #[inline]
    pub fn get(&self, size_class: usize) -> &CentralFreeList<'a> {
        &self.lists[size_class]
    }

    /// Background sweep step: sweep one span from any size class.
    pub fn sweep_one(&self) -> bool {
        self.lists[1..].iter().any(|c| c.sweep_one())
    }

    /// Sweep until no linked span is owed a sweep. Returns the number swept.
    pub fn sweep_all(&self) -> usize {
        let mut swept = 0;
        for central in &self.lists[1..] {
            while central.sweep_one() {
                swept += 1;
            }
        }
        swept
    }
}
