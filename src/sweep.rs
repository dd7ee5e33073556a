//! Mark-bit sweeper.
//!
//! After marking, every slot of a span is in one of three states: on the
//! span's free list, marked live, or garbage. [`MarkSweeper`] collects the
//! garbage slots into a chain and hands them to
//! [`CentralFreeList::free_span`], then clears the marks for the next cycle.

use crate::central_free_list::{CentralFreeList, Sweeper};
use crate::span::{FreeObject, MarkBits, Span};
use crate::sweepgen::SweepState;
use core::ptr;

/// Sweeps spans using the mark bits stored in each [`Span`].
pub struct MarkSweeper;

impl Sweeper for MarkSweeper {
    unsafe fn sweep(&self, central: &CentralFreeList<'_>, span: *mut Span, preserve: bool) -> bool {
        let sg = central.context().sweepgen.current();
        unsafe {
            if (*span).sweep_state(sg) != SweepState::Sweeping {
                fatal!("sweep: span {:p} was not claimed", span);
            }

            let mut free = MarkBits::new();
            let mut obj = (*span).freelist;
            while !obj.is_null() {
                match (*span).object_index(obj as usize) {
                    Some(idx) => free.set(idx),
                    None => fatal!("sweep: free list of span {:p} leaves the span", span),
                }
                obj = (*obj).next;
            }

            let mut head: *mut FreeObject = ptr::null_mut();
            let mut tail: *mut FreeObject = ptr::null_mut();
            let mut n = 0u32;
            for idx in 0..(*span).capacity() as usize {
                if free.get(idx) || (*span).marks.get(idx) {
                    continue;
                }
                let dead = (*span).object_at(idx).cast::<FreeObject>();
                (*dead).next = ptr::null_mut();
                if tail.is_null() {
                    head = dead;
                } else {
                    (*tail).next = dead;
                }
                tail = dead;
                n += 1;
            }
            (*span).marks.clear();

            if n == 0 {
                (*span).set_swept(sg);
                return false;
            }
            debug_log!("[sweep] span {:p}: {} dead objects", span, n);
            central.free_span(span, n, head, tail, preserve)
        }
    }
}
