//! Sweep generation protocol.
//!
//! The collector advances a global epoch by 2 at the start of every cycle.
//! Each span carries its own stamp, interpreted relative to the epoch `sg`:
//!
//! - `sg - 2`: the span needs sweeping this cycle
//! - `sg - 1`: the span is being swept; exactly one thread owns that work
//! - `sg`: the span has been swept this cycle
//!
//! The only lock-free transition is the claim `sg - 2 -> sg - 1`, a single
//! compare-and-swap. The final `-> sg` store is issued by whoever owns the
//! sweep, after any list relocation that depends on the pre-sweep state.

use core::sync::atomic::{AtomicU32, Ordering};

/// Sweep status of a span relative to the current generation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SweepState {
    /// Stamp is `sg - 2`: not yet swept this cycle.
    NeedsSweep,
    /// Stamp is `sg - 1`: a sweeper owns this span right now.
    Sweeping,
    /// Stamp is `sg`: swept this cycle.
    Swept,
}

impl SweepState {
    /// Classify `stamp` against the heap generation `sg`.
    ///
    /// Any other value means a span survived a whole cycle without being
    /// swept, which the collector must never allow.
    #[inline]
    pub fn classify(stamp: u32, sg: u32) -> SweepState {
        if stamp == sg {
            SweepState::Swept
        } else if stamp == sg.wrapping_sub(1) {
            SweepState::Sweeping
        } else if stamp == sg.wrapping_sub(2) {
            SweepState::NeedsSweep
        } else {
            fatal!("span sweep generation {} is stale (heap generation {})", stamp, sg)
        }
    }
}

/// Process-wide sweep epoch.
///
/// Read by the central free lists, advanced only by the collector.
pub struct SweepGen {
    current: AtomicU32,
}

impl Default for SweepGen {
    fn default() -> Self {
        Self::new()
    }
}

impl SweepGen {
    pub const fn new() -> Self {
        Self {
            current: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn current(&self) -> u32 {
        self.current.load(Ordering::Acquire)
    }

    /// Begin a new collection cycle: every span stamped with the old
    /// generation now reads as [`SweepState::NeedsSweep`].
    ///
    /// The collector must have flushed every [`crate::SpanCache`] and
    /// finished sweeping the previous cycle before calling this.
    pub fn start_cycle(&self) -> u32 {
        let sg = self.current.fetch_add(2, Ordering::AcqRel).wrapping_add(2);
        debug_log!("[sweepgen] start cycle, generation {}", sg);
        sg
    }
}
