//! Multi-threaded tests of the sweep claim and of allocation racing sweeps.
//!
//! Caches allocate while background sweepers run over the same central
//! lists. Fill patterns on surviving objects catch any slot that is handed
//! out twice or reclaimed while still marked.

use std::collections::{HashMap, HashSet};
use std::sync::{Barrier, Mutex};
use std::thread;

use sweepalloc::central_free_list::CentralFreeList;
use sweepalloc::size_class;
use sweepalloc::span::{ListId, Membership, Span};
use sweepalloc::sync::SpinMutex;
use sweepalloc::{
    CentralCache, HeapContext, MarkSweeper, NoPacing, PageHeap, PageMap, SpanCache, SweepGen,
    SweepState, Sweeper,
};

/// Publishes every sweep and records who swept what, failing on overlap.
#[derive(Default)]
struct Recording {
    in_flight: Mutex<HashSet<usize>>,
    sweeps: Mutex<HashMap<usize, u32>>,
}

impl Sweeper for Recording {
    unsafe fn sweep(&self, central: &CentralFreeList<'_>, span: *mut Span, _preserve: bool) -> bool {
        let key = span as usize;
        assert!(self.in_flight.lock().unwrap().insert(key), "span {span:p} swept by two threads");
        thread::yield_now();
        *self.sweeps.lock().unwrap().entry(key).or_default() += 1;
        self.in_flight.lock().unwrap().remove(&key);
        unsafe { (*span).set_swept(central.context().sweepgen.current()) };
        false
    }
}

fn context(sweeper: &'static dyn Sweeper) -> (HeapContext<'static>, &'static PageMap) {
    let map: &'static PageMap = Box::leak(Box::new(PageMap::new()));
    let ctx = HeapContext {
        sweepgen: Box::leak(Box::new(SweepGen::new())),
        pages: Box::leak(Box::new(SpinMutex::new(PageHeap::new(map)))),
        layout: map,
        pacer: &NoPacing,
        sweeper,
    };
    (ctx, map)
}

/// Allocate one object straight off a span held by the caller.
unsafe fn take_one(span: *mut Span) {
    unsafe {
        let obj = (*span).freelist;
        assert!(!obj.is_null());
        (*span).freelist = (*obj).next;
        (*span).allocated_count += 1;
    }
}

#[test]
fn sweep_claims_are_exclusive() {
    let recording: &'static Recording = Box::leak(Box::default());
    let (ctx, _map) = context(recording);
    let central: &'static CentralCache<'static> = Box::leak(Box::new(CentralCache::new(ctx)));
    let cls = size_class::size_to_class(64);
    let list = central.get(cls);

    // 64 distinct partially used spans on `nonempty`.
    let spans: Vec<usize> = (0..64).map(|_| list.cache_span().unwrap().as_ptr() as usize).collect();
    for &s in &spans {
        unsafe {
            take_one(s as *mut Span);
            list.uncache_span(s as *mut Span);
        }
    }
    assert_eq!(list.lengths(), (64, 0));
    ctx.sweepgen.start_cycle();

    thread::scope(|scope| {
        for t in 0..8 {
            scope.spawn(move || {
                if t % 2 == 0 {
                    while central.sweep_one() {}
                } else {
                    for _ in 0..200 {
                        let s = list.cache_span().unwrap().as_ptr();
                        unsafe {
                            take_one(s);
                            list.uncache_span(s);
                        }
                    }
                }
            });
        }
    });

    let sweeps = recording.sweeps.lock().unwrap();
    for s in &spans {
        assert_eq!(sweeps.get(s), Some(&1), "span {s:#x} not swept exactly once");
    }
    assert!(sweeps.values().all(|&n| n == 1));
    let sg = ctx.sweepgen.current();
    list.for_each_span(|s, _| unsafe { assert_eq!((*s).sweep_state(sg), SweepState::Swept) });
}

#[test]
fn raw_claim_race_has_one_winner() {
    let sg = SweepGen::new();
    let spans: Vec<usize> = (0..256).map(|_| sweepalloc::span::alloc_span() as usize).collect();
    let cur = sg.start_cycle();
    let wins: Vec<Vec<usize>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let spans = &spans;
                scope.spawn(move || {
                    spans
                        .iter()
                        .filter(|&&s| unsafe { (*(s as *mut Span)).try_claim_sweep(cur) })
                        .copied()
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut all: Vec<usize> = wins.into_iter().flatten().collect();
    all.sort_unstable();
    assert_eq!(all, {
        let mut s = spans.clone();
        s.sort_unstable();
        s
    });
    for s in spans {
        unsafe { sweepalloc::span::dealloc_span(s as *mut Span) };
    }
}

struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }
}

fn fill_pattern(addr: usize, size: usize) {
    for i in 0..size {
        unsafe { *((addr + i) as *mut u8) = ((addr ^ size).wrapping_add(i).wrapping_mul(0x9E37_79B9) & 0xFF) as u8 };
    }
}

fn check_pattern(addr: usize, size: usize) -> bool {
    (0..size).all(|i| unsafe { *((addr + i) as *const u8) } == ((addr ^ size).wrapping_add(i).wrapping_mul(0x9E37_79B9) & 0xFF) as u8)
}

/// Linked spans of every class are on the list their tag names, never
/// heap-owned, and never cached while the caches are flushed.
fn check_quiescent(central: &CentralCache<'_>, classes: &[usize]) {
    for &cls in classes {
        central.get(cls).for_each_span(|s, id| unsafe {
            assert_eq!((*s).list, id);
            assert_eq!((*s).freelist.is_null(), (*s).allocated_count == (*s).capacity());
            let expected = match id {
                ListId::NonEmpty => Membership::NonEmpty,
                _ => Membership::Empty,
            };
            assert_eq!((*s).membership(), expected);
        });
    }
}

#[test]
fn stress_alloc_across_sweep_cycles() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 8;
    const PER_ROUND: usize = 600;

    let (ctx, map) = context(&MarkSweeper);
    let central: &'static CentralCache<'static> = Box::leak(Box::new(CentralCache::new(ctx)));
    let classes: Vec<usize> = [16, 48, 160].iter().map(|&s| size_class::size_to_class(s)).collect();
    let barrier = Barrier::new(THREADS);
    let survivors: Mutex<Vec<usize>> = Mutex::new(Vec::new());

    thread::scope(|scope| {
        for t in 0..THREADS {
            let (barrier, survivors, classes) = (&barrier, &survivors, &classes);
            scope.spawn(move || {
                let mut rng = XorShift(0x2545_F491_4F6C_DD1D ^ (t as u64 + 1));
                let mut cache = SpanCache::new();
                let mut live: Vec<(usize, usize)> = Vec::new();

                for round in 0..ROUNDS {
                    for _ in 0..PER_ROUND {
                        let cls = classes[(rng.next() % classes.len() as u64) as usize];
                        let size = size_class::class_to_size(cls);
                        let p = unsafe { cache.alloc(central, cls) }.expect("heap exhausted").as_ptr() as usize;
                        assert!(unsafe { std::slice::from_raw_parts(p as *const u8, size) }.iter().all(|&b| b == 0));
                        fill_pattern(p, size);
                        live.push((p, size));
                        if rng.next() % 16 == 0 {
                            central.sweep_one();
                        }
                    }
                    for &(p, size) in &live {
                        assert!(check_pattern(p, size), "round {round}: object {p:#x} corrupted");
                    }

                    // Drop about half; the rest survive this cycle.
                    live.retain(|_| rng.next() % 2 == 0);
                    unsafe { cache.release_all(central) };
                    survivors.lock().unwrap().extend(live.iter().map(|&(p, _)| p));

                    if barrier.wait().is_leader() {
                        // Collector: finish the old cycle, mark, start the next.
                        central.sweep_all();
                        check_quiescent(central, classes);
                        for p in survivors.lock().unwrap().drain(..) {
                            assert!(unsafe { map.mark(p) });
                        }
                        ctx.sweepgen.start_cycle();
                    }
                    barrier.wait();
                }
            });
        }
    });

    central.sweep_all();
    check_quiescent(central, &classes);
}
