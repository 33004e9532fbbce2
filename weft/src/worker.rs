// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-worker state.
//!
//! The THE protocol indices live here: `tail` and `head` delimit the
//! stealable suspended-continuation frames on the shadow stack, `exc` is the
//! thief-side announcement that makes the owner's pop fall into the locked
//! slow path. `tail` is hot owner-side state; `exc` and `head` sit on their
//! own cache lines.

use crate::arena::ClosureId;
use crate::coord::SleepState;
use crate::frame::StackFrame;
use crate::stats::Stats;
use crate::sync::CachePadded;
use core::cell::{Cell, UnsafeCell};
use core::sync::atomic::{AtomicUsize, Ordering};
use stacklet::{StackPointer, pool::WorkerPool};

pub type WorkerId = u32;
pub const NO_WORKER: WorkerId = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Sched,
    Steal,
    Run,
}

/// State only the owning OS thread touches.
pub struct LocalState {
    pub state: WorkerState,
    pub rng: fastrand::Rng,
    pub stacklet_pool: WorkerPool,
    pub closure_cache: Vec<ClosureId>,
    /// The worker's live scheduler context: the link-frame stack pointer of
    /// the pending switch this worker's scheduler loop made into the
    /// current strand. Strand code copies it here from its stacklet's
    /// parent-link slot at every resume, because a thief entering a stolen
    /// continuation on the same stacklet overwrites that slot with its own
    /// context. Suspending through this cell lands in the scheduler loop.
    pub sched_ctx: usize,
    pub sleep: SleepState,
    pub stats: Stats,
}

#[repr(align(128))]
pub struct Worker {
    pub self_id: WorkerId,
    /// Owner-incremented count of pushed frames.
    pub tail: AtomicUsize,
    /// Thief-side steal announcement.
    pub exc: CachePadded<AtomicUsize>,
    /// Thief-consumed count; entries [head, tail) are live.
    pub head: CachePadded<AtomicUsize>,
    /// The shadow stack of suspended spawn-continuation frames. Entries are
    /// written by the owner before the release store of `tail`.
    shadow: Box<[UnsafeCell<*mut StackFrame>]>,
    l: UnsafeCell<LocalState>,
    /// The worker's user-view table. Present while the worker runs a strand
    /// that looked up a reducer; parked in the closure across suspensions.
    hyper_table: UnsafeCell<Option<Box<crate::hypertable::HyperTable>>>,
    /// Extension scratch stack and current pointer, maintained only while
    /// an extension is registered.
    pub extension: Cell<*mut u8>,
    pub ext_stack: UnsafeCell<Vec<u8>>,
}

// Safety: shadow entries follow the THE publication protocol; `l`,
// `hyper_table` and the extension state are only touched by the owning
// thread (or by the region-exit handoff, which is serialized by `done`).
unsafe impl Sync for Worker {}
unsafe impl Send for Worker {}

impl Worker {
    pub fn new(self_id: WorkerId, deq_depth: usize, fiber_pool_cap: usize) -> Self {
        Self {
            self_id,
            tail: AtomicUsize::new(0),
            exc: CachePadded(AtomicUsize::new(0)),
            head: CachePadded(AtomicUsize::new(0)),
            shadow: (0..deq_depth).map(|_| UnsafeCell::new(core::ptr::null_mut())).collect(),
            l: UnsafeCell::new(LocalState {
                state: WorkerState::Idle,
                rng: fastrand::Rng::with_seed(seed_for(self_id)),
                stacklet_pool: WorkerPool::new(fiber_pool_cap),
                closure_cache: Vec::new(),
                sched_ctx: 0,
                sleep: SleepState::new(),
                stats: Stats::new(),
            }),
            hyper_table: UnsafeCell::new(None),
            extension: Cell::new(core::ptr::null_mut()),
            ext_stack: UnsafeCell::new(Vec::new()),
        }
    }

    /// # Safety
    ///
    /// Only the OS thread currently driving this worker may call this.
    #[expect(clippy::mut_from_ref, reason = "owner-thread state")]
    #[inline]
    pub unsafe fn local(&self) -> &mut LocalState {
        // Safety: per the function contract.
        unsafe { &mut *self.l.get() }
    }

    /// # Safety
    ///
    /// As [`Worker::local`], plus the region-exit handoff documented there.
    #[expect(clippy::mut_from_ref, reason = "owner-thread state")]
    #[inline]
    pub unsafe fn views(&self) -> &mut Option<Box<crate::hypertable::HyperTable>> {
        // Safety: per the function contract.
        unsafe { &mut *self.hyper_table.get() }
    }

    /// Publishes `frame` as a stealable continuation. Owner only.
    #[inline]
    pub fn push_frame(&self, frame: *mut StackFrame) {
        let t = self.tail.load(Ordering::Relaxed);
        if t == self.shadow.len() {
            crate::alert::fatal!("spawn deque overflow (CILK_DEQDEPTH = {})", self.shadow.len());
        }
        // Safety: the owner exclusively writes shadow[tail]; the release
        // store below publishes it.
        unsafe { *self.shadow[t].get() = frame };
        self.tail.store(t + 1, Ordering::Release);
    }

    /// # Safety
    ///
    /// `idx` must be in [head, tail) and owned by the caller per the THE
    /// protocol.
    #[inline]
    pub unsafe fn frame_at(&self, idx: usize) -> *mut StackFrame {
        // Safety: per the function contract.
        unsafe { *self.shadow[idx].get() }
    }

    /// The location holding this worker's scheduler context, in the shape
    /// the switch primitives expect for a link target.
    ///
    /// # Safety
    ///
    /// The cell must hold a live link-frame pointer when the returned
    /// location is switched through.
    #[inline]
    pub unsafe fn sched_ctx_ptr(&self) -> *mut StackPointer {
        // Safety: StackPointer is a NonZeroUsize; the cell holds a nonzero
        // value whenever it is read through this pointer.
        unsafe { (&raw mut (*self.l.get()).sched_ctx).cast::<StackPointer>() }
    }
}

fn seed_for(id: WorkerId) -> u64 {
    if cfg!(test) {
        // Deterministic at boot for reproducibility.
        0x9e37_79b9 + id as u64
    } else {
        let t = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        t ^ ((id as u64) << 32) ^ 0x5851_f42d_4c95_7f2d
    }
}

// TLS back-pointer, for entry points that are not handed a worker (reducer
// lookups from non-strand code, worker_id()).
std::thread_local! {
    static TLS_WORKER: Cell<*const Worker> = const { Cell::new(core::ptr::null()) };
}

pub(crate) fn set_tls_worker(w: *const Worker) {
    TLS_WORKER.with(|tls| tls.set(w));
}

pub(crate) fn tls_worker() -> Option<&'static Worker> {
    let ptr = TLS_WORKER.with(|tls| tls.get());
    // Safety: workers live in the never-torn-down global state.
    unsafe { ptr.as_ref() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_publishes_under_tail() {
        let w = Worker::new(0, 8, 8);
        let mut frame = crate::frame::StackFrame::new();
        w.push_frame(&raw mut frame);
        assert_eq!(w.tail.load(Ordering::Acquire), 1);
        assert_eq!(unsafe { w.frame_at(0) }, &raw mut frame);
        assert_eq!(w.head.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn tls_worker_roundtrip() {
        assert!(tls_worker().is_none());
        let w = Worker::new(3, 8, 8);
        set_tls_worker(&w);
        assert_eq!(tls_worker().unwrap().self_id, 3);
        set_tls_worker(core::ptr::null());
    }
}
