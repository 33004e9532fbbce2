// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The bridge between a serial caller and the parallel runtime.
//!
//! [`invoke`] installs the root closure on its permanent stacklet, wakes the
//! thieves, and switches in; the calling thread then impersonates worker 0
//! (boss-thief mode) and runs the scheduler loop whenever the root strays
//! off its stack. Whichever worker finishes the root performs the exit
//! protocol and signals the boss, which collects the result — or the
//! pending leftmost panic — on its original stack.

use crate::arena::ClosureId;
use crate::closure::{ClosureStatus, ResumeKind};
use crate::exception;
use crate::frame::{FrameFlags, StackFrame};
use crate::global;
use crate::scheduler;
use crate::strand::Strand;
use crate::worker::{self, Worker};
use core::mem::ManuallyDrop;
use core::sync::atomic::Ordering;
use stacklet::{Stacklet, StackPointer, arch::prepare_stack};
use std::panic::{AssertUnwindSafe, catch_unwind};

struct RootCtx<F, R> {
    f: ManuallyDrop<F>,
    result: *mut Option<R>,
    frame: StackFrame,
}

/// Executes `f` as the root of a cilkified region and returns its result.
/// Concurrent callers serialize; a panic anywhere in the region resurfaces
/// here after all strands have joined.
pub fn invoke<F, R>(f: F) -> R
where
    F: FnOnce(&Strand<'_>) -> R + Send,
    R: Send,
{
    let g = global::get();
    if worker::tls_worker().is_some() {
        crate::alert::fatal!("cilkified region entered from inside a cilkified region");
    }
    let region_guard = g.region_lock.lock().unwrap();
    if g.terminate.load(Ordering::Acquire) {
        crate::alert::fatal!("cilkified region entered after shutdown");
    }

    g.reset_region_signal();
    *g.region_panic.lock().unwrap() = None;
    g.done.store(false, Ordering::Release);
    g.coord.drain_reengage_requests();

    // Reset the root closure onto the first stacklet.
    let root = g.root_closure;
    let cl = g.arena.get(root);
    cl.reset(core::ptr::null_mut());
    cl.set_status(ClosureStatus::Ready);

    // Safety: boss thread holding the region lock.
    let stack = unsafe { g.root_stacklet() };
    if stack.is_none() {
        *stack = Some(match Stacklet::new() {
            Ok(s) => s,
            Err(err) => crate::alert::fatal!("root stacklet allocation failed: {err}"),
        });
    }
    let stack = stack.as_ref().unwrap();
    stack.reset_header();

    let mut result: Option<R> = None;
    // Safety: fresh (reset) stacklet; root_entry never returns.
    let (sp, ctx_ptr) = unsafe {
        prepare_stack(
            stack,
            root_entry::<F, R>,
            RootCtx { f: ManuallyDrop::new(f), result: &raw mut result, frame: StackFrame::new() },
        )
    };

    // The root frame is "last" (top of the region) and counts as stolen so
    // the scheduler invariants hold from the first spawn.
    // Safety: ctx lives on the prepared stacklet until the region ends.
    let frame = unsafe { &raw mut (*ctx_ptr).frame };
    // Safety: nothing else references the root frame yet.
    unsafe { (*frame).set_flags(FrameFlags::STOLEN | FrameFlags::LAST) };

    {
        // Safety: Ready root closure is exclusively ours until published.
        let inner = unsafe { cl.inner() };
        inner.frame = frame;
        inner.orig_sp = sp.get();
        inner.resume_kind = ResumeKind::Park;
    }

    // The registered views become the root strand's initial table: the
    // leftmost views of the region.
    {
        // Safety: boss thread under the region lock; worker 0 is quiescent.
        let w0_views = unsafe { g.workers[0].views() };
        debug_assert!(w0_views.is_none());
        *w0_views = g.registered_views.lock().unwrap().take();
    }

    tracing::debug!("entering cilkified region");
    crate::alert::alert!(Region, "cilkify");

    // Wake the thieves and make sure their threads exist, then run the
    // region with the boss impersonating worker 0.
    g.coord.wake_thieves();
    g.start_workers_if_needed();

    let w0 = &g.workers[0];
    worker::set_tls_worker(w0);
    scheduler::worker_scheduler(w0, root, 0);
    worker::set_tls_worker(core::ptr::null());

    // Wait until the finishing worker has published the result and moved
    // the surviving views.
    g.wait_region_done();
    drop(region_guard);

    tracing::debug!("cilkified region done");

    if let Some(payload) = g.region_panic.lock().unwrap().take() {
        crate::alert::flush();
        std::panic::resume_unwind(payload);
    }
    match result {
        Some(r) => r,
        None => crate::alert::die("cilkified region finished without a result"),
    }
}

/// Root of every region, running on the root stacklet.
unsafe extern "C-unwind" fn root_entry<F, R>(
    arg: usize,
    parent_link: *mut StackPointer,
    ctx: *mut RootCtx<F, R>,
) -> !
where
    F: FnOnce(&Strand<'_>) -> R + Send,
    R: Send,
{
    // Safety: the scheduler encoded the worker; ctx lives on this stacklet.
    let w = unsafe { &*((arg & !1) as *const Worker) };
    let ctx = unsafe { &mut *ctx };
    let frame = &ctx.frame;

    frame.worker.store(w as *const Worker as *mut Worker, Ordering::Release);
    // Safety: we run on this stacklet.
    let header = unsafe { stacklet::header_from_sp(parent_link as usize) };
    header.current_frame.store(frame as *const StackFrame as *mut (), Ordering::Relaxed);
    // The boss's pending switch in our link slot is this worker's scheduler
    // context; capture it before any thief can touch the slot.
    // Safety: boss thread drives worker 0 right now; the slot was filled by
    // the switch that entered us.
    unsafe { w.local().sched_ctx = (*parent_link).get() };

    // Safety: moved here by prepare_stack; taken once.
    let f = unsafe { ManuallyDrop::take(&mut ctx.f) };
    let result = catch_unwind(AssertUnwindSafe(|| f(&Strand::new(frame))));

    // Implicit sync: all children join before the region can end.
    let pending = scheduler::sync_frame(frame);

    // Safety: resume paths keep the worker current.
    let w = unsafe { &*frame.worker.load(Ordering::Acquire) };

    let own_panic = match result {
        Ok(r) => {
            // Safety: the boss's stack frame outlives the region; the write
            // is published by the region-done signal.
            unsafe { *ctx.result = Some(r) };
            None
        }
        Err(payload) => Some(payload),
    };
    if let Some(payload) = exception::combine(pending, own_panic) {
        *global::get().region_panic.lock().unwrap() = Some(payload);
    }

    exit_cilkified_root(w, frame, global::get().root_closure)
}

/// Finishes the region on whichever worker completed the root.
fn exit_cilkified_root(w: &Worker, frame: &StackFrame, root: ClosureId) -> ! {
    let g = global::get();
    crate::alert::alert!(Region, "uncilkify on worker {}", w.self_id);

    // Resurrect the leftmost views: the finisher's table goes back to the
    // registration table, minus views whose reducer was unregistered
    // mid-region. Registrations made elsewhere during the region are
    // disjoint by key, so the merge is a union.
    // Safety: we drive this worker.
    let views = unsafe { w.views() }.take();
    if let Some(mut table) = views {
        crate::reducer::sweep_dead_views(&mut table);
        let mut registered = g.registered_views.lock().unwrap();
        let existing = registered.take();
        *registered = crate::hypertable::merge(existing, Some(table));
    }

    // Empty our deque. Nobody can steal from it (head == tail), but the
    // next region must start clean.
    let deque = &g.deques[w.self_id as usize];
    deque.lock(w.self_id);
    let bottom = deque.xtract_bottom(&g.arena, w.self_id, w.self_id);
    debug_assert_eq!(bottom, root);
    deque.clear(w.self_id);
    deque.unlock(w.self_id);
    let _ = root;

    // Clear the root frame's flags so the region's caller never mistakes it
    // for a live spawning frame.
    frame.reset_flags(0);

    // Sleep the thieves, then let everyone observe termination of the
    // region: parked-between-regions workers stay parked, disengaged ones
    // get kicked so they can leave the inner loop. SeqCst on `done` pairs
    // with the pre-park check in the disengage path, so the count below
    // covers every thief that could still park.
    g.coord.clear_cilkified();
    g.done.store(true, Ordering::SeqCst);
    let disengaged = g.coord.counts().disengaged;
    if disengaged > 0 {
        g.coord.request_more_thieves(disengaged as u32);
    }

    g.signal_region_done();

    // Back to this worker's scheduler loop, which will see `done`.
    scheduler::retire_to_scheduler(w, None)
}
