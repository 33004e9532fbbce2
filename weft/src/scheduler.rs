// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The work-stealing scheduler.
//!
//! Execution proceeds bottom-up: a worker runs the closure at the bottom of
//! its own deque; any other worker may steal the topmost suspended
//! continuation through the THE protocol. A spawn runs the child on a fresh
//! stacklet and publishes the parent's continuation (its frame, whose jump
//! buffer the child's prologue fills with the switch-saved stack pointer) on
//! the shadow stack. The scheduler loop itself always runs on the worker's
//! OS stack, so a suspended stacklet is pristine and resuming it is a plain
//! switch to the saved park point.
//!
//! Two continuation shapes exist (see `stacklet::arch`): a spawn
//! continuation is a *link* frame inside the parent's pending
//! `switch_resume` and is resumed with `switch_resume_link`; a sync
//! suspension is a *parked* frame resumed with `switch_resume`. The
//! `ResumeKind` on the closure records which.
//!
//! Transfer-word encoding, in both directions of every switch:
//! - into a strand: the worker pointer, with bit 0 set when the strand is a
//!   spawn continuation being resumed after a steal;
//! - strand to its spawn site (child retiring): a [`RetireMsg`] pointer on
//!   the dying stacklet, read exactly once by the parent;
//! - strand to the scheduler: a [`SchedMsg`] pointer when retiring, or the
//!   suspending closure's id (with the park point in the returned stack
//!   pointer) when parking at a failed sync.

use crate::arena::{ClosureId, NO_CLOSURE};
use crate::closure::{self, ClosureStatus, ResumeKind};
use crate::exception::{self, Payload};
use crate::frame::{FrameFlags, JMPBUF_FP, JMPBUF_PC, JMPBUF_SP, StackFrame, restore_fp_ctrl_state, save_fp_ctrl_state};
use crate::global::{self, Global};
use crate::stats::stat_inc;
use crate::strand::Strand;
use crate::worker::{Worker, WorkerState};
use crate::{alert::alert, ext};
use core::mem::ManuallyDrop;
use core::ptr::NonNull;
use core::sync::atomic::{Ordering, fence};
use stacklet::arch::{prepare_stack, switch_resume, switch_resume_link, switch_retire, switch_suspend};
use stacklet::{Stacklet, StackPointer};
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Handed from a finished, never-promoted child back to its spawn site.
struct RetireMsg {
    stacklet: NonNull<u8>,
    child_ext: *mut u8,
    panic: Option<Payload>,
}

/// Handed from a finishing or abandoning strand to its worker's scheduler.
struct SchedMsg {
    /// The dying strand's stacklet; `None` for the root, whose stacklet is
    /// permanent.
    stacklet: Option<NonNull<u8>>,
}

const STOLEN_TAG: usize = 1;

fn encode_worker(w: &Worker, stolen: bool) -> usize {
    let ptr = w as *const Worker as usize;
    debug_assert_eq!(ptr & STOLEN_TAG, 0);
    ptr | if stolen { STOLEN_TAG } else { 0 }
}

unsafe fn decode_worker(arg: usize) -> &'static Worker {
    // Safety: workers live in the never-torn-down global state.
    unsafe { &*((arg & !STOLEN_TAG) as *const Worker) }
}

/// Stack base (for the switch primitives) of the stacklet containing `sp`.
fn top_from_sp(sp: usize) -> StackPointer {
    let size = stacklet::stack_size();
    StackPointer::new((sp & !(size - 1)) + size - stacklet::HEADER_RESERVE).unwrap()
}

/// The parent-link slot of the stacklet the calling code runs on.
#[inline(never)]
fn own_parent_link() -> *mut StackPointer {
    let anchor = 0u8;
    // Safety: the anchor lives on the current stacklet.
    unsafe { stacklet::parent_link_from_sp(&raw const anchor as usize) }
}

/// Called by strand code immediately after being resumed by a scheduler:
/// captures the resuming scheduler's link frame (just written into our
/// stacklet's parent-link slot) into the worker's private context cell,
/// before any thief can overwrite the slot.
fn adopt_sched_ctx(w: &Worker) {
    // Safety: we run on a live stacklet whose link slot the resuming switch
    // just filled; we drive this worker.
    unsafe {
        let link = own_parent_link();
        w.local().sched_ctx = (*link).get();
    }
}

// === spawn ===

struct SpawnCtx<F> {
    f: ManuallyDrop<F>,
    parent_frame: *mut StackFrame,
}

/// Spawns `f` as a child of `parent`: the child runs now, on its own
/// stacklet; the parent's continuation becomes stealable.
pub(crate) fn spawn_onto<F>(parent: &StackFrame, f: F)
where
    F: FnOnce(&Strand<'_>) + Send,
{
    parent.check_magic();
    // Safety: a frame's worker pointer always names a live worker.
    let w = unsafe { &*parent.worker.load(Ordering::Acquire) };
    let g = global::get();

    // The continuation may be resumed by a thief on another CPU; spill the
    // FP control state it must see.
    save_fp_ctrl_state(parent);

    if g.options.force_reduce {
        // Treat every spawning frame as stolen so its sync takes the slow
        // path and self-promotes, forcing the reducer merge machinery.
        parent.set_flags(FrameFlags::UNSYNCHED);
    }

    let stack = {
        // Safety: we are the thread driving this worker.
        let local = unsafe { w.local() };
        stat_inc!(local, spawns);
        match local.stacklet_pool.alloc(&g.stacklet_pool) {
            Ok(s) => s,
            Err(err) => crate::alert::fatal!("stacklet allocation failed: {err}"),
        }
    };
    stack.header().worker.store(w as *const Worker as *mut (), Ordering::Relaxed);

    // Safety: fresh stacklet; child_entry never returns.
    let (sp, _obj) = unsafe {
        prepare_stack(
            &stack,
            child_entry::<F>,
            SpawnCtx { f: ManuallyDrop::new(f), parent_frame: parent as *const StackFrame as *mut StackFrame },
        )
    };
    let child_top = stack.top();
    // Ownership of the stacklet rides with the running child from here.
    let _ = stack.into_raw();

    // Safety: sp was just prepared on that stacklet.
    let (ret, parked) = unsafe { switch_resume(encode_worker(w, false), sp, child_top) };
    debug_assert!(parked.is_none());

    if ret & STOLEN_TAG != 0 {
        // Our continuation was stolen; we are now running on the thief.
        // Safety: the thief encoded itself into the transfer word.
        let w = unsafe { decode_worker(ret) };
        // The thief's scheduler context was published into our link slot.
        adopt_sched_ctx(w);
        restore_fp_ctrl_state(parent);
        alert!(Steal, "continuation of frame {:p} resumed by thief {}", parent, w.self_id);
    } else {
        // Fast path: the child ran to completion on this worker.
        // Safety: the child placed the message on its (now frozen) stacklet
        // and nothing else will read it.
        let msg = unsafe { core::ptr::read(ret as *const RetireMsg) };
        // Safety: same thread that pushed.
        let local = unsafe { w.local() };
        // Safety: the base came out of Stacklet::into_raw at spawn.
        local.stacklet_pool.dealloc(&g.stacklet_pool, unsafe { Stacklet::from_raw(msg.stacklet) });
        ext::on_return_from_spawn(w, msg.child_ext);
        if let Some(p) = msg.panic {
            // Serial semantics: an unstolen child's panic propagates at the
            // spawn site, skipping the continuation.
            std::panic::resume_unwind(p);
        }
    }
}

/// Entry point of every spawned child, running on its fresh stacklet.
unsafe extern "C-unwind" fn child_entry<F>(
    arg: usize,
    parent_link: *mut StackPointer,
    ctx: *mut SpawnCtx<F>,
) -> !
where
    F: FnOnce(&Strand<'_>) + Send,
{
    // Safety: spawn_onto encoded the worker.
    let w = unsafe { decode_worker(arg) };
    // Safety: ctx was placed on this stacklet by prepare_stack.
    let ctx = unsafe { &mut *ctx };
    // Safety: the parent frame outlives its children by the fork-join
    // discipline.
    let parent = unsafe { &*ctx.parent_frame };

    // Detach: the parent's continuation is its link frame, whose pointer the
    // switch left in our parent-link slot. Publish it.
    {
        // Safety: the parent is suspended; only we touch its jump buffer.
        let jb = unsafe { parent.ctx_mut() };
        // Safety: the slot was filled by switch_resume.
        jb.slots[JMPBUF_SP] = unsafe { (*parent_link).get() };
        jb.slots[JMPBUF_FP] = 0;
        jb.slots[JMPBUF_PC] = child_entry::<F> as usize;
    }

    let helper = StackFrame::new();
    helper.set_flags(FrameFlags::DETACHED);
    helper.call_parent.set(ctx.parent_frame);
    helper.worker.store(w as *const Worker as *mut Worker, Ordering::Release);
    let child_ext = ext::on_spawn(w, parent.extension.get());
    helper.extension.set(child_ext);

    let base = (parent_link as usize) & !(stacklet::stack_size() - 1);
    // Safety: we are running on this stacklet.
    let header = unsafe { stacklet::header_from_sp(parent_link as usize) };
    header.current_frame.store(&helper as *const StackFrame as *mut (), Ordering::Relaxed);

    // The continuation becomes stealable only now, after its jump buffer is
    // complete.
    w.push_frame(ctx.parent_frame);

    // Safety: prepare_stack moved f here; taken exactly once.
    let f = unsafe { ManuallyDrop::take(&mut ctx.f) };
    let own_panic = catch_unwind(AssertUnwindSafe(|| f(&Strand::new(&helper)))).err();

    // The strand may have migrated across a suspension inside f; re-read the
    // worker through the frame, which every resume path keeps current.
    let child_panic = sync_frame(&helper);
    let panic = exception::combine(child_panic, own_panic);

    // Safety: maintained by every resume path.
    let w = unsafe { &*helper.worker.load(Ordering::Acquire) };

    // Leave: either pop our detach entry and return straight into the
    // parent, or run the return protocol if the continuation is gone.
    if helper.flags().contains(FrameFlags::STOLEN) {
        // Our own continuations were stolen: this strand is a promoted
        // closure, finish through the return protocol.
        // Safety: base derived from our own stacklet.
        unsafe { closure_return_and_retire(w, panic, NonNull::new_unchecked(base as *mut u8)) }
    } else {
        match pop_frame(w) {
            Pop::Won => {
                let msg = RetireMsg {
                    // Safety: base is our own stacklet base.
                    stacklet: unsafe { NonNull::new_unchecked(base as *mut u8) },
                    child_ext,
                    panic,
                };
                // Safety: our parent-link slot holds the parent's link
                // frame; nothing on this stacklet runs again.
                unsafe { switch_retire(&raw const msg as usize, parent_link) }
            }
            Pop::Lost => {
                // A thief took the parent continuation between our last user
                // instruction and the pop; the promote installed our closure
                // at the deque bottom.
                // Safety: as above.
                unsafe { closure_return_and_retire(w, panic, NonNull::new_unchecked(base as *mut u8)) }
            }
        }
    }
}

// === THE protocol, owner side ===

enum Pop {
    Won,
    Lost,
}

/// The owner's pop of its newest shadow entry, Dekker-style: decrement
/// tail, fence, re-read exc; fall into the locked slow path on conflict.
fn pop_frame(w: &Worker) -> Pop {
    let t = w.tail.load(Ordering::Relaxed);
    debug_assert!(t > 0);
    let t = t - 1;
    w.tail.store(t, Ordering::Relaxed);
    fence(Ordering::SeqCst);
    let e = w.exc.load(Ordering::Relaxed);
    if e > t { exception_handler(w, t) } else { Pop::Won }
}

#[cold]
fn exception_handler(w: &Worker, t: usize) -> Pop {
    let g = global::get();
    let deque = &g.deques[w.self_id as usize];
    deque.lock(w.self_id);
    let h = w.head.load(Ordering::Relaxed);
    if h > t {
        // The entry was consumed from the head side; restore tail over it.
        w.tail.store(t + 1, Ordering::Relaxed);
        deque.unlock(w.self_id);
        Pop::Lost
    } else {
        // The thief backed off.
        deque.unlock(w.self_id);
        Pop::Won
    }
}

// === return protocol ===

/// Finishes a promoted strand: reduce views and exceptions into the parent,
/// retire the stacklet to the scheduler, possibly queueing the parent via
/// the provably-good steal.
unsafe fn closure_return_and_retire(w: &Worker, panic: Option<Payload>, base: NonNull<u8>) -> ! {
    let g = global::get();
    let deque = &g.deques[w.self_id as usize];

    deque.lock(w.self_id);
    let cid = deque.peek_bottom(&g.arena, w.self_id, w.self_id);
    debug_assert!(cid.is_some(), "promoted strand without a bottom closure");
    let cl = g.arena.get(cid);
    deque.xtract_bottom(&g.arena, w.self_id, w.self_id);
    cl.change_status(ClosureStatus::Running, ClosureStatus::Returning);
    deque.unlock(w.self_id);

    closure_return(w, cid, panic);

    retire_to_scheduler(w, Some(base))
}

/// Terminal transfer from a finished strand back into its worker's
/// scheduler loop, handing over the dying stacklet if there is one.
pub(crate) fn retire_to_scheduler(w: &Worker, stacklet: Option<NonNull<u8>>) -> ! {
    let msg = SchedMsg { stacklet };
    // Safety: the context cell holds this worker's live scheduler frame;
    // nothing on the current stacklet runs again, and the scheduler reads
    // the message before the stacklet can be recycled.
    unsafe { switch_retire(&raw const msg as usize, w.sched_ctx_ptr()) }
}

/// Merges a returning closure into its spawn parent, unlinks and frees it,
/// and performs the provably-good steal if the parent became joinable.
fn closure_return(w: &Worker, cid: ClosureId, panic: Option<Payload>) {
    let g = global::get();
    let cl = g.arena.get(cid);

    // Safety: RETURNING closures are exclusively ours until destroyed.
    let parent_id = unsafe { cl.inner() }.spawn_parent;
    debug_assert!(parent_id.is_some(), "returning closure without a spawn parent");
    let parent = g.arena.get(parent_id);

    alert!(Return, "closure {cid:?} returning to {parent_id:?}");

    // Tree order: parent before child.
    parent.lock(w.self_id);
    cl.lock(w.self_id);

    // Safety: both mutexes held.
    let ci = unsafe { cl.inner() };
    let pi = unsafe { parent.inner() };

    // This strand's views: deposits from its own children first (they are
    // left of the post-sync user strand), then the worker table, then the
    // right siblings.
    // Safety: we drive this worker.
    let views = unsafe { w.views() }.take();
    let mut ht = crate::hypertable::merge(ci.child_ht.take(), views);
    ht = crate::hypertable::merge(ht, ci.right_ht.take());

    let mut exn = exception::combine(ci.child_exn.take(), exception::combine(ci.user_exn.take(), panic));
    exn = exception::combine(exn, ci.right_exn.take());

    if ci.left_sib.is_some() {
        // Deposit on the left sibling's right slot. A sibling can receive
        // two deposits when returns interleave (its adjacent-right returns,
        // then the next-right becomes adjacent and returns too); earlier
        // deposits always came from siblings left of us, so they stay on
        // the left of the merge.
        // Safety: sibling links and right slots are guarded by the parent's
        // mutex.
        let l = unsafe { g.arena.get(ci.left_sib).inner() };
        l.right_ht = crate::hypertable::merge(l.right_ht.take(), ht.take());
        let prev = l.right_exn.take();
        l.right_exn = exception::combine(prev, exn.take());
    } else {
        // Leftmost child: fold into the parent's child table.
        pi.child_ht = crate::hypertable::merge(pi.child_ht.take(), ht.take());
        let prev = pi.child_exn.take();
        pi.child_exn = exception::combine(prev, exn.take());
        if pi.child_exn.is_some() {
            pi.exception_pending = true;
        }
    }

    debug_assert!(pi.join_counter > 0);
    pi.join_counter -= 1;
    closure::remove_child(&g.arena, w.self_id, parent_id, cid);

    cl.unlock(w.self_id);
    // Safety: unlinked and unlocked; we are the only owner left.
    closure::destroy(&g.arena, unsafe { &mut w.local().closure_cache }, cid);

    // Provably-good steal: the last child to return resumes the suspended
    // parent on the current worker.
    if parent.status() == ClosureStatus::Suspended && !parent.has_children() {
        stat_inc!(unsafe { w.local() }, provably_good_steals);
        alert!(Sched, "provably good steal of {parent_id:?} by worker {}", w.self_id);
        parent.change_status(ClosureStatus::Suspended, ClosureStatus::Ready);
        let deque = &g.deques[w.self_id as usize];
        deque.lock(w.self_id);
        deque.add_bottom(&g.arena, parent_id, w.self_id, w.self_id);
        deque.unlock(w.self_id);
    }
    parent.unlock(w.self_id);
}

// === sync ===

/// The sync protocol for `frame`. Returns the pending leftmost child
/// exception (the caller decides where to rethrow).
pub(crate) fn sync_frame(frame: &StackFrame) -> Option<Payload> {
    if !frame.is_unsynced() {
        // Never stolen: every spawned child already completed in series.
        ext::on_sync(frame.extension.get());
        return None;
    }
    sync_slow(frame)
}

#[cold]
fn sync_slow(frame: &StackFrame) -> Option<Payload> {
    let g = global::get();
    // Safety: frames always carry a live worker.
    let mut w = unsafe { &*frame.worker.load(Ordering::Acquire) };

    if g.options.force_reduce {
        promote_own_deque(w);
    }

    let deque = &g.deques[w.self_id as usize];
    deque.lock(w.self_id);
    let tid = deque.peek_bottom(&g.arena, w.self_id, w.self_id);
    debug_assert!(tid.is_some(), "sync on a stolen frame without a closure");
    let t = g.arena.get(tid);
    t.lock(w.self_id);

    if t.has_children() {
        stat_inc!(unsafe { w.local() }, sync_suspensions);
        alert!(Sched, "sync fails, suspending closure {tid:?} on worker {}", w.self_id);

        // Our own shadow region must be drained before a suspension: every
        // spawn of this frame either completed or was stolen.
        debug_assert_eq!(w.head.load(Ordering::Relaxed), w.tail.load(Ordering::Relaxed));

        save_fp_ctrl_state(frame);
        t.change_status(ClosureStatus::Running, ClosureStatus::Suspended);
        deque.xtract_bottom(&g.arena, w.self_id, w.self_id);
        deque.unlock(w.self_id);

        // Safety: closure mutex held.
        let ti = unsafe { t.inner() };
        ti.frame = frame as *const StackFrame as *mut StackFrame;
        // Safety: we drive this worker; views travel with the suspension.
        ti.user_ht = unsafe { w.views() }.take();
        // Reconstitute the stacklet handle so the closure owns its parked
        // stack.
        let anchor = 0u8;
        let base = (&raw const anchor as usize) & !(stacklet::stack_size() - 1);
        // Safety: we are parked on this stacklet; the handle is re-leaked on
        // resume.
        ti.fiber = Some(unsafe { Stacklet::from_raw(NonNull::new_unchecked(base as *mut u8)) });
        ti.resume_kind = ResumeKind::Park;

        // Park. The closure mutex stays held across the switch; the
        // scheduler records the park point and unlocks on our behalf —
        // which a worker-id mutex permits.
        // Safety: the context cell holds the live scheduler frame.
        let ret = unsafe { switch_suspend(tid.0 as usize, w.sched_ctx_ptr()) };

        // Resumed by the last returning child, possibly elsewhere.
        // Safety: the resuming scheduler encoded its worker.
        w = unsafe { decode_worker(ret) };
        frame.worker.store(w as *const Worker as *mut Worker, Ordering::Release);
        // Our link slot holds the resuming scheduler's context.
        adopt_sched_ctx(w);
        restore_fp_ctrl_state(frame);
        t.lock(w.self_id);
    } else {
        deque.unlock(w.self_id);
    }

    // Joined. Fold the children's deposits into the live user table (they
    // are left of everything the continuation added) and surface the
    // leftmost pending exception.
    // Safety: closure mutex held.
    let ti = unsafe { t.inner() };
    let child_ht = ti.child_ht.take();
    // Safety: we drive this worker.
    let views = unsafe { w.views() };
    *views = crate::hypertable::merge(child_ht, views.take());
    let pending = ti.child_exn.take();
    ti.exception_pending = false;
    t.unlock(w.self_id);

    frame.clear_flags(FrameFlags::UNSYNCHED);
    ext::on_sync(frame.extension.get());
    pending
}

// === steal ===

enum StealOutcome {
    /// Stole and ran a strand to its next event.
    Stole,
    /// Nothing stealable at this victim.
    Empty,
}

/// One steal attempt against `victim_id`, running whatever was stolen until
/// it parks or retires.
fn try_steal(w: &Worker, victim_id: u32) -> StealOutcome {
    let g = global::get();
    let victim_deque = &g.deques[victim_id as usize];
    let victim = &g.workers[victim_id as usize];

    if !victim_deque.try_lock(w.self_id) {
        return StealOutcome::Empty;
    }
    let cid = victim_deque.peek_top(&g.arena, w.self_id, victim_id);
    if cid.is_none() {
        victim_deque.unlock(w.self_id);
        return StealOutcome::Empty;
    }
    let cl = g.arena.get(cid);
    if !cl.try_lock(w.self_id) {
        victim_deque.unlock(w.self_id);
        return StealOutcome::Empty;
    }

    match cl.status() {
        ClosureStatus::Ready => {
            // A whole parked closure (queued by a provably-good steal or a
            // forced promotion): take it as-is.
            victim_deque.xtract_top(&g.arena, w.self_id, victim_id);
            victim_deque.unlock(w.self_id);
            stat_inc!(unsafe { w.local() }, steals);
            alert!(Steal, "worker {} steals ready closure {cid:?} from {victim_id}", w.self_id);
            resume_ready(w, cid);
            StealOutcome::Stole
        }
        ClosureStatus::Running => {
            // The victim's running chain: take its oldest suspended
            // continuation through the Dekker exchange.
            let head = victim.head.load(Ordering::Relaxed);
            victim.exc.store(head + 1, Ordering::SeqCst);
            fence(Ordering::SeqCst);
            let tail = victim.tail.load(Ordering::SeqCst);
            if head >= tail {
                // Lost the race against the owner's pop.
                victim.exc.store(head, Ordering::SeqCst);
                cl.unlock(w.self_id);
                victim_deque.unlock(w.self_id);
                return StealOutcome::Empty;
            }
            victim.head.store(head + 1, Ordering::Relaxed);
            // Safety: [head, tail) entries are published; we now own this one.
            let sf = unsafe { victim.frame_at(head) };

            promote_child(w, victim_id, cid, sf);
            victim_deque.unlock(w.self_id);
            stat_inc!(unsafe { w.local() }, steals);

            // Run the stolen continuation.
            resume_stolen(w, cid, sf);
            StealOutcome::Stole
        }
        _ => {
            // A top closure mid-suspension is not stealable.
            cl.unlock(w.self_id);
            victim_deque.unlock(w.self_id);
            StealOutcome::Empty
        }
    }
}

/// Splits the victim's bottom closure at the stolen frame: `cid` (locked)
/// becomes the thief's, a fresh child closure covering the un-promoted
/// remainder stays as the victim's running bottom.
///
/// Caller holds the victim's deque lock and `cid`'s mutex.
fn promote_child(w: &Worker, victim_id: u32, cid: ClosureId, sf: *mut StackFrame) {
    let g = global::get();
    let cl = g.arena.get(cid);
    let victim_deque = &g.deques[victim_id as usize];

    // Allocate the child-side closure.
    let child_id = {
        // Safety: we drive this worker.
        let cache = unsafe { &mut w.local().closure_cache };
        if cache.is_empty() {
            g.arena.refill(cache);
        }
        cache.pop().unwrap()
    };
    let child = g.arena.get(child_id);
    child.reset(core::ptr::null_mut());
    child.set_status(ClosureStatus::Running);

    // Safety: the frame is ours post-Dekker; setting STOLEN before any
    // sibling can observe the promotion.
    let sf_ref = unsafe { &*sf };
    sf_ref.set_flags(FrameFlags::STOLEN | FrameFlags::UNSYNCHED);
    sf_ref.worker.store(w as *const Worker as *mut Worker, Ordering::Release);

    // Safety: cid's mutex held; child not yet visible.
    let ci = unsafe { cl.inner() };
    ci.frame = sf;
    ci.resume_kind = ResumeKind::Link;
    ci.orig_sp = sf_ref.saved_sp();
    ci.join_counter += 1;
    let child_inner = unsafe { child.inner() };
    child_inner.spawn_parent = cid;
    closure::add_child(&g.arena, w.self_id, cid, child_id);

    // The stolen continuation's stacklet now belongs to the thief.
    // Safety: the park point lies on a live stacklet.
    let header = unsafe { stacklet::header_from_sp(ci.orig_sp) };
    header.worker.store(w as *const Worker as *mut (), Ordering::Release);

    // Swap the closures on the victim's deque: the remainder keeps running
    // there.
    let bottom = victim_deque.xtract_bottom(&g.arena, w.self_id, victim_id);
    debug_assert_eq!(bottom, cid, "running top and bottom must agree at a Dekker steal");
    victim_deque.add_bottom(&g.arena, child_id, w.self_id, victim_id);

    alert!(
        Steal,
        "worker {} promotes frame {:p}: closure {cid:?} stolen, {child_id:?} stays on victim {victim_id}",
        w.self_id,
        sf
    );
}

/// Resumes the stolen spawn continuation `cid` (locked, Running) on this
/// worker and services it until it parks or retires.
fn resume_stolen(w: &Worker, cid: ClosureId, sf: *mut StackFrame) {
    let g = global::get();
    let cl = g.arena.get(cid);

    // The running closure sits at the bottom of its worker's deque.
    let deque = &g.deques[w.self_id as usize];
    deque.lock(w.self_id);
    deque.add_bottom(&g.arena, cid, w.self_id, w.self_id);
    deque.unlock(w.self_id);

    // Safety: cid's mutex held.
    let sp = unsafe { cl.inner() }.orig_sp;
    debug_assert!(sp != 0);
    // Thieves start stolen continuations with an empty view table; the
    // original views continued leftward with the victim.
    // Safety: we drive this worker.
    debug_assert!(unsafe { w.views() }.is_none());

    cl.unlock(w.self_id);

    // Safety: the frame's jump buffer was published before the detach.
    debug_assert_eq!(unsafe { (*sf).saved_sp() }, sp);
    // Safety: sp is the parent's link frame on its stacklet; we own it
    // post-Dekker.
    let (ret, parked) = unsafe {
        switch_resume_link(
            encode_worker(w, true),
            StackPointer::new(sp).unwrap(),
            top_from_sp(sp),
        )
    };
    service_yield(w, ret, parked);
}

// === running parked closures ===

/// Resumes a Ready closure (locked by the caller) and services it.
fn resume_ready(w: &Worker, cid: ClosureId) {
    let g = global::get();
    let cl = g.arena.get(cid);
    cl.change_status(ClosureStatus::Ready, ClosureStatus::Running);

    // Safety: mutex held.
    let inner = unsafe { cl.inner() };
    let sp = inner.orig_sp;
    let kind = inner.resume_kind;
    debug_assert!(sp != 0);

    if !inner.frame.is_null() {
        // Safety: a parked closure's frame outlives the park.
        unsafe { (*inner.frame).worker.store(w as *const Worker as *mut Worker, Ordering::Release) };
    }
    if let Some(fiber) = inner.fiber.take() {
        fiber.header().worker.store(w as *const Worker as *mut (), Ordering::Release);
        // Re-leak: the running strand owns its stacklet.
        let _ = fiber.into_raw();
    } else {
        // Safety: sp lies on the parked stacklet.
        unsafe { stacklet::header_from_sp(sp) }
            .worker
            .store(w as *const Worker as *mut (), Ordering::Release);
    }

    // Restore any views that were parked with the suspension. When none
    // were (a stolen spawn continuation, or the root), the worker's table
    // stays as-is: for the boss resuming the root that table carries the
    // reducers registered before the region.
    if inner.user_ht.is_some() {
        // Safety: we drive this worker.
        let views = unsafe { w.views() };
        debug_assert!(views.is_none());
        *views = inner.user_ht.take();
    }

    let deque = &g.deques[w.self_id as usize];
    deque.lock(w.self_id);
    deque.add_bottom(&g.arena, cid, w.self_id, w.self_id);
    deque.unlock(w.self_id);

    cl.unlock(w.self_id);

    let (ret, parked) = match kind {
        // Safety: sp is a park point of the matching shape, owned by us.
        ResumeKind::Park => unsafe {
            switch_resume(encode_worker(w, false), StackPointer::new(sp).unwrap(), top_from_sp(sp))
        },
        ResumeKind::Link => unsafe {
            switch_resume_link(encode_worker(w, true), StackPointer::new(sp).unwrap(), top_from_sp(sp))
        },
    };
    service_yield(w, ret, parked);
}

/// Handles a strand's transfer back into the scheduler: either a sync
/// suspension (record the park point, unlock) or a retirement (free the
/// stacklet).
fn service_yield(w: &Worker, ret: usize, parked: Option<StackPointer>) {
    let g = global::get();
    match parked {
        Some(sp) => {
            let cid = ClosureId(ret as u32);
            let cl = g.arena.get(cid);
            // The strand parked while holding its closure's mutex (as this
            // worker); complete the suspension on its behalf.
            cl.assert_ownership(w.self_id);
            debug_assert_eq!(cl.status(), ClosureStatus::Suspended);
            // Safety: mutex held (by us, on behalf of the parked strand).
            unsafe { cl.inner() }.orig_sp = sp.get();
            cl.unlock(w.self_id);
        }
        None => {
            // Safety: the retiring strand placed the message on a stacklet
            // that stays mapped until we free it here.
            let msg = unsafe { core::ptr::read(ret as *const SchedMsg) };
            if let Some(base) = msg.stacklet {
                // Safety: ownership of the dying stacklet passed to us.
                let stack = unsafe { Stacklet::from_raw(base) };
                // Safety: we drive this worker.
                unsafe { w.local() }.stacklet_pool.dealloc(&g.stacklet_pool, stack);
            }
        }
    }
}

// === force-reduce ===

/// Promotes every suspended continuation on our own deque into a real
/// closure, as if each had been stolen; with `force_reduce` this runs ahead
/// of the sync protocol so every join goes through the reducer merge paths.
pub(crate) fn promote_own_deque(w: &Worker) {
    let g = global::get();
    let deque = &g.deques[w.self_id as usize];
    deque.lock(w.self_id);
    loop {
        let head = w.head.load(Ordering::Relaxed);
        let tail = w.tail.load(Ordering::Relaxed);
        if head >= tail {
            break;
        }
        let bid = deque.peek_bottom(&g.arena, w.self_id, w.self_id);
        debug_assert!(bid.is_some());
        let b = g.arena.get(bid);
        b.lock(w.self_id);

        w.exc.store(head + 1, Ordering::SeqCst);
        w.head.store(head + 1, Ordering::Relaxed);
        // Safety: owner-side self-steal under the deque lock.
        let sf = unsafe { w.frame_at(head) };

        // Split exactly like a thief would, but the stolen part stays on our
        // own deque, parked Ready above the remainder.
        let child_id = {
            // Safety: we drive this worker.
            let cache = unsafe { &mut w.local().closure_cache };
            if cache.is_empty() {
                g.arena.refill(cache);
            }
            cache.pop().unwrap()
        };
        let child = g.arena.get(child_id);
        child.reset(core::ptr::null_mut());
        child.set_status(ClosureStatus::Running);

        // Safety: self-owned frame.
        let sf_ref = unsafe { &*sf };
        sf_ref.set_flags(FrameFlags::STOLEN | FrameFlags::UNSYNCHED);

        // Safety: b's mutex held.
        let bi = unsafe { b.inner() };
        bi.frame = sf;
        bi.resume_kind = ResumeKind::Link;
        bi.orig_sp = sf_ref.saved_sp();
        bi.simulated_stolen = true;
        bi.join_counter += 1;
        // Safety: child not yet visible.
        unsafe { child.inner() }.spawn_parent = bid;
        closure::add_child(&g.arena, w.self_id, bid, child_id);

        let bottom = deque.xtract_bottom(&g.arena, w.self_id, w.self_id);
        debug_assert_eq!(bottom, bid);
        b.change_status(ClosureStatus::Running, ClosureStatus::Ready);
        deque.add_bottom(&g.arena, bid, w.self_id, w.self_id);
        deque.add_bottom(&g.arena, child_id, w.self_id, w.self_id);
        b.unlock(w.self_id);

        alert!(Steal, "self-promotion of {bid:?} on worker {}", w.self_id);
    }
    deque.unlock(w.self_id);
}

// === the scheduler loop ===

/// Takes a Ready closure off our own deque bottom, if any. Pending
/// provably-good steals land here.
fn take_own_ready(w: &Worker) -> ClosureId {
    let g = global::get();
    let deque = &g.deques[w.self_id as usize];
    deque.lock(w.self_id);
    let cid = deque.peek_bottom(&g.arena, w.self_id, w.self_id);
    if cid.is_none() {
        deque.unlock(w.self_id);
        return NO_CLOSURE;
    }
    let cl = g.arena.get(cid);
    if cl.status() != ClosureStatus::Ready {
        deque.unlock(w.self_id);
        return NO_CLOSURE;
    }
    cl.lock(w.self_id);
    deque.xtract_bottom(&g.arena, w.self_id, w.self_id);
    deque.unlock(w.self_id);
    cid
}

/// Picks a random engaged victim; `NO_WORKER`-like self picks are filtered
/// by the caller.
fn pick_victim(w: &Worker, g: &Global) -> u32 {
    let counts = g.coord.counts();
    let engaged = (g.options.nworkers as i32 - counts.disengaged).max(1) as usize;
    // Safety: we drive this worker.
    let idx = unsafe { w.local() }.rng.usize(0..engaged);
    g.coord.index_to_worker(idx)
}

/// The per-region scheduling loop. `initial` seeds the boss with the root
/// closure; worker threads enter with nothing and go straight to stealing.
pub(crate) fn worker_scheduler(w: &Worker, initial: ClosureId, wake_val: u32) {
    let g = global::get();
    let is_boss = initial.is_some() || w.self_id == 0;

    // Safety: we drive this worker.
    unsafe { w.local() }.state = WorkerState::Sched;
    let mut fails = if initial.is_some() { 0 } else { g.coord.init_fails(wake_val) };

    if initial.is_some() {
        let cl = g.arena.get(initial);
        cl.lock(w.self_id);
        // Safety: we drive this worker.
        unsafe { w.local() }.state = WorkerState::Run;
        resume_ready(w, initial);
    }

    loop {
        if g.done.load(Ordering::Acquire) {
            break;
        }

        // Service pending provably-good steals first: the resumed parent
        // continues on this worker.
        let ready = take_own_ready(w);
        if ready.is_some() {
            // Safety: we drive this worker.
            unsafe { w.local() }.state = WorkerState::Run;
            resume_ready(w, ready);
            fails = g.coord.reset_fails(fails);
            continue;
        }

        if g.options.nworkers == 1 {
            // Nobody to steal from; with the deque empty the region is
            // either done or broken.
            debug_assert!(g.done.load(Ordering::Acquire));
            continue;
        }

        // A batch of steal attempts, then one accounting step.
        // Safety: we drive this worker.
        unsafe { w.local() }.state = WorkerState::Steal;
        let mut stole = false;
        for _ in 0..crate::coord::ATTEMPTS {
            stat_inc!(unsafe { w.local() }, steal_attempts);
            let victim = pick_victim(w, g);
            if victim == w.self_id {
                continue;
            }
            if matches!(try_steal(w, victim), StealOutcome::Stole) {
                stole = true;
                break;
            }
        }

        fails = if stole {
            g.coord.on_successful_steal(w.self_id, unsafe { &mut w.local().sleep }, fails)
        } else {
            if g.done.load(Ordering::Acquire) {
                break;
            }
            g.coord.on_failed_steal(w.self_id, is_boss, &g.done, unsafe { &mut w.local().sleep }, fails)
        };
    }

    // Leaving the region: shed sentinel status and any local state the next
    // region must not see.
    fails = g.coord.reset_fails(fails);
    let _ = fails;
    // Safety: we drive this worker.
    let local = unsafe { w.local() };
    tracing::trace!(worker = w.self_id, state = ?local.state, "leaving region scheduler");
    local.state = WorkerState::Idle;
    local.stats.dump(w.self_id);
    local.stats = crate::stats::Stats::new();
    // Safety: ext stack contents die with the region.
    unsafe { &mut *w.ext_stack.get() }.clear();
}

/// Main function of every non-boss worker thread.
pub(crate) fn scheduler_thread_proc(worker_id: u32) {
    let g = global::get();
    let w = &g.workers[worker_id as usize];
    crate::worker::set_tls_worker(w);
    crate::pin::pin_current_thread(worker_id as usize, g.options.nworkers, g.options.pin);

    loop {
        g.coord.wait_while_uncilkified();
        if g.terminate.load(Ordering::Acquire) {
            break;
        }
        if !g.coord.is_cilkified() {
            continue;
        }
        tracing::trace!(worker = worker_id, "entering region scheduler");
        worker_scheduler(w, NO_CLOSURE, u32::MAX);
        tracing::trace!(worker = worker_id, "region done, back to sleep");
    }
}
