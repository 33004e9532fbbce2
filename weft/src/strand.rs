// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The hand-compiled client surface: what the compiler would emit around a
//! spawning function, expressed as a safe scoped API.
//!
//! [`Strand::scoped`] is a spawning-function body — frame entry, the code,
//! an implicit sync, frame exit. Borrows captured by [`Strand::spawn`]ed
//! children end when the enclosing `scoped` returns, which is sound because
//! the implicit sync joins every child first. With one worker, all of this
//! degenerates to plain nested calls (serial elision).

use crate::frame::StackFrame;
use crate::scheduler;
use crate::worker::Worker;
use core::marker::PhantomData;
use core::ops::Range;
use core::sync::atomic::Ordering;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// A handle to the current strand of execution within a cilkified region.
///
/// The lifetime parameter scopes spawned borrows, exactly like a rayon
/// scope: `spawn` accepts closures that live at least as long as `'scope`,
/// and the `scoped` call that created this strand joins them all before
/// returning.
pub struct Strand<'scope> {
    frame: *const StackFrame,
    /// Invariant over 'scope.
    _marker: PhantomData<&'scope mut &'scope ()>,
}

impl<'scope> Strand<'scope> {
    pub(crate) fn new(frame: &StackFrame) -> Strand<'_> {
        Strand { frame, _marker: PhantomData }
    }

    #[inline]
    fn frame(&self) -> &StackFrame {
        // Safety: the frame outlives the strand handle by construction.
        unsafe { &*self.frame }
    }

    #[inline]
    fn worker(&self) -> &Worker {
        // Safety: frames always carry a live worker.
        unsafe { &*self.frame().worker.load(Ordering::Acquire) }
    }

    /// The id of the worker currently executing this strand. May change
    /// across any spawn or sync.
    pub fn worker_id(&self) -> u32 {
        self.worker().self_id
    }

    /// This frame's extension state, if an extension is registered. Null at
    /// the root and wherever no extension ever attached.
    pub fn extension(&self) -> *mut u8 {
        self.frame().extension.get()
    }

    /// Runs `op` as a spawning scope: children spawned on the scope's
    /// strand are joined before `scoped` returns.
    pub fn scoped<'s, OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce(&Strand<'s>) -> R + Send + 's,
        R: Send,
    {
        let frame = StackFrame::new();
        frame.worker.store(self.frame().worker.load(Ordering::Acquire), Ordering::Release);
        frame.call_parent.set(self.frame as *mut StackFrame);
        frame.extension.set(self.frame().extension.get());

        // Safety: the frame is a local on the current stacklet.
        let header = unsafe { stacklet::header_from_sp(&raw const frame as usize) };
        header.current_frame.store(&raw const frame as *mut (), Ordering::Relaxed);

        // Catch so the implicit sync still joins outstanding children when
        // the body panics; serial order then re-raises the leftmost payload.
        let strand = Strand { frame: &raw const frame, _marker: PhantomData };
        let result = catch_unwind(AssertUnwindSafe(|| op(&strand)));

        let pending = scheduler::sync_frame(&frame);

        header.current_frame.store(self.frame as *mut (), Ordering::Relaxed);
        frame.call_parent.set(core::ptr::null_mut());

        if let Some(payload) = pending {
            // A child's panic is leftmost of the body's own.
            std::panic::resume_unwind(payload);
        }
        match result {
            Ok(r) => r,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }

    /// Spawns `f` as a child of this strand's frame. The child executes
    /// immediately on this worker; the rest of the caller becomes stealable.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce(&Strand<'_>) + Send + 'scope,
    {
        scheduler::spawn_onto(self.frame(), f);
    }

    /// Joins all outstanding children of this strand's frame. A no-op
    /// unless the frame was stolen.
    pub fn sync(&self) {
        if let Some(payload) = scheduler::sync_frame(self.frame()) {
            std::panic::resume_unwind(payload);
        }
    }

    /// Divide-and-conquer parallel loop over `range`: halves recursively
    /// down to `grain` iterations, spawning the left half at each level.
    pub fn for_range<F>(&self, range: Range<usize>, grain: usize, body: &F)
    where
        F: Fn(&Strand<'_>, usize) + Sync,
    {
        fn rec<F>(s: &Strand<'_>, lo: usize, hi: usize, grain: usize, body: &F)
        where
            F: Fn(&Strand<'_>, usize) + Sync,
        {
            if hi - lo <= grain {
                for i in lo..hi {
                    body(s, i);
                }
                return;
            }
            let mid = lo + (hi - lo) / 2;
            s.scoped(|s| {
                s.spawn(move |s| rec(s, lo, mid, grain, body));
                rec(s, mid, hi, grain, body);
            });
        }
        if !range.is_empty() {
            rec(self, range.start, range.end, grain.max(1), body);
        }
    }
}
