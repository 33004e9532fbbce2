// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-worker ready deques of closures.
//!
//! The owner operates at the bottom, thieves at the top. The mutex is a
//! worker-id word like the closure mutex; all operations require it held,
//! and the precondition of every accessor below is that the calling worker
//! locked the target deque first.

use crate::arena::{Arena, ClosureId, NO_CLOSURE};
use crate::sync::Backoff;
use crate::worker::{NO_WORKER, WorkerId};
use core::cell::Cell;
use core::sync::atomic::{AtomicU32, Ordering};

#[repr(align(128))]
pub struct ReadyDeque {
    bottom: Cell<ClosureId>,
    top: Cell<ClosureId>,
    mutex_owner: AtomicU32,
}

// Safety: top/bottom are only touched while holding the worker-id mutex.
unsafe impl Sync for ReadyDeque {}
unsafe impl Send for ReadyDeque {}

impl ReadyDeque {
    pub fn new() -> Self {
        Self {
            bottom: Cell::new(NO_CLOSURE),
            top: Cell::new(NO_CLOSURE),
            mutex_owner: AtomicU32::new(NO_WORKER),
        }
    }

    #[inline]
    pub fn assert_ownership(&self, self_id: WorkerId) {
        debug_assert_eq!(self.mutex_owner.load(Ordering::Relaxed), self_id);
    }

    #[inline]
    pub fn lock(&self, self_id: WorkerId) {
        let mut boff = Backoff::new();
        loop {
            let current = self.mutex_owner.load(Ordering::Relaxed);
            if current == NO_WORKER
                && self
                    .mutex_owner
                    .compare_exchange_weak(NO_WORKER, self_id, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            boff.spin();
        }
    }

    #[inline]
    pub fn try_lock(&self, self_id: WorkerId) -> bool {
        let current = self.mutex_owner.load(Ordering::Relaxed);
        current == NO_WORKER
            && self
                .mutex_owner
                .compare_exchange(NO_WORKER, self_id, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
    }

    #[inline]
    pub fn unlock(&self, self_id: WorkerId) {
        self.assert_ownership(self_id);
        self.mutex_owner.store(NO_WORKER, Ordering::Release);
    }

    /// Removes and returns the top closure, if any.
    pub fn xtract_top(&self, arena: &Arena, self_id: WorkerId, pn: WorkerId) -> ClosureId {
        self.assert_ownership(self_id);

        let cl = self.top.get();
        if cl.is_some() {
            // Safety: deque links are guarded by the deque mutex.
            let inner = unsafe { arena.get(cl).inner() };
            debug_assert_eq!(inner.owner_ready_deque, pn);
            self.top.set(inner.next_ready);
            if cl == self.bottom.get() {
                debug_assert!(inner.next_ready.is_none());
                self.bottom.set(NO_CLOSURE);
            } else {
                debug_assert!(inner.next_ready.is_some());
                unsafe { arena.get(inner.next_ready).inner() }.prev_ready = NO_CLOSURE;
            }
            inner.next_ready = NO_CLOSURE;
            inner.owner_ready_deque = NO_WORKER;
        } else {
            debug_assert!(self.bottom.get().is_none());
        }
        cl
    }

    /// Returns the top without unlinking it.
    pub fn peek_top(&self, arena: &Arena, self_id: WorkerId, pn: WorkerId) -> ClosureId {
        self.assert_ownership(self_id);

        let cl = self.top.get();
        if cl.is_some() {
            // A thief may peek the deque of a worker that is mid-way through
            // exiting the region, in which case the root closure's recorded
            // owner is not necessarily pn; the steal fails later at the
            // Dekker exchange.
            debug_assert!(
                unsafe { arena.get(cl).inner() }.owner_ready_deque == pn || self_id != pn
            );
        } else {
            debug_assert!(self.bottom.get().is_none());
        }
        cl
    }

    /// Removes and returns the bottom closure, if any.
    pub fn xtract_bottom(&self, arena: &Arena, self_id: WorkerId, pn: WorkerId) -> ClosureId {
        self.assert_ownership(self_id);

        let cl = self.bottom.get();
        if cl.is_some() {
            // Safety: deque links are guarded by the deque mutex.
            let inner = unsafe { arena.get(cl).inner() };
            debug_assert_eq!(inner.owner_ready_deque, pn);
            self.bottom.set(inner.prev_ready);
            if cl == self.top.get() {
                debug_assert!(inner.prev_ready.is_none());
                self.top.set(NO_CLOSURE);
            } else {
                debug_assert!(inner.prev_ready.is_some());
                unsafe { arena.get(inner.prev_ready).inner() }.next_ready = NO_CLOSURE;
            }
            inner.prev_ready = NO_CLOSURE;
            inner.owner_ready_deque = NO_WORKER;
        } else {
            debug_assert!(self.top.get().is_none());
        }
        cl
    }

    pub fn peek_bottom(&self, arena: &Arena, self_id: WorkerId, pn: WorkerId) -> ClosureId {
        self.assert_ownership(self_id);

        let cl = self.bottom.get();
        if cl.is_some() {
            debug_assert_eq!(unsafe { arena.get(cl).inner() }.owner_ready_deque, pn);
        } else {
            debug_assert!(self.top.get().is_none());
        }
        cl
    }

    /// Appends `cl` as the new bottom of worker `pn`'s deque.
    pub fn add_bottom(&self, arena: &Arena, cl: ClosureId, self_id: WorkerId, pn: WorkerId) {
        self.assert_ownership(self_id);

        // Safety: deque links are guarded by the deque mutex; cl is not on
        // any deque.
        let inner = unsafe { arena.get(cl).inner() };
        debug_assert_eq!(inner.owner_ready_deque, NO_WORKER);
        inner.prev_ready = self.bottom.get();
        inner.next_ready = NO_CLOSURE;
        inner.owner_ready_deque = pn;
        self.bottom.set(cl);
        if self.top.get().is_some() {
            debug_assert!(inner.prev_ready.is_some());
            unsafe { arena.get(inner.prev_ready).inner() }.next_ready = cl;
        } else {
            self.top.set(cl);
        }
    }

    /// Empties the deque without touching closure state; used at region
    /// exit, when nobody can hold lingering references.
    pub fn clear(&self, self_id: WorkerId) {
        self.assert_ownership(self_id);
        self.bottom.set(NO_CLOSURE);
        self.top.set(NO_CLOSURE);
    }

    pub fn is_empty(&self, self_id: WorkerId) -> bool {
        self.assert_ownership(self_id);
        self.bottom.get().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::closure::ClosureStatus;

    fn fresh(arena: &Arena, cache: &mut Vec<ClosureId>) -> ClosureId {
        if cache.is_empty() {
            arena.refill(cache);
        }
        let id = cache.pop().unwrap();
        arena.get(id).reset(core::ptr::null_mut());
        arena.get(id).set_status(ClosureStatus::Ready);
        id
    }

    #[test]
    fn bottom_and_top_agree_for_depth_one() {
        let arena = Arena::new();
        let mut cache = Vec::new();
        let d = ReadyDeque::new();
        let a = fresh(&arena, &mut cache);

        d.lock(0);
        d.add_bottom(&arena, a, 0, 0);
        assert_eq!(d.peek_top(&arena, 0, 0), a);
        assert_eq!(d.peek_bottom(&arena, 0, 0), a);
        assert_eq!(d.xtract_top(&arena, 0, 0), a);
        assert!(d.is_empty(0));
        d.unlock(0);
    }

    #[test]
    fn fifo_from_top_lifo_from_bottom() {
        let arena = Arena::new();
        let mut cache = Vec::new();
        let d = ReadyDeque::new();
        let a = fresh(&arena, &mut cache);
        let b = fresh(&arena, &mut cache);
        let c = fresh(&arena, &mut cache);

        d.lock(1);
        d.add_bottom(&arena, a, 1, 1);
        d.add_bottom(&arena, b, 1, 1);
        d.add_bottom(&arena, c, 1, 1);
        assert_eq!(d.xtract_top(&arena, 1, 1), a);
        assert_eq!(d.xtract_bottom(&arena, 1, 1), c);
        assert_eq!(d.xtract_bottom(&arena, 1, 1), b);
        assert!(d.is_empty(1));
        d.unlock(1);
    }
}
