// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The scheduler's view of a suspended or runnable task.
//!
//! A closure's mutex is an atomic worker-id word, not an OS lock: the
//! promote path locks closures on behalf of other workers and the sync path
//! unlocks from a different stack than the one that locked, both of which an
//! OS mutex contract forbids. The status doubles as a validity tag; touching
//! a `PostInvalid` closure is fatal.
//!
//! The list of children is not distributed among the children themselves, to
//! avoid extra protocols and locking: the parent holds `right_most_child`
//! and the children are doubly linked through their sibling ids.

use crate::arena::{Arena, ClosureId, NO_CLOSURE};
use crate::exception::Payload;
use crate::frame::StackFrame;
use crate::hypertable::HyperTable;
use crate::sync::Backoff;
use crate::worker::{NO_WORKER, WorkerId};
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use stacklet::Stacklet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClosureStatus {
    Running = 42,
    Suspended,
    Returning,
    Ready,
    /// Before first real use.
    PreInvalid,
    /// After destruction.
    PostInvalid,
}

/// Which continuation shape `orig_sp` points at (see `stacklet::arch`): a
/// parked sync suspension, or the link frame of a stolen spawn site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeKind {
    Park,
    Link,
}

impl ClosureStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            42 => Self::Running,
            43 => Self::Suspended,
            44 => Self::Returning,
            45 => Self::Ready,
            46 => Self::PreInvalid,
            47 => Self::PostInvalid,
            _ => crate::alert::die("invalid closure status"),
        }
    }
}

/// Everything guarded by the closure's mutex (or by exclusive ownership
/// during single-owner phases).
pub struct ClosureInner {
    pub frame: *mut StackFrame,
    /// The stacklet holding this closure's parked continuation.
    pub fiber: Option<Stacklet>,
    /// Park point to resume at once a suspended sync becomes ready; the
    /// stack pointer preserved at suspension.
    pub orig_sp: usize,
    pub resume_kind: ResumeKind,
    pub simulated_stolen: bool,
    pub exception_pending: bool,
    /// Outstanding spawned children.
    pub join_counter: u32,
    pub spawn_parent: ClosureId,
    /// Left and right *spawned* siblings in the closure tree.
    pub left_sib: ClosureId,
    pub right_sib: ClosureId,
    /// Right-most *spawned* child.
    pub right_most_child: ClosureId,
    /// Ready-deque links: next_ready points toward the bottom, prev_ready
    /// toward the top.
    pub next_ready: ClosureId,
    pub prev_ready: ClosureId,
    pub owner_ready_deque: WorkerId,
    /// User views parked here while the closure is suspended.
    pub user_ht: Option<Box<HyperTable>>,
    /// Views deposited by returned children, left-to-right.
    pub child_ht: Option<Box<HyperTable>>,
    /// Views deposited by returned right-siblings.
    pub right_ht: Option<Box<HyperTable>>,
    pub user_exn: Option<Payload>,
    pub child_exn: Option<Payload>,
    pub right_exn: Option<Payload>,
}

#[repr(align(128))]
pub struct Closure {
    mutex_owner: AtomicU32,
    status: AtomicU8,
    inner: UnsafeCell<ClosureInner>,
}

// Safety: inner is guarded by the worker-id mutex and the ownership phases
// documented on `inner()`.
unsafe impl Sync for Closure {}
unsafe impl Send for Closure {}

impl Closure {
    pub fn new() -> Self {
        Self {
            mutex_owner: AtomicU32::new(NO_WORKER),
            status: AtomicU8::new(ClosureStatus::PreInvalid as u8),
            inner: UnsafeCell::new(ClosureInner {
                frame: core::ptr::null_mut(),
                fiber: None,
                orig_sp: 0,
                resume_kind: ResumeKind::Park,
                simulated_stolen: false,
                exception_pending: false,
                join_counter: 0,
                spawn_parent: NO_CLOSURE,
                left_sib: NO_CLOSURE,
                right_sib: NO_CLOSURE,
                right_most_child: NO_CLOSURE,
                next_ready: NO_CLOSURE,
                prev_ready: NO_CLOSURE,
                owner_ready_deque: NO_WORKER,
                user_ht: None,
                child_ht: None,
                right_ht: None,
                user_exn: None,
                child_exn: None,
                right_exn: None,
            }),
        }
    }

    /// Reinitializes a recycled closure for a new task.
    pub fn reset(&self, frame: *mut StackFrame) {
        debug_assert_eq!(self.mutex_owner.load(Ordering::Relaxed), NO_WORKER);
        self.status.store(ClosureStatus::PreInvalid as u8, Ordering::Relaxed);
        // Safety: a recycled closure has no other owner.
        let inner = unsafe { self.inner() };
        *inner = ClosureInner {
            frame,
            fiber: inner.fiber.take(),
            orig_sp: 0,
            resume_kind: ResumeKind::Park,
            simulated_stolen: false,
            exception_pending: false,
            join_counter: 0,
            spawn_parent: NO_CLOSURE,
            left_sib: NO_CLOSURE,
            right_sib: NO_CLOSURE,
            right_most_child: NO_CLOSURE,
            next_ready: NO_CLOSURE,
            prev_ready: NO_CLOSURE,
            owner_ready_deque: NO_WORKER,
            user_ht: None,
            child_ht: None,
            right_ht: None,
            user_exn: None,
            child_exn: None,
            right_exn: None,
        };
        debug_assert!(inner.fiber.is_none());
    }

    /// # Safety
    ///
    /// Caller must hold the closure mutex, or be in a phase where it is the
    /// exclusive owner (fresh allocation, promote under the victim's deque
    /// lock, destruction).
    #[expect(clippy::mut_from_ref, reason = "guarded by the worker-id mutex")]
    #[inline]
    pub unsafe fn inner(&self) -> &mut ClosureInner {
        // Safety: per the function contract.
        unsafe { &mut *self.inner.get() }
    }

    #[inline]
    pub fn status(&self) -> ClosureStatus {
        ClosureStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_status(&self, status: ClosureStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    #[inline]
    pub fn change_status(&self, old: ClosureStatus, new: ClosureStatus) {
        let prev = self.status.swap(new as u8, Ordering::AcqRel);
        if prev != old as u8 {
            crate::alert::fatal!("closure status was {prev}, expected {:?}", old);
        }
    }

    /// The status doubles as a magic number.
    pub fn check_magic(&self) {
        match self.status() {
            ClosureStatus::Running
            | ClosureStatus::Suspended
            | ClosureStatus::Returning
            | ClosureStatus::Ready => {}
            ClosureStatus::PostInvalid => crate::alert::die("destroyed closure"),
            ClosureStatus::PreInvalid => crate::alert::die("invalid closure"),
        }
    }

    #[inline]
    pub fn try_lock(&self, self_id: WorkerId) -> bool {
        self.check_magic();
        let current = self.mutex_owner.load(Ordering::Relaxed);
        current == NO_WORKER
            && self
                .mutex_owner
                .compare_exchange(NO_WORKER, self_id, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
    }

    #[inline]
    pub fn lock(&self, self_id: WorkerId) {
        self.check_magic();
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

    /// The unlocking worker must be the lock holder, but may unlock from a
    /// different stack than the one that locked.
    #[inline]
    pub fn unlock(&self, self_id: WorkerId) {
        self.assert_ownership(self_id);
        self.mutex_owner.store(NO_WORKER, Ordering::Release);
    }

    #[inline]
    pub fn assert_ownership(&self, self_id: WorkerId) {
        debug_assert_eq!(self.mutex_owner.load(Ordering::Relaxed), self_id);
    }

    #[inline]
    pub fn assert_alienation(&self, self_id: WorkerId) {
        debug_assert_ne!(self.mutex_owner.load(Ordering::Relaxed), self_id);
    }

    pub fn has_children(&self) -> bool {
        // Safety: callers hold the mutex.
        unsafe { self.inner() }.join_counter != 0
    }
}

/// Double-links `left` and `right`; the right is always the new child. The
/// parent's mutex must be held.
fn double_link_children(arena: &Arena, left: ClosureId, right: ClosureId) {
    if left.is_some() {
        // Safety: sibling links of the old right-most child are only touched
        // under the parent's mutex, which we hold.
        let l = unsafe { arena.get(left).inner() };
        debug_assert!(l.right_sib.is_none());
        l.right_sib = right;
    }
    if right.is_some() {
        // Safety: the new child is not yet visible to anyone else.
        let r = unsafe { arena.get(right).inner() };
        debug_assert!(r.left_sib.is_none());
        r.left_sib = left;
    }
}

/// Unlinks `child` from its siblings. The parent's mutex must be held.
fn unlink_child(arena: &Arena, child: ClosureId) {
    // Safety: sibling links are guarded by the parent's mutex.
    let c = unsafe { arena.get(child).inner() };
    if c.left_sib.is_some() {
        let l = unsafe { arena.get(c.left_sib).inner() };
        debug_assert_eq!(l.right_sib, child);
        l.right_sib = c.right_sib;
    }
    if c.right_sib.is_some() {
        let r = unsafe { arena.get(c.right_sib).inner() };
        debug_assert_eq!(r.left_sib, child);
        r.left_sib = c.left_sib;
    }
    c.left_sib = NO_CLOSURE;
    c.right_sib = NO_CLOSURE;
}

/// Inserts a newly created child as the parent's right-most child.
///
/// Only the scheduler alters the closure tree. The caller must hold the
/// parent's mutex and must *not* hold the child's: the old right-most child
/// won't follow its right_sib link until it is ready to return, which needs
/// the parent lock we are holding, and the new child is not visible to
/// anyone yet.
pub fn add_child(arena: &Arena, self_id: WorkerId, parent: ClosureId, child: ClosureId) {
    arena.get(parent).assert_ownership(self_id);
    arena.get(child).assert_alienation(self_id);

    // Safety: parent mutex held.
    let p = unsafe { arena.get(parent).inner() };
    double_link_children(arena, p.right_most_child, child);
    p.right_most_child = child;
}

/// Removes a returned child from the tree. Caller holds both the parent's
/// and the child's mutex, so only one child unlinks at a time.
pub fn remove_child(arena: &Arena, self_id: WorkerId, parent: ClosureId, child: ClosureId) {
    arena.get(parent).assert_ownership(self_id);
    arena.get(child).assert_ownership(self_id);

    // Safety: both mutexes held.
    let c = unsafe { arena.get(child).inner() };
    debug_assert_eq!(c.spawn_parent, parent);
    debug_assert!(c.right_ht.is_none());
    let p = unsafe { arena.get(parent).inner() };
    if p.right_most_child == child {
        debug_assert!(c.right_sib.is_none());
        p.right_most_child = c.left_sib;
    }
    unlink_child(arena, child);
}

/// Destroys a closure, poisons its status, and hands the id back to the
/// worker's cache.
pub fn destroy(arena: &Arena, cache: &mut Vec<ClosureId>, id: ClosureId) {
    let cl = arena.get(id);
    cl.check_magic();
    // Safety: destruction is a single-owner phase.
    let inner = unsafe { cl.inner() };
    debug_assert!(inner.left_sib.is_none());
    debug_assert!(inner.right_sib.is_none());
    debug_assert!(inner.right_most_child.is_none());
    debug_assert!(inner.user_ht.is_none());
    debug_assert!(inner.child_ht.is_none());
    debug_assert!(inner.right_ht.is_none());
    debug_assert!(inner.fiber.is_none());
    cl.set_status(ClosureStatus::PostInvalid);
    cache.push(id);
    if cache.len() > 2 * crate::arena::FREE_BATCH {
        arena.spill(cache);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn add_then_remove_child_restores_right_most() {
        let arena = Arena::new();
        let mut cache = Vec::new();
        let parent = fresh(&arena, &mut cache);
        let a = fresh(&arena, &mut cache);
        let b = fresh(&arena, &mut cache);
        unsafe { arena.get(a).inner() }.spawn_parent = parent;
        unsafe { arena.get(b).inner() }.spawn_parent = parent;

        arena.get(parent).lock(0);
        let before = unsafe { arena.get(parent).inner() }.right_most_child;
        add_child(&arena, 0, parent, a);
        add_child(&arena, 0, parent, b);
        assert_eq!(unsafe { arena.get(parent).inner() }.right_most_child, b);

        arena.get(b).lock(0);
        remove_child(&arena, 0, parent, b);
        arena.get(b).unlock(0);
        assert_eq!(unsafe { arena.get(parent).inner() }.right_most_child, a);

        arena.get(a).lock(0);
        remove_child(&arena, 0, parent, a);
        arena.get(a).unlock(0);
        assert_eq!(unsafe { arena.get(parent).inner() }.right_most_child, before);
        arena.get(parent).unlock(0);
    }

    #[test]
    fn lock_is_a_worker_id_word() {
        let arena = Arena::new();
        let mut cache = Vec::new();
        let id = fresh(&arena, &mut cache);
        let cl = arena.get(id);

        cl.lock(3);
        assert!(!cl.try_lock(5));
        // Unlock on behalf of worker 3 from "another stack".
        cl.unlock(3);
        assert!(cl.try_lock(5));
        cl.unlock(5);
    }

    #[test]
    fn joinability_tracks_the_join_counter() {
        let arena = Arena::new();
        let mut cache = Vec::new();
        let parent = fresh(&arena, &mut cache);

        arena.get(parent).lock(2);
        assert!(!arena.get(parent).has_children());
        unsafe { arena.get(parent).inner() }.join_counter = 1;
        assert!(arena.get(parent).has_children());
        unsafe { arena.get(parent).inner() }.join_counter = 0;
        assert!(!arena.get(parent).has_children());
        arena.get(parent).unlock(2);
    }

    #[test]
    fn status_transitions_are_checked() {
        let arena = Arena::new();
        let mut cache = Vec::new();
        let id = fresh(&arena, &mut cache);
        let cl = arena.get(id);
        cl.change_status(ClosureStatus::Ready, ClosureStatus::Running);
        cl.change_status(ClosureStatus::Running, ClosureStatus::Returning);
        assert_eq!(cl.status(), ClosureStatus::Returning);
    }
}
