// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Reducer hyperobjects.
//!
//! A [`Reducer`] owns the *leftmost view*: the boxed cell whose address is
//! also the table key (which is why the key can never collide with the
//! reserved empty/tombstone encodings). Registration inserts that cell into
//! the current worker's view table; strands on other workers get
//! identity-initialized views on first lookup, and joins fold everything
//! back into the leftmost cell in serial order. After the region the cell
//! holds exactly the serial result.

use crate::exception;
use crate::hypertable::{Bucket, HyperTable};
use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::mem::ManuallyDrop;
use core::num::NonZeroUsize;
use core::ptr::NonNull;
use std::collections::HashSet;
use std::sync::Mutex;

/// Type-erased view operations; one static instance per reducer type.
pub struct ViewVTable {
    pub size: usize,
    /// Allocates an identity view.
    pub identity: fn() -> NonNull<u8>,
    /// Folds the right view's contents into the left view. The right view
    /// is logically consumed.
    pub reduce: unsafe fn(left: *mut u8, right: *mut u8),
    /// Frees a view whose contents were already consumed by `reduce`.
    pub dealloc: unsafe fn(NonNull<u8>),
    /// Drops and frees a live view (orphan cleanup).
    pub drop_view: unsafe fn(NonNull<u8>),
}

/// An associative (not necessarily commutative) reduction.
pub trait ReduceOp<T>: 'static {
    fn identity() -> T;
    fn reduce(left: &mut T, right: T);
}

// === live-key registry ===
//
// Tracks which keys are registered, so region exit can drop views whose
// reducer was unregistered mid-region instead of carrying them into the
// next region.

static LIVE_KEYS: Mutex<Option<HashSet<usize>>> = Mutex::new(None);

fn registry_insert(key: usize) {
    LIVE_KEYS.lock().unwrap().get_or_insert_default().insert(key);
}

fn registry_remove(key: usize) {
    if let Some(set) = LIVE_KEYS.lock().unwrap().as_mut() {
        set.remove(&key);
    }
}

pub(crate) fn key_is_live(key: usize) -> bool {
    LIVE_KEYS
        .lock()
        .unwrap()
        .as_ref()
        .is_some_and(|set| set.contains(&key))
}

// === raw ABI ===

/// Registers a reducer: the key cell becomes the leftmost view in the
/// current worker's table.
///
/// # Safety
///
/// `key` must be a stable allocation of at least `vt.size` bytes, live until
/// unregistration.
pub unsafe fn reducer_register(key: NonNull<u8>, vt: &'static ViewVTable) {
    if vt.size == 0 {
        crate::alert::fatal!("registering a zero-size reducer");
    }
    let ok = crate::global::with_view_table(|table| {
        table.insert(Bucket {
            key: NonZeroUsize::new(key.as_ptr() as usize).unwrap(),
            view: key,
            vt,
        })
    });
    if !ok {
        crate::alert::fatal!("failed to register reducer");
    }
    registry_insert(key.as_ptr() as usize);
}

/// Removes a reducer's view from the current worker's table.
///
/// # Safety
///
/// `key` must have been registered.
pub unsafe fn reducer_unregister(key: NonNull<u8>) {
    registry_remove(key.as_ptr() as usize);
    crate::global::with_view_table(|table| {
        let _ = table.remove(NonZeroUsize::new(key.as_ptr() as usize).unwrap());
    });
}

/// Returns the calling strand's view for `key`, inserting an
/// identity-initialized view on miss.
///
/// # Safety
///
/// `key` must be a registered reducer key and `vt` its vtable.
pub unsafe fn reducer_lookup(key: NonNull<u8>, vt: &'static ViewVTable) -> NonNull<u8> {
    let key_nz = NonZeroUsize::new(key.as_ptr() as usize).unwrap();
    crate::global::with_view_table(|table| {
        if let Some(b) = table.get(key_nz) {
            debug_assert_eq!(b.key, key_nz);
            return b.view;
        }
        let view = (vt.identity)();
        table.insert(Bucket { key: key_nz, view, vt });
        crate::alert::alert!(Reduce, "new view {:p} for key {:p}", view, key);
        view
    })
}

// === safe surface ===

/// A hyperobject with a view per strand and deterministic left-to-right
/// reduction at joins.
pub struct Reducer<T: Send + 'static, Op: ReduceOp<T>> {
    cell: ManuallyDrop<Box<UnsafeCell<T>>>,
    _op: PhantomData<fn(Op)>,
}

// Safety: distinct strands get distinct views; the shared cell is only
// accessed by the leftmost strand and at joins under the closure mutex.
unsafe impl<T: Send + 'static, Op: ReduceOp<T>> Sync for Reducer<T, Op> {}

impl<T: Send + 'static, Op: ReduceOp<T>> Reducer<T, Op> {
    pub fn new(initial: T) -> Self {
        let cell = Box::new(UnsafeCell::new(initial));
        // Safety: the boxed cell is a stable allocation of size_of::<T>()
        // bytes, kept alive until drop/into_inner unregisters it.
        unsafe {
            reducer_register(
                NonNull::new(cell.as_ref() as *const _ as *mut u8).unwrap(),
                vtable::<T, Op>(),
            );
        }
        Self { cell: ManuallyDrop::new(cell), _op: PhantomData }
    }

    fn key(&self) -> NonNull<u8> {
        NonNull::new(self.cell.as_ref() as *const _ as *mut u8).unwrap()
    }

    /// Runs `f` on the calling strand's view. Outside a region this acts on
    /// the registered leftmost view under the registration lock.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        if crate::global::on_worker() {
            // Safety: key is registered; the returned view belongs
            // exclusively to the calling strand until its next spawn/sync.
            let view = unsafe { reducer_lookup(self.key(), vtable::<T, Op>()) };
            // Safety: see above; no other reference to this view exists
            // while f runs.
            f(unsafe { &mut *view.as_ptr().cast::<T>() })
        } else {
            let key = NonZeroUsize::new(self.key().as_ptr() as usize).unwrap();
            crate::global::with_view_table(|table| {
                let view = match table.get(key) {
                    Some(b) => b.view,
                    None => self.key(),
                };
                // Safety: the registration lock is held; the cell cannot be
                // touched by anything else outside a region.
                f(unsafe { &mut *view.as_ptr().cast::<T>() })
            })
        }
    }

    /// Unregisters and returns the fully reduced value. Call after the
    /// region that produced it.
    pub fn into_inner(mut self) -> T {
        // Safety: registered in new(); cell is taken exactly once since we
        // forget self below.
        unsafe {
            reducer_unregister(self.key());
            let cell = ManuallyDrop::take(&mut self.cell);
            core::mem::forget(self);
            cell.into_inner()
        }
    }
}

impl<T: Send + 'static, Op: ReduceOp<T>> Drop for Reducer<T, Op> {
    fn drop(&mut self) {
        // Safety: registered in new(); dropped exactly once.
        unsafe {
            reducer_unregister(self.key());
            ManuallyDrop::drop(&mut self.cell);
        }
    }
}

fn vtable<T: Send + 'static, Op: ReduceOp<T>>() -> &'static ViewVTable {
    fn identity_raw<T: Send + 'static, Op: ReduceOp<T>>() -> NonNull<u8> {
        NonNull::new(Box::into_raw(Box::new(Op::identity())).cast::<u8>()).unwrap()
    }
    unsafe fn reduce_raw<T: Send + 'static, Op: ReduceOp<T>>(left: *mut u8, right: *mut u8) {
        // Safety: both point at live T views; the right view's contents are
        // moved out here and its storage freed by the caller via dealloc.
        unsafe {
            let right = core::ptr::read(right.cast::<T>());
            Op::reduce(&mut *left.cast::<T>(), right);
        }
    }
    unsafe fn dealloc_raw<T>(view: NonNull<u8>) {
        // Safety: the view was allocated as Box<T> and its contents already
        // consumed; free the storage without dropping.
        unsafe { drop(Box::from_raw(view.as_ptr().cast::<ManuallyDrop<T>>())) }
    }
    unsafe fn drop_raw<T>(view: NonNull<u8>) {
        // Safety: the view was allocated as Box<T> and is live.
        unsafe { drop(Box::from_raw(view.as_ptr().cast::<T>())) }
    }

    const {
        &ViewVTable {
            size: size_of::<T>(),
            identity: identity_raw::<T, Op>,
            reduce: reduce_raw::<T, Op>,
            dealloc: dealloc_raw::<T>,
            drop_view: drop_raw::<T>,
        }
    }
}

/// Drops the views of unregistered reducers left in a table at region exit.
pub(crate) fn sweep_dead_views(table: &mut HyperTable) {
    let dead: Vec<_> = table
        .iter()
        .filter(|b| !key_is_live(b.key.get()))
        .map(|b| b.key)
        .collect();
    for key in dead {
        if let Some(b) = table.remove(key)
            && !b.is_leftmost()
        {
            // Safety: the reducer is gone; this orphan view is runtime-owned.
            unsafe { (b.vt.drop_view)(b.view) };
        }
    }
}

// === common operations ===

/// Integer addition.
pub struct OpAdd;

macro_rules! impl_op_add {
    ($($ty:ty),*) => {$(
        impl ReduceOp<$ty> for OpAdd {
            fn identity() -> $ty {
                0 as $ty
            }
            fn reduce(left: &mut $ty, right: $ty) {
                *left += right;
            }
        }
    )*};
}

impl_op_add!(u32, u64, usize, i32, i64, isize, f32, f64);

/// Ordered list concatenation; the result observes serial enumeration
/// order regardless of schedule.
pub struct OpList;

impl<T: Send + 'static> ReduceOp<Vec<T>> for OpList {
    fn identity() -> Vec<T> {
        Vec::new()
    }
    fn reduce(left: &mut Vec<T>, right: Vec<T>) {
        left.extend(right);
    }
}

/// Leftmost-wins over panic payloads; the runtime's own use of the reducer
/// discipline for exceptions.
pub struct OpLeftmostPanic;

impl ReduceOp<Option<exception::Payload>> for OpLeftmostPanic {
    fn identity() -> Option<exception::Payload> {
        None
    }
    fn reduce(left: &mut Option<exception::Payload>, right: Option<exception::Payload>) {
        let prev = left.take();
        *left = exception::combine(prev, right);
    }
}
