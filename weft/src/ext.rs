// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The extension hook: per-frame out-of-band data with stack-like push/pop
//! and spawn-time duplication, the mechanism pedigree-style clients build
//! on. The runtime calls the registered callbacks around spawn and sync;
//! nothing else interprets the extension bytes.

use crate::worker::Worker;
use std::sync::OnceLock;

pub trait Extension: Sync + Send + 'static {
    /// Bytes of extension state per frame.
    fn size(&self) -> usize;
    /// Fills a spawned child's extension from its parent's.
    fn extend_spawn(&self, parent: *mut u8, child: *mut u8);
    /// A spawned child returned; its extension is about to be popped.
    fn extend_return_from_spawn(&self, ext: *mut u8);
    /// The owning frame passed a sync.
    fn extend_sync(&self, ext: *mut u8);
}

static EXTENSION: OnceLock<&'static dyn Extension> = OnceLock::new();

/// Registers the process-wide extension. Must happen before the first
/// cilkified region; later registrations fail.
pub fn register_extension(ext: &'static dyn Extension) -> Result<(), ()> {
    EXTENSION.set(ext).map_err(|_| ())
}

#[inline]
pub(crate) fn registered() -> Option<&'static dyn Extension> {
    EXTENSION.get().copied()
}

/// Fixed extension-stack size; outstanding pointers into the stack forbid
/// reallocation, so overflow is fatal like deque overflow.
const EXT_STACK_SIZE: usize = 64 * 1024;

/// Reserves `size` bytes on the calling worker's extension stack and
/// returns them. Must be called from inside a region.
pub fn push_ext_stack(size: usize) -> *mut u8 {
    let Some(w) = crate::worker::tls_worker() else {
        crate::alert::fatal!("extension stack access outside a cilkified region");
    };
    push_on(w, size)
}

/// Pops the most recent `size` bytes of the calling worker's extension
/// stack.
pub fn pop_ext_stack(size: usize) {
    let Some(w) = crate::worker::tls_worker() else {
        crate::alert::fatal!("extension stack access outside a cilkified region");
    };
    pop_on(w, size)
}

fn push_on(w: &Worker, size: usize) -> *mut u8 {
    // Safety: the extension stack belongs to the owning thread.
    let stack = unsafe { &mut *w.ext_stack.get() };
    if stack.capacity() == 0 {
        stack.reserve_exact(EXT_STACK_SIZE);
    }
    let old_len = stack.len();
    if old_len + size > stack.capacity() {
        crate::alert::fatal!("extension stack overflow");
    }
    stack.resize(old_len + size, 0);
    // Safety: within the fixed capacity, so no reallocation moved the base.
    unsafe { stack.as_mut_ptr().add(old_len) }
}

fn pop_on(w: &Worker, size: usize) {
    // Safety: the extension stack belongs to the owning thread.
    let stack = unsafe { &mut *w.ext_stack.get() };
    debug_assert!(stack.len() >= size);
    stack.truncate(stack.len() - size);
}

pub(crate) fn on_spawn(w: &Worker, parent_ext: *mut u8) -> *mut u8 {
    match registered() {
        Some(ext) => {
            let child = push_on(w, ext.size());
            ext.extend_spawn(parent_ext, child);
            child
        }
        None => core::ptr::null_mut(),
    }
}

pub(crate) fn on_return_from_spawn(w: &Worker, child_ext: *mut u8) {
    if let Some(ext) = registered()
        && !child_ext.is_null()
    {
        ext.extend_return_from_spawn(child_ext);
        pop_on(w, ext.size());
    }
}

pub(crate) fn on_sync(ext_ptr: *mut u8) {
    if let Some(ext) = registered()
        && !ext_ptr.is_null()
    {
        ext.extend_sync(ext_ptr);
    }
}
