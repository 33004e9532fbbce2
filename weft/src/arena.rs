// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Closure storage.
//!
//! Closures live in a global chunked arena and are referenced by dense
//! [`ClosureId`]s; the tree and deque links are ids, never owning pointers.
//! Chunks are never unmapped while the runtime lives, so resolving an id is
//! a lock-free double index. Reclamation goes through per-worker free-lists
//! that exchange fixed-size batches with a locked global free-list, the same
//! discipline the internal allocator of the original runtime used.

use crate::closure::Closure;
use core::fmt;
use core::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Mutex;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClosureId(pub u32);

pub const NO_CLOSURE: ClosureId = ClosureId(u32::MAX);

impl ClosureId {
    #[inline]
    pub fn is_none(self) -> bool {
        self == NO_CLOSURE
    }

    #[inline]
    pub fn is_some(self) -> bool {
        self != NO_CLOSURE
    }
}

impl fmt::Debug for ClosureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("ClosureId(none)")
        } else {
            write!(f, "ClosureId({})", self.0)
        }
    }
}

const CHUNK_BITS: usize = 8;
const CHUNK_LEN: usize = 1 << CHUNK_BITS;
const MAX_CHUNKS: usize = 1 << 14;

/// Ids a worker keeps cached before spilling half back to the global list.
pub const FREE_BATCH: usize = 32;

pub struct Arena {
    chunks: Box<[AtomicPtr<Closure>]>,
    grow: Mutex<u32>,
    global_free: Mutex<Vec<ClosureId>>,
}

// Safety: chunk pointers are published with release stores and never change
// once set; Closure handles its own interior synchronization.
unsafe impl Sync for Arena {}
unsafe impl Send for Arena {}

impl Arena {
    pub fn new() -> Self {
        Self {
            chunks: (0..MAX_CHUNKS).map(|_| AtomicPtr::new(core::ptr::null_mut())).collect(),
            grow: Mutex::new(0),
            global_free: Mutex::new(Vec::new()),
        }
    }

    /// Resolves an id. The returned reference is valid for the lifetime of
    /// the arena; the caller is responsible for respecting the closure's
    /// status tag.
    #[inline]
    pub fn get(&self, id: ClosureId) -> &Closure {
        debug_assert!(id.is_some());
        let chunk = self.chunks[id.0 as usize >> CHUNK_BITS].load(Ordering::Acquire);
        debug_assert!(!chunk.is_null(), "closure id {id:?} points into an unallocated chunk");
        // Safety: chunks are CHUNK_LEN closures long and never freed.
        unsafe { &*chunk.add(id.0 as usize & (CHUNK_LEN - 1)) }
    }

    /// Moves up to [`FREE_BATCH`] free ids into `cache`, growing the arena
    /// by a chunk when the global list is dry.
    pub fn refill(&self, cache: &mut Vec<ClosureId>) {
        {
            let mut global = self.global_free.lock().unwrap();
            if !global.is_empty() {
                let n = FREE_BATCH.min(global.len());
                let at = global.len() - n;
                cache.extend(global.drain(at..));
                return;
            }
        }

        // Grow by one chunk; its first FREE_BATCH ids go to the caller and
        // the rest to the global list.
        let mut grow = self.grow.lock().unwrap();
        let chunk_idx = *grow as usize;
        if chunk_idx >= MAX_CHUNKS {
            crate::alert::fatal!("closure arena exhausted ({MAX_CHUNKS} chunks)");
        }
        let chunk: Box<[Closure]> = (0..CHUNK_LEN).map(|_| Closure::new()).collect();
        let ptr = Box::into_raw(chunk) as *mut Closure;
        self.chunks[chunk_idx].store(ptr, Ordering::Release);
        *grow += 1;
        drop(grow);

        let base = (chunk_idx << CHUNK_BITS) as u32;
        cache.extend((0..FREE_BATCH as u32).map(|i| ClosureId(base + i)));
        let mut global = self.global_free.lock().unwrap();
        global.extend((FREE_BATCH as u32..CHUNK_LEN as u32).map(|i| ClosureId(base + i)));
    }

    /// Returns a batch of ids from an overfull worker cache.
    pub fn spill(&self, cache: &mut Vec<ClosureId>) {
        let keep = cache.len() / 2;
        self.global_free.lock().unwrap().extend(cache.drain(keep..));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::closure::ClosureStatus;

    #[test]
    fn ids_resolve_and_recycle() {
        let arena = Arena::new();
        let mut cache = Vec::new();
        arena.refill(&mut cache);
        assert_eq!(cache.len(), FREE_BATCH);

        let id = cache.pop().unwrap();
        let cl = arena.get(id);
        assert_eq!(cl.status(), ClosureStatus::PreInvalid);

        // Spilling and refilling hands ids back out.
        let mut big: Vec<_> = cache.drain(..).collect();
        arena.spill(&mut big);
        let mut fresh = Vec::new();
        arena.refill(&mut fresh);
        assert!(!fresh.is_empty());
    }
}
