// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Stacklet recycling.
//!
//! Each worker owns a [`WorkerPool`] capped at a configured size. When a
//! pool overflows, a `1/BATCH_FRACTION` slice migrates to the shared
//! [`GlobalPool`]; when it runs dry, a batch migrates back before falling
//! through to a fresh mmap. The global pool holds up to `GLOBAL_POOL_RATIO`
//! times the per-worker cap and unmaps the rest.

use crate::Stacklet;
use std::io;
use std::sync::Mutex;

/// When a worker pool becomes full (empty), move this fraction of its
/// capacity back to (from) the global pool.
pub const BATCH_FRACTION: usize = 2;

/// The global pool holds this many times the per-worker capacity.
pub const GLOBAL_POOL_RATIO: usize = 10;

pub struct GlobalPool {
    free: Mutex<Vec<Stacklet>>,
    cap: usize,
}

impl GlobalPool {
    pub fn new(per_worker_cap: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            cap: per_worker_cap * GLOBAL_POOL_RATIO,
        }
    }

    /// Moves up to `max` stacklets out of the global pool.
    fn take_batch(&self, max: usize, into: &mut Vec<Stacklet>) {
        let mut free = self.free.lock().unwrap();
        let n = max.min(free.len());
        let start = free.len() - n;
        into.extend(free.drain(start..));
    }

    /// Absorbs a batch, unmapping whatever exceeds the global cap.
    fn put_batch(&self, batch: impl Iterator<Item = Stacklet>) {
        let mut free = self.free.lock().unwrap();
        for s in batch {
            if free.len() < self.cap {
                free.push(s);
            }
            // else: dropped here, which unmaps.
        }
    }
}

pub struct WorkerPool {
    free: Vec<Stacklet>,
    cap: usize,
    /// High-water mark of stacklets handed out and not yet returned.
    outstanding: usize,
    pub peak_outstanding: usize,
}

impl WorkerPool {
    pub fn new(cap: usize) -> Self {
        Self {
            free: Vec::with_capacity(cap),
            cap,
            outstanding: 0,
            peak_outstanding: 0,
        }
    }

    /// Grabs a stacklet: local pool, then a batch from the global pool, then
    /// a fresh mapping.
    ///
    /// # Errors
    ///
    /// Propagates mmap failure; the caller treats it as fatal.
    pub fn alloc(&mut self, global: &GlobalPool) -> io::Result<Stacklet> {
        self.outstanding += 1;
        self.peak_outstanding = self.peak_outstanding.max(self.outstanding);

        if self.free.is_empty() {
            global.take_batch(self.cap / BATCH_FRACTION, &mut self.free);
        }
        match self.free.pop() {
            Some(s) => {
                s.reset_header();
                Ok(s)
            }
            None => Stacklet::new(),
        }
    }

    /// Returns a stacklet, batch-migrating overflow to the global pool.
    pub fn dealloc(&mut self, global: &GlobalPool, stacklet: Stacklet) {
        debug_assert!(self.outstanding > 0);
        self.outstanding -= 1;
        self.free.push(stacklet);
        if self.free.len() > self.cap {
            let keep = self.cap - self.cap / BATCH_FRACTION;
            global.put_batch(self.free.drain(keep..));
        }
    }

    /// Unmaps everything still pooled locally.
    pub fn drain(&mut self) {
        self.free.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::set_stack_size;

    #[test]
    fn batch_migration_bounds() {
        set_stack_size(1024 * 1024);
        let global = GlobalPool::new(4);
        let mut pool = WorkerPool::new(4);

        let held: Vec<_> = (0..8).map(|_| pool.alloc(&global).unwrap()).collect();
        assert_eq!(pool.peak_outstanding, 8);

        for s in held {
            pool.dealloc(&global, s);
        }
        // Overflow past the cap of 4 migrated away in batches.
        assert!(pool.free.len() <= 4);
        assert!(!global.free.lock().unwrap().is_empty());

        // Reuse comes out of the local pool first and resets headers.
        let s = pool.alloc(&global).unwrap();
        assert!(s.header().worker.load(core::sync::atomic::Ordering::Relaxed).is_null());
        pool.dealloc(&global, s);
        pool.drain();
    }
}
