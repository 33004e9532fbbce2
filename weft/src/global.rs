// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The runtime's global state: an initialized-once, never-torn-down
//! singleton reached through [`get`]. Options are immutable after init;
//! worker threads start lazily at the first cilkified region and live until
//! [`shutdown`] or process exit.

use crate::arena::{Arena, ClosureId};
use crate::config::Options;
use crate::coord::Coord;
use crate::deque::ReadyDeque;
use crate::exception::Payload;
use crate::hypertable::HyperTable;
use crate::worker::{self, Worker};
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use stacklet::{Stacklet, pool::GlobalPool};
use std::sync::{Condvar, Mutex, OnceLock};

pub const MAX_CALLBACKS: usize = 32;

/// Registration failed because the callback table is full; the system is
/// otherwise unaffected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct CallbacksFull;

/// The worker count can only change before the runtime state exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct AlreadyInitialized;

struct Callbacks {
    init: Mutex<Vec<fn()>>,
    exit: Mutex<Vec<fn()>>,
    after_init: AtomicBool,
}

pub struct Global {
    pub options: Options,
    pub workers: Box<[Worker]>,
    pub deques: Box<[ReadyDeque]>,
    pub arena: Arena,
    pub stacklet_pool: GlobalPool,
    pub coord: Coord,
    pub done: AtomicBool,
    pub terminate: AtomicBool,
    pub root_closure: ClosureId,
    /// The root closure's permanent stacklet; boss-only, under the region
    /// lock.
    root_stacklet: UnsafeCell<Option<Stacklet>>,
    /// Reducer views owned by no strand: registrations made outside any
    /// region, plus the survivors of the last region. A region adopts this
    /// table at entry (it becomes the root strand's view table) and the
    /// finishing worker deposits it back at exit.
    pub registered_views: Mutex<Option<Box<HyperTable>>>,
    /// Serializes cilkified regions across threads.
    pub region_lock: Mutex<()>,
    pub region_panic: Mutex<Option<Payload>>,
    region_done: (Mutex<bool>, Condvar),
    workers_started: AtomicBool,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

// Safety: root_stacklet is only touched by the boss thread holding the
// region lock.
unsafe impl Sync for Global {}

static GLOBAL: OnceLock<Global> = OnceLock::new();
static NWORKERS_OVERRIDE: AtomicUsize = AtomicUsize::new(0);

static CALLBACKS: Callbacks = Callbacks {
    init: Mutex::new(Vec::new()),
    exit: Mutex::new(Vec::new()),
    after_init: AtomicBool::new(false),
};

pub fn get() -> &'static Global {
    if let Some(g) = GLOBAL.get() {
        return g;
    }
    let g = init();
    // Init callbacks run outside the OnceLock initializer, exactly once, in
    // registration order; a callback may call back into the runtime.
    if !CALLBACKS.after_init.swap(true, Ordering::AcqRel) {
        for cb in CALLBACKS.init.lock().unwrap().iter() {
            cb();
        }
    }
    g
}

fn init() -> &'static Global {
    GLOBAL.get_or_init(|| {
        let mut options = Options::from_env();
        let over = NWORKERS_OVERRIDE.load(Ordering::Acquire);
        if over > 0 {
            options.nworkers = over;
        }
        crate::alert::set_mask(options.alert_mask);
        // The stacklet layer may round the size; record what we actually got.
        options.stack_size = stacklet::set_stack_size(options.stack_size);

        tracing::debug!(
            nworkers = options.nworkers,
            stack_size = options.stack_size,
            deq_depth = options.deq_depth,
            "weft runtime init"
        );
        crate::alert::alert!(Boot, "starting runtime with {} workers", options.nworkers);

        let workers: Box<[Worker]> = (0..options.nworkers)
            .map(|i| Worker::new(i as u32, options.deq_depth, options.fiber_pool_cap))
            .collect();
        let deques: Box<[ReadyDeque]> = (0..options.nworkers).map(|_| ReadyDeque::new()).collect();
        let arena = Arena::new();

        // Carve out the root closure.
        let mut seed = Vec::new();
        arena.refill(&mut seed);
        let root_closure = seed.pop().unwrap();
        {
            let mut rest = seed;
            arena.spill(&mut rest);
        }

        Global {
            coord: Coord::new(options.nworkers),
            stacklet_pool: GlobalPool::new(options.fiber_pool_cap),
            workers,
            deques,
            arena,
            done: AtomicBool::new(false),
            terminate: AtomicBool::new(false),
            root_closure,
            root_stacklet: UnsafeCell::new(None),
            registered_views: Mutex::new(None),
            region_lock: Mutex::new(()),
            region_panic: Mutex::new(None),
            region_done: (Mutex::new(false), Condvar::new()),
            workers_started: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
            options,
        }
    })
}

impl Global {
    /// # Safety
    ///
    /// Boss thread only, holding the region lock.
    pub(crate) unsafe fn root_stacklet(&self) -> &mut Option<Stacklet> {
        // Safety: per the function contract.
        unsafe { &mut *self.root_stacklet.get() }
    }

    pub(crate) fn start_workers_if_needed(&'static self) {
        if self.workers_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut threads = self.threads.lock().unwrap();
        // Boss-thief mode: the invoking thread impersonates worker 0, so
        // dedicated threads start at 1.
        for id in 1..self.options.nworkers {
            let handle = std::thread::Builder::new()
                .name(format!("weft-worker-{id}"))
                .spawn(move || crate::scheduler::scheduler_thread_proc(id as u32))
                .unwrap_or_else(|err| crate::alert::fatal!("worker thread creation failed: {err}"));
            threads.push(handle);
        }
    }

    pub(crate) fn reset_region_signal(&self) {
        *self.region_done.0.lock().unwrap() = false;
    }

    pub(crate) fn signal_region_done(&self) {
        let (lock, cond) = &self.region_done;
        *lock.lock().unwrap() = true;
        cond.notify_all();
    }

    pub(crate) fn wait_region_done(&self) {
        let (lock, cond) = &self.region_done;
        let mut done = lock.lock().unwrap();
        while !*done {
            done = cond.wait(done).unwrap();
        }
    }
}

/// Runs `f` on the view table reducer operations act on: the calling
/// strand's worker table inside a region, or the locked global registration
/// table anywhere else.
pub(crate) fn with_view_table<R>(f: impl FnOnce(&mut HyperTable) -> R) -> R {
    let g = get();
    match worker::tls_worker() {
        Some(w) => {
            // Safety: we drive this worker; only its own strand touches the
            // table.
            let views = unsafe { w.views() };
            f(views.get_or_insert_with(HyperTable::new))
        }
        None => {
            let mut guard = g.registered_views.lock().unwrap();
            f(guard.get_or_insert_with(HyperTable::new))
        }
    }
}

pub(crate) fn on_worker() -> bool {
    worker::tls_worker().is_some()
}

// === public control surface ===

/// Registers a callback to run at runtime initialization.
///
/// # Errors
///
/// Fails when the table is full or the runtime already initialized.
pub fn atinit(cb: fn()) -> Result<(), CallbacksFull> {
    if CALLBACKS.after_init.load(Ordering::Acquire) {
        return Err(CallbacksFull);
    }
    let mut init = CALLBACKS.init.lock().unwrap();
    if init.len() == MAX_CALLBACKS {
        return Err(CallbacksFull);
    }
    init.push(cb);
    Ok(())
}

/// Registers a callback to run at [`shutdown`], in reverse registration
/// order.
///
/// # Errors
///
/// Fails when the table is full.
pub fn atexit(cb: fn()) -> Result<(), CallbacksFull> {
    let mut exit = CALLBACKS.exit.lock().unwrap();
    if exit.len() == MAX_CALLBACKS {
        return Err(CallbacksFull);
    }
    exit.push(cb);
    Ok(())
}

pub fn is_initialized() -> bool {
    GLOBAL.get().is_some()
}

/// True on a thread currently executing inside a cilkified region.
pub fn running_on_workers() -> bool {
    worker::tls_worker().is_some()
}

pub fn nworkers() -> usize {
    get().options.nworkers
}

/// The current worker's id, if called from inside a region.
pub fn worker_id() -> Option<u32> {
    worker::tls_worker().map(|w| w.self_id)
}

/// Overrides the worker count. Only effective before the runtime state is
/// created (that is, before the first region or any other forcing call).
///
/// # Errors
///
/// Fails once the runtime exists.
pub fn set_nworkers(n: usize) -> Result<(), AlreadyInitialized> {
    if n == 0 || is_initialized() {
        return Err(AlreadyInitialized);
    }
    NWORKERS_OVERRIDE.store(n, Ordering::Release);
    if is_initialized() { Err(AlreadyInitialized) } else { Ok(()) }
}

/// Stops the worker threads and runs exit callbacks. Regions entered after
/// this abort. Optional; process exit tears everything down anyway.
pub fn shutdown() {
    let Some(g) = GLOBAL.get() else { return };
    let _region = g.region_lock.lock().unwrap();
    g.terminate.store(true, Ordering::Release);
    g.coord.wake_everyone();
    for handle in g.threads.lock().unwrap().drain(..) {
        let _ = handle.join();
    }
    for cb in CALLBACKS.exit.lock().unwrap().iter().rev() {
        cb();
    }
}
