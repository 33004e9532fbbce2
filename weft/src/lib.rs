// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A randomized work-stealing runtime for fork/join parallelism.
//!
//! Weft multiplexes a tree of logically parallel tasks onto a fixed pool of
//! worker threads while preserving serial-elision semantics: running with
//! one worker behaves exactly like replacing every [`Strand::spawn`] with a
//! call and every [`Strand::sync`] with a no-op. Suspended continuations are
//! stolen from the top of per-worker deques using the classic THE
//! head/exc/tail protocol; the cactus stack is built from pooled,
//! guard-paged stack segments; and [`Reducer`]s give each strand a private
//! view with deterministic left-to-right reduction at joins, independent of
//! the schedule.
//!
//! ```
//! fn fib(s: &weft::Strand<'_>, n: u64) -> u64 {
//!     if n < 2 {
//!         return n;
//!     }
//!     let (mut a, mut b) = (0, 0);
//!     s.scoped(|s| {
//!         s.spawn(|s| a = fib(s, n - 1));
//!         b = fib(s, n - 2);
//!     });
//!     a + b
//! }
//!
//! let n = weft::invoke(|s| fib(s, 10));
//! assert_eq!(n, 55);
//! ```
//!
//! Configuration is read once from the environment (`CILK_NWORKERS`,
//! `CILK_STACKSIZE`, `CILK_DEQDEPTH`, `CILK_FIBER_POOL`, `CILK_PIN`,
//! `CILK_ALERT`, `CILK_DEBUG`); see the `config` module for ranges and
//! defaults.

#[macro_use]
pub mod alert;

pub mod config;
pub mod ext;
pub mod reducer;

mod arena;
mod closure;
mod coord;
mod deque;
mod exception;
mod frame;
mod global;
mod hypertable;
mod pin;
mod region;
mod scheduler;
mod stats;
mod strand;
mod sync;
mod worker;

pub use ext::{Extension, pop_ext_stack, push_ext_stack, register_extension};
pub use frame::FrameFlags;
pub use global::{
    AlreadyInitialized, CallbacksFull, atexit, atinit, is_initialized, nworkers,
    running_on_workers, set_nworkers, shutdown, worker_id,
};
pub use reducer::{OpAdd, OpList, ReduceOp, Reducer};
pub use region::invoke;
pub use strand::Strand;
