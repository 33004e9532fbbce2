// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end fork/join scenarios with the default worker count.

use weft::Strand;

fn trace_init() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .try_init();
}

fn fib(s: &Strand<'_>, n: u64) -> u64 {
    if n < 2 {
        return n;
    }
    let (mut a, mut b) = (0, 0);
    s.scoped(|s| {
        s.spawn(|s| a = fib(s, n - 1));
        b = fib(s, n - 2);
    });
    a + b
}

#[test]
fn fib_20() {
    trace_init();
    assert_eq!(weft::invoke(|s| fib(s, 20)), 6765);
}

#[test]
fn fib_30_is_stable_across_reruns() {
    for _ in 0..10 {
        assert_eq!(weft::invoke(|s| fib(s, 30)), 832_040);
    }
}

#[test]
fn explicit_sync_mid_scope() {
    let total = weft::invoke(|s| {
        let mut parts = [0_u64; 4];
        s.scoped(|s| {
            let mut iter = parts.iter_mut();
            let first_half: Vec<_> = iter.by_ref().take(2).collect();
            for slot in first_half {
                s.spawn(move |s| *slot = fib(s, 15));
            }
            // Join the first wave before launching the second.
            s.sync();
            for slot in iter {
                s.spawn(move |s| *slot = fib(s, 16));
            }
        });
        parts.iter().sum::<u64>()
    });
    assert_eq!(total, 2 * 610 + 2 * 987);
}

#[test]
fn deep_spawn_chain() {
    // A right-leaning chain: each level spawns exactly one child.
    fn chain(s: &Strand<'_>, depth: u64) -> u64 {
        if depth == 0 {
            return 0;
        }
        let mut below = 0;
        s.scoped(|s| {
            s.spawn(|s| below = chain(s, depth - 1));
        });
        below + 1
    }
    assert_eq!(weft::invoke(|s| chain(s, 200)), 200);
}

#[test]
fn parallel_loop_sums() {
    use std::sync::atomic::{AtomicU64, Ordering};
    let sum = AtomicU64::new(0);
    weft::invoke(|s| {
        s.for_range(0..10_000, 64, &|_s, i| {
            sum.fetch_add(i as u64, Ordering::Relaxed);
        });
    });
    assert_eq!(sum.into_inner(), 10_000 * 9_999 / 2);
}

#[test]
fn runtime_introspection() {
    assert!(!weft::running_on_workers());
    let (inside, id) = weft::invoke(|_s| (weft::running_on_workers(), weft::worker_id()));
    assert!(inside);
    assert!(id.is_some());
    assert!(weft::is_initialized());
    assert!(weft::nworkers() >= 1);
    assert_eq!(weft::set_nworkers(3), Err(weft::AlreadyInitialized));
}
