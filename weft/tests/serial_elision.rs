// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! With a single worker no steal can ever happen: every spawn degenerates
//! to a call and every sync to a no-op, and the observable behavior must
//! match the serial program.

use std::sync::Mutex;
use weft::Strand;

fn setup() {
    let _ = weft::set_nworkers(1);
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
fn fib_matches_serial() {
    setup();
    assert_eq!(weft::invoke(|s| fib(s, 20)), 6765);
    assert_eq!(weft::nworkers(), 1);
}

#[test]
fn execution_order_is_depth_first() {
    setup();
    // Spawned children run before the continuation; the trace must be the
    // serial preorder.
    let trace = weft::invoke(|s| {
        let trace = Mutex::new(Vec::new());
        let push = |v: u32| trace.lock().unwrap().push(v);
        s.scoped(|s| {
            s.spawn(|_| push(1));
            push(2);
            s.spawn(|_| push(3));
            push(4);
        });
        trace.into_inner().unwrap()
    });
    assert_eq!(trace, vec![1, 2, 3, 4]);
}

#[test]
fn single_worker_never_migrates() {
    setup();
    let ids = weft::invoke(|s| {
        let mut ids = Vec::new();
        let mut collected = Vec::new();
        s.scoped(|s| {
            s.spawn(|s| collected.push(s.worker_id()));
            ids.push(s.worker_id());
        });
        ids.extend(collected);
        ids
    });
    assert!(ids.iter().all(|&id| id == 0));
}
