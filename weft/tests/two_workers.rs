// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Results are invariant at a fixed small worker count, where the deque is
//! often depth one and steal-then-owner-pop races are common.

use weft::{OpAdd, Reducer, Strand};

fn setup() {
    let _ = weft::set_nworkers(2);
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
    setup();
    assert_eq!(weft::invoke(|s| fib(s, 20)), 6765);
    assert_eq!(weft::nworkers(), 2);
}

#[test]
fn fib_25_repeated() {
    setup();
    for _ in 0..5 {
        assert_eq!(weft::invoke(|s| fib(s, 25)), 75_025);
    }
}

#[test]
fn reducer_sum_with_contention() {
    setup();
    let sum = Reducer::<u64, OpAdd>::new(0);
    weft::invoke(|s| {
        s.for_range(0..100_000, 128, &|_s, _i| sum.with(|v| *v += 1));
    });
    assert_eq!(sum.into_inner(), 100_000);
}
