// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Results are invariant with a wider pool than most CI machines have
//! cores, exercising the sentinel/disengage machinery.

use weft::Strand;

fn setup() {
    let _ = weft::set_nworkers(8);
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
    assert_eq!(weft::nworkers(), 8);
}

#[test]
fn fib_28_repeated() {
    setup();
    for _ in 0..3 {
        assert_eq!(weft::invoke(|s| fib(s, 28)), 317_811);
    }
}

#[test]
fn sequential_regions_let_workers_sleep_between() {
    setup();
    // Between the regions every thief goes back to the uncilkified wait;
    // naps and disengagement inside the region must unwind cleanly.
    for n in [10, 18, 22] {
        let expect = weft::invoke(|s| fib(s, n));
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(weft::invoke(|s| fib(s, n)), expect);
    }
}
