// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! With CILK_FORCE_REDUCE every spawning frame self-promotes at its sync,
//! so all joins run the full reducer merge machinery even on one worker.

use weft::{OpAdd, OpList, Reducer, Strand};

fn setup() {
    // Safety: runs before the runtime reads its environment; the test
    // harness threads all funnel through the same setup.
    unsafe {
        std::env::set_var("CILK_FORCE_REDUCE", "1");
    }
    let _ = weft::set_nworkers(2);
}

#[test]
fn forced_merges_keep_sums_exact() {
    setup();
    let sum = Reducer::<u64, OpAdd>::new(0);
    weft::invoke(|s| {
        s.for_range(0..50_000, 64, &|_s, _i| sum.with(|v| *v += 1));
    });
    assert_eq!(sum.into_inner(), 50_000);
}

#[test]
fn forced_merges_keep_order() {
    setup();
    let list = Reducer::<Vec<u32>, OpList>::new(Vec::new());
    fn emit(s: &Strand<'_>, list: &Reducer<Vec<u32>, OpList>, lo: u32, hi: u32) {
        if hi - lo == 1 {
            list.with(|v| v.push(lo));
            return;
        }
        let mid = lo + (hi - lo) / 2;
        s.scoped(|s| {
            s.spawn(move |s| emit(s, list, lo, mid));
            emit(s, list, mid, hi);
        });
    }
    weft::invoke(|s| emit(s, &list, 0, 256));
    assert_eq!(list.into_inner(), (0..256).collect::<Vec<_>>());
}
