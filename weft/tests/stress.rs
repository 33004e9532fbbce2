// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Volume tests: a million-task spawn tree, repeated regions, and closure
//! recycling under sustained churn.

use weft::Strand;

fn trace_init() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).try_init();
}

fn tree(s: &Strand<'_>, depth: u32) -> u64 {
    if depth == 0 {
        return 1;
    }
    let (mut a, mut b) = (0, 0);
    s.scoped(|s| {
        s.spawn(|s| a = tree(s, depth - 1));
        b = tree(s, depth - 1);
    });
    a + b
}

#[test]
fn million_task_tree() {
    trace_init();
    // 2^20 leaves; every internal node spawns once.
    assert_eq!(weft::invoke(|s| tree(s, 20)), 1 << 20);
}

#[test]
fn repeated_regions_reuse_runtime_state() {
    for i in 0..200 {
        let got = weft::invoke(|s| tree(s, 6));
        assert_eq!(got, 64, "region {i}");
    }
}

#[test]
fn wide_flat_fanout() {
    use std::sync::atomic::{AtomicU64, Ordering};
    let hits = AtomicU64::new(0);
    weft::invoke(|s| {
        s.scoped(|s| {
            for _ in 0..10_000 {
                s.spawn(|_| {
                    hits.fetch_add(1, Ordering::Relaxed);
                });
            }
        });
    });
    assert_eq!(hits.into_inner(), 10_000);
}

#[test]
fn mixed_depth_and_breadth() {
    fn go(s: &Strand<'_>, depth: u32, breadth: usize) -> u64 {
        if depth == 0 {
            return 1;
        }
        let mut counts = vec![0_u64; breadth];
        s.scoped(|s| {
            for slot in counts.iter_mut() {
                s.spawn(move |s| *slot = go(s, depth - 1, breadth));
            }
        });
        counts.iter().sum::<u64>() + 1
    }
    // 4^6 leaves plus internal nodes.
    let expect = (0..=6).map(|d| 4_u64.pow(d)).sum::<u64>();
    assert_eq!(weft::invoke(|s| go(s, 6, 4)), expect);
}
