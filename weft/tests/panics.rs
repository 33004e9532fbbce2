// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Panic propagation across strands: the leftmost payload in serial order
//! wins, losers are dropped exactly once, and the region entry rethrows
//! after all children joined.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn payload_str(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string payload>")
}

#[test]
fn region_rethrows_root_panic() {
    let err = catch_unwind(|| weft::invoke(|_s| panic!("root says no"))).unwrap_err();
    assert_eq!(payload_str(&*err), "root says no");
}

#[test]
fn child_panic_reaches_the_caller() {
    let err = catch_unwind(AssertUnwindSafe(|| {
        weft::invoke(|s| {
            s.scoped(|s| {
                s.spawn(|_| panic!("child says no"));
            });
        })
    }))
    .unwrap_err();
    assert_eq!(payload_str(&*err), "child says no");
}

#[test]
fn leftmost_payload_wins() {
    // The left child is spawned first, so its payload is the serial-order
    // exception regardless of which strand panicked first in wall time.
    for _ in 0..20 {
        let err = catch_unwind(AssertUnwindSafe(|| {
            weft::invoke(|s| {
                s.scoped(|s| {
                    s.spawn(|_| {
                        panic!("left");
                    });
                    s.spawn(|_| {
                        panic!("right");
                    });
                });
            })
        }))
        .unwrap_err();
        assert_eq!(payload_str(&*err), "left");
    }
}

#[test]
fn losing_payloads_are_dropped_not_leaked() {
    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let drops = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let left = Tracked(drops.clone());
        let right = Tracked(drops.clone());
        let err = catch_unwind(AssertUnwindSafe(|| {
            weft::invoke(|s| {
                s.scoped(|s| {
                    s.spawn(move |_| std::panic::panic_any(left));
                    s.spawn(move |_| std::panic::panic_any(right));
                });
            })
        }))
        .unwrap_err();
        drop(err);
    }
    // Each iteration made two payloads; both must be dropped by the end,
    // whether they won or lost.
    assert_eq!(drops.load(Ordering::SeqCst), 20);
}

#[test]
fn siblings_join_before_the_panic_surfaces() {
    let finished = Arc::new(AtomicUsize::new(0));
    let observed = finished.clone();
    let err = catch_unwind(AssertUnwindSafe(|| {
        weft::invoke(|s| {
            s.scoped(|s| {
                s.spawn(|_| panic!("early"));
                for _ in 0..8 {
                    let finished = finished.clone();
                    s.spawn(move |_| {
                        std::thread::sleep(std::time::Duration::from_millis(1));
                        finished.fetch_add(1, Ordering::SeqCst);
                    });
                }
            });
        })
    }))
    .unwrap_err();
    assert_eq!(payload_str(&*err), "early");
    // No orphan strands: everything spawned before the panic joined.
    let done = observed.load(Ordering::SeqCst);
    assert!(done == 8 || done == 0, "partial join: {done} of 8");
}
