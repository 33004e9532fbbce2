// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The extension hook: a pedigree-style client that tracks spawn depth in
//! per-frame out-of-band state.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use weft::{Extension, Strand};

static MAX_DEPTH: AtomicU64 = AtomicU64::new(0);
static SYNCS_SEEN: AtomicUsize = AtomicUsize::new(0);
static RETURNS_SEEN: AtomicUsize = AtomicUsize::new(0);

struct DepthTracker;

impl Extension for DepthTracker {
    fn size(&self) -> usize {
        size_of::<u64>()
    }

    fn extend_spawn(&self, parent: *mut u8, child: *mut u8) {
        // The root frame carries no extension state; its children start at
        // depth one.
        let parent_depth = if parent.is_null() {
            0
        } else {
            // Safety: the runtime hands us our own size()-byte allocations.
            unsafe { *parent.cast::<u64>() }
        };
        let depth = parent_depth + 1;
        // Safety: as above.
        unsafe { *child.cast::<u64>() = depth };
        MAX_DEPTH.fetch_max(depth, Ordering::Relaxed);
    }

    fn extend_return_from_spawn(&self, _ext: *mut u8) {
        RETURNS_SEEN.fetch_add(1, Ordering::Relaxed);
    }

    fn extend_sync(&self, _ext: *mut u8) {
        SYNCS_SEEN.fetch_add(1, Ordering::Relaxed);
    }
}

fn chain(s: &Strand<'_>, depth: u64) {
    if depth == 0 {
        return;
    }
    s.scoped(|s| {
        s.spawn(move |s| chain(s, depth - 1));
    });
}

#[test]
fn depth_tracks_through_spawn_duplication() {
    weft::register_extension(&DepthTracker).expect("first registration");
    assert!(weft::register_extension(&DepthTracker).is_err());

    weft::invoke(|s| chain(s, 12));

    assert_eq!(MAX_DEPTH.load(Ordering::Relaxed), 12);
    assert!(SYNCS_SEEN.load(Ordering::Relaxed) >= 12);
    assert!(RETURNS_SEEN.load(Ordering::Relaxed) >= 1);
}
