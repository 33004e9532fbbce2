// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Panic propagation across strands.
//!
//! A panic is caught at its strand's boundary and becomes a payload flowing
//! through the per-closure exception slots (`user`, `child`, `right`), which
//! reduce exactly like hypertables: "no exception" is the identity and the
//! combine keeps the left payload, dropping the right one. The surviving
//! leftmost payload re-raises at the sync that owns the joining strands, or
//! unwinds out of the region entry after all children have joined — the
//! same exception the serial elision would have produced.

use std::any::Any;

pub type Payload = Box<dyn Any + Send + 'static>;

/// Leftmost-wins reduction. The discarded right payload is dropped here,
/// which releases whatever the panicking strand carried.
pub fn combine(left: Option<Payload>, right: Option<Payload>) -> Option<Payload> {
    match left {
        Some(l) => {
            drop(right);
            Some(l)
        }
        None => right,
    }
}

/// Re-raises a pending payload on the current strand.
pub fn rethrow(payload: Option<Payload>) {
    if let Some(payload) = payload {
        std::panic::resume_unwind(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn leftmost_wins_and_right_is_dropped() {
        let drops = Arc::new(AtomicUsize::new(0));
        let left: Payload = Box::new("left");
        let right: Payload = Box::new(DropCounter(drops.clone()));

        let survivor = combine(Some(left), Some(right)).unwrap();
        assert_eq!(drops.load(Ordering::Relaxed), 1);
        assert_eq!(*survivor.downcast::<&str>().unwrap(), "left");
    }

    #[test]
    fn identity_passes_through() {
        assert!(combine(None, None).is_none());
        let p: Payload = Box::new(7_u32);
        let got = combine(None, Some(p)).unwrap();
        assert_eq!(*got.downcast::<u32>().unwrap(), 7);
    }
}
