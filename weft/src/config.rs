// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Runtime options, read once from the environment at init and immutable
//! afterwards.

use std::env;

pub const DEFAULT_STACK_SIZE: usize = 0x10_0000; // 1 MiB
pub const DEFAULT_DEQ_DEPTH: usize = 1024;
pub const DEFAULT_FIBER_POOL_CAP: usize = 8;

pub const MIN_STACK_SIZE: usize = 16 * 1024;
pub const MAX_STACK_SIZE: usize = 100 * 1024 * 1024;
pub const MIN_DEQ_DEPTH: usize = 1;
pub const MAX_DEQ_DEPTH: usize = 99_999;
pub const MIN_FIBER_POOL_CAP: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinStrategy {
    /// Leave thread placement to the OS.
    Disabled,
    /// Groups of adjacent CPU ids per worker: (0, 1), (2, 3), ...
    Grouped,
    /// Hyperthread-split pairs: (0, N/2), (1, N/2 + 1), ...
    Split,
}

#[derive(Debug, Clone)]
pub struct Options {
    pub nworkers: usize,
    pub stack_size: usize,
    pub deq_depth: usize,
    pub fiber_pool_cap: usize,
    pub pin: PinStrategy,
    pub alert_mask: u32,
    pub debug_mask: u32,
    pub force_reduce: bool,
}

impl Options {
    /// Reads the `CILK_*` environment, falling back to defaults (with a
    /// warning) on anything unparsable or out of range.
    pub fn from_env() -> Self {
        let nworkers = match env_usize("CILK_NWORKERS") {
            Some(n) if n > 0 => n,
            Some(_) | None => detect_nproc(),
        };

        let stack_size = env_usize("CILK_STACKSIZE")
            .map(|v| clamped("CILK_STACKSIZE", v, MIN_STACK_SIZE, MAX_STACK_SIZE))
            .unwrap_or(DEFAULT_STACK_SIZE);

        let deq_depth = env_usize("CILK_DEQDEPTH")
            .map(|v| clamped("CILK_DEQDEPTH", v, MIN_DEQ_DEPTH, MAX_DEQ_DEPTH))
            .unwrap_or(DEFAULT_DEQ_DEPTH);

        let fiber_pool_cap = env_usize("CILK_FIBER_POOL")
            .map(|v| clamped("CILK_FIBER_POOL", v, MIN_FIBER_POOL_CAP, usize::MAX))
            .unwrap_or(DEFAULT_FIBER_POOL_CAP);

        let pin = match env_usize("CILK_PIN") {
            None | Some(0) => PinStrategy::Disabled,
            Some(1) => PinStrategy::Grouped,
            Some(2) => PinStrategy::Split,
            Some(3) => PinStrategy::Disabled,
            Some(other) => {
                tracing::warn!(value = other, "CILK_PIN out of range, pinning disabled");
                PinStrategy::Disabled
            }
        };

        Self {
            nworkers,
            stack_size,
            deq_depth,
            fiber_pool_cap,
            pin,
            alert_mask: env_mask("CILK_ALERT"),
            debug_mask: env_mask("CILK_DEBUG"),
            force_reduce: env_usize("CILK_FORCE_REDUCE").is_some_and(|v| v != 0),
        }
    }
}

fn detect_nproc() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn env_usize(name: &str) -> Option<usize> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(%name, %raw, "ignoring unparsable runtime option");
            None
        }
    }
}

/// Bitmask options accept decimal or `0x` hex.
fn env_mask(name: &str) -> u32 {
    let Ok(raw) = env::var(name) else { return 0 };
    let raw = raw.trim();
    let parsed = raw
        .strip_prefix("0x")
        .map(|hex| u32::from_str_radix(hex, 16))
        .unwrap_or_else(|| raw.parse());
    match parsed {
        Ok(v) => v,
        Err(_) => {
            tracing::warn!(%name, %raw, "ignoring unparsable bitmask");
            0
        }
    }
}

fn clamped(name: &str, v: usize, min: usize, max: usize) -> usize {
    let c = v.clamp(min, max);
    if c != v {
        tracing::warn!(%name, value = v, clamped = c, "runtime option out of range");
    }
    c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        // Only assert the derived invariants so the test is immune to
        // whatever CILK_* variables the harness happens to set.
        let opts = Options::from_env();
        assert!(opts.nworkers >= 1);
        assert!((MIN_STACK_SIZE..=MAX_STACK_SIZE).contains(&opts.stack_size));
        assert!((MIN_DEQ_DEPTH..=MAX_DEQ_DEPTH).contains(&opts.deq_depth));
        assert!(opts.fiber_pool_cap >= MIN_FIBER_POOL_CAP);
    }
}
