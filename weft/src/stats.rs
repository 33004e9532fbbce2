// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-worker scheduling counters, compiled in with the `stats` feature and
//! logged at region exit.

#[cfg(feature = "stats")]
#[derive(Debug, Default)]
pub struct Stats {
    pub steals: u64,
    pub steal_attempts: u64,
    pub provably_good_steals: u64,
    pub sync_suspensions: u64,
    pub spawns: u64,
}

#[cfg(feature = "stats")]
impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dump(&self, worker: crate::worker::WorkerId) {
        tracing::debug!(
            worker,
            spawns = self.spawns,
            steals = self.steals,
            steal_attempts = self.steal_attempts,
            provably_good_steals = self.provably_good_steals,
            sync_suspensions = self.sync_suspensions,
            "scheduling stats"
        );
    }
}

#[cfg(not(feature = "stats"))]
#[derive(Debug, Default)]
pub struct Stats;

#[cfg(not(feature = "stats"))]
impl Stats {
    pub fn new() -> Self {
        Self
    }

    pub fn dump(&self, _worker: crate::worker::WorkerId) {}
}

/// Bumps a counter when stats are compiled in.
macro_rules! stat_inc {
    ($local:expr, $field:ident) => {
        #[cfg(feature = "stats")]
        {
            $local.stats.$field += 1;
        }
    };
}

pub(crate) use stat_inc;
