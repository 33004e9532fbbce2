// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Worker coordination: classifying thieves as sentinels, putting excess
//! sentinels to sleep, and waking them as parallelism returns.
//!
//! The central datum is a packed 64-bit word holding the disengaged and
//! sentinel counts, updated by CAS. Each thief keeps 32-sample histories of
//! whether the workforce looked efficient or inefficient and acts on the
//! popcount difference. Disengaged workers park on a futex (condvar
//! fallback off Linux) and occupy the high indices of the index-to-worker
//! map, so victim sampling concentrates on engaged workers.

use crate::worker::WorkerId;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use core::time::Duration;
use std::sync::Mutex;

/// Nanoseconds a sentinel sleeps when it hits the disengage threshold but
/// stays engaged.
pub const NAP_NSEC: u64 = 25_000;
pub const SLEEP_NSEC: u64 = NAP_NSEC;

/// Ratio of active workers over sentinels the system aims to maintain.
pub const AS_RATIO: u32 = 2;

/// Consecutive failed steal attempts before a thief counts as a sentinel.
/// Power of two.
pub const SENTINEL_THRESHOLD: u32 = 128;

/// Steal attempts per worker-state sample. Divides SENTINEL_THRESHOLD.
pub const ATTEMPTS: u32 = 4;

pub const HISTORY_LENGTH: u32 = 32;
pub const SENTINEL_COUNT_HISTORY: usize = 4;

/// Amount of history that must agree before reengaging/disengaging.
pub const HISTORY_THRESHOLD: u32 = 3 * HISTORY_LENGTH / 4;

/// Consecutive failed steal attempts before trying to disengage.
pub const DISENGAGE_THRESHOLD: u32 = HISTORY_THRESHOLD * SENTINEL_THRESHOLD;

mycelium_bitfield::bitfield! {
    /// The packed `(disengaged, sentinel)` coordination word.
    pub struct DisengagedSentinel<u64> {
        /// Number of sentinel workers.
        pub const SENTINEL = 32;
        /// Number of disengaged workers.
        pub const DISENGAGED = 32;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerCounts {
    pub active: i32,
    pub sentinels: i32,
    pub disengaged: i32,
}

pub fn worker_counts(word: u64, nworkers: usize) -> WorkerCounts {
    let packed = DisengagedSentinel::from_bits(word);
    let sentinels = packed.get(DisengagedSentinel::SENTINEL) as i32;
    let disengaged = packed.get(DisengagedSentinel::DISENGAGED) as i32;
    debug_assert!(disengaged < nworkers as i32);
    debug_assert!(sentinels + disengaged <= nworkers as i32);
    WorkerCounts {
        active: nworkers as i32 - disengaged - sentinels,
        sentinels,
        disengaged,
    }
}

/// More sentinels than the active workforce justifies.
pub fn is_inefficient(c: WorkerCounts) -> bool {
    c.sentinels > 1 && c.active >= 1 && c.active * (AS_RATIO as i32) < c.sentinels
}

pub fn is_efficient(c: WorkerCounts) -> bool {
    c.active >= c.sentinels * AS_RATIO as i32 || c.sentinels <= 1
}

const fn pack(disengaged: u32, sentinel: u32) -> u64 {
    ((disengaged as u64) << 32) | sentinel as u64
}

// === futex / condvar parking ===

/// A 32-bit word that threads can wait on. Futex-backed on Linux, condvar
/// fallback elsewhere.
pub struct WaitWord {
    value: AtomicU32,
    #[cfg(not(target_os = "linux"))]
    lock: Mutex<()>,
    #[cfg(not(target_os = "linux"))]
    cond: std::sync::Condvar,
}

impl WaitWord {
    pub fn new(value: u32) -> Self {
        Self {
            value: AtomicU32::new(value),
            #[cfg(not(target_os = "linux"))]
            lock: Mutex::new(()),
            #[cfg(not(target_os = "linux"))]
            cond: std::sync::Condvar::new(),
        }
    }

    #[inline]
    pub fn value(&self) -> &AtomicU32 {
        &self.value
    }

    /// Blocks while the word still reads `expected`. Spurious wakeups are
    /// fine; callers loop.
    pub fn wait(&self, expected: u32) {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "linux")] {
                // Safety: the futex syscall reads 4 bytes at the word's
                // address; the word outlives every waiter.
                unsafe {
                    libc::syscall(
                        libc::SYS_futex,
                        self.value.as_ptr(),
                        libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                        expected,
                        core::ptr::null::<libc::timespec>(),
                    );
                }
            } else {
                let guard = self.lock.lock().unwrap();
                if self.value.load(Ordering::Acquire) == expected {
                    let _unused = self.cond.wait(guard).unwrap();
                }
            }
        }
    }

    pub fn wake(&self, n: i32) {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "linux")] {
                // Safety: see wait().
                unsafe {
                    libc::syscall(
                        libc::SYS_futex,
                        self.value.as_ptr(),
                        libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                        n,
                    );
                }
            } else {
                let _guard = self.lock.lock().unwrap();
                if n == 1 {
                    self.cond.notify_one();
                } else {
                    self.cond.notify_all();
                }
            }
        }
    }

    pub fn wake_all(&self) {
        self.wake(i32::MAX);
    }
}

// === per-thief sleep bookkeeping ===

#[derive(Debug)]
pub struct SleepState {
    pub fails: u32,
    pub sample_threshold: u32,
    inefficient_history: u32,
    efficient_history: u32,
    sentinel_count_history: [u32; SENTINEL_COUNT_HISTORY],
    sentinel_count_history_tail: usize,
    recent_sentinel_count: u32,
}

impl SleepState {
    pub fn new() -> Self {
        Self {
            fails: 0,
            sample_threshold: SENTINEL_THRESHOLD,
            inefficient_history: 0,
            efficient_history: 0,
            sentinel_count_history: [1; SENTINEL_COUNT_HISTORY],
            sentinel_count_history_tail: 0,
            recent_sentinel_count: SENTINEL_COUNT_HISTORY as u32,
        }
    }

    fn push_sentinel_count(&mut self, current: u32) {
        let tail = self.sentinel_count_history_tail;
        self.recent_sentinel_count =
            self.recent_sentinel_count - self.sentinel_count_history[tail] + current;
        self.sentinel_count_history[tail] = current;
        self.sentinel_count_history_tail = (tail + 1) % SENTINEL_COUNT_HISTORY;
    }
}

// === the coordination layer ===

pub struct Coord {
    nworkers: usize,
    disengaged_sentinel: AtomicU64,
    /// Nonzero while a cilkified region is executing; thieves sleep here
    /// between regions.
    cilkified: WaitWord,
    /// Semaphore of outstanding reengagement requests.
    reengage_requests: WaitWord,
    index_lock: Mutex<()>,
    index_to_worker: Box<[AtomicU32]>,
    worker_to_index: Box<[AtomicU32]>,
}

impl Coord {
    pub fn new(nworkers: usize) -> Self {
        Self {
            nworkers,
            disengaged_sentinel: AtomicU64::new(0),
            cilkified: WaitWord::new(0),
            reengage_requests: WaitWord::new(0),
            index_lock: Mutex::new(()),
            index_to_worker: (0..nworkers as u32).map(AtomicU32::new).collect(),
            worker_to_index: (0..nworkers as u32).map(AtomicU32::new).collect(),
        }
    }

    #[inline]
    pub fn counts(&self) -> WorkerCounts {
        // SeqCst pairs with the done flag: a thief that disengaged before
        // observing termination is visible to the terminator's count.
        worker_counts(self.disengaged_sentinel.load(Ordering::SeqCst), self.nworkers)
    }

    #[inline]
    pub fn index_to_worker(&self, index: usize) -> WorkerId {
        self.index_to_worker[index].load(Ordering::Relaxed)
    }

    fn add_to_sentinels(&self, val: i32) -> u64 {
        self.disengaged_sentinel
            .fetch_add(val as i64 as u64, Ordering::Release)
    }

    fn add_to_disengaged(&self, val: i32) -> u64 {
        let mut boff = crate::sync::Backoff::new();
        loop {
            let old = self.disengaged_sentinel.load(Ordering::Relaxed);
            let packed = DisengagedSentinel::from_bits(old);
            let new = pack(
                (packed.get(DisengagedSentinel::DISENGAGED) as u32).wrapping_add_signed(val),
                packed.get(DisengagedSentinel::SENTINEL) as u32,
            );
            if self
                .disengaged_sentinel
                .compare_exchange(old, new, Ordering::SeqCst, Ordering::Acquire)
                .is_ok()
            {
                return old;
            }
            boff.spin();
        }
    }

    /// Swaps `self_id`'s position in the index maps with whatever worker
    /// currently sits at `target_index`. Index lock must be held.
    fn swap_worker_with_target(&self, self_id: WorkerId, target_index: u32) {
        let self_index = self.worker_to_index[self_id as usize].load(Ordering::Relaxed);
        let target_worker = self.index_to_worker[target_index as usize].load(Ordering::Relaxed);

        self.index_to_worker[self_index as usize].store(target_worker, Ordering::Relaxed);
        self.index_to_worker[target_index as usize].store(self_id, Ordering::Relaxed);
        self.worker_to_index[target_worker as usize].store(self_index, Ordering::Relaxed);
        self.worker_to_index[self_id as usize].store(target_index, Ordering::Relaxed);
    }

    // === region gating ===

    pub fn set_cilkified(&self) {
        self.cilkified.value().store(1, Ordering::Release);
    }

    pub fn clear_cilkified(&self) {
        self.cilkified.value().store(0, Ordering::Release);
    }

    pub fn is_cilkified(&self) -> bool {
        self.cilkified.value().load(Ordering::Acquire) != 0
    }

    /// Wakes every thief for a new region.
    pub fn wake_thieves(&self) {
        self.set_cilkified();
        self.cilkified.wake_all();
    }

    /// Parks the calling worker until the next region starts (or
    /// termination, which also bumps the word).
    pub fn wait_while_uncilkified(&self) {
        while self.cilkified.value().load(Ordering::Acquire) == 0 {
            self.cilkified.wait(0);
        }
    }

    /// Termination path: make every parked worker observe the flags,
    /// wherever it sleeps.
    pub fn wake_everyone(&self) {
        self.cilkified.value().store(u32::MAX, Ordering::Release);
        self.cilkified.wake_all();
        self.reengage_requests
            .value()
            .fetch_add(self.nworkers as u32, Ordering::Release);
        self.reengage_requests.wake_all();
    }

    /// Requests that `n` disengaged thieves come back.
    pub fn request_more_thieves(&self, n: u32) {
        debug_assert!(n > 0);
        self.reengage_requests.value().fetch_add(n, Ordering::Release);
        self.reengage_requests.wake(n as i32);
    }

    pub fn pending_reengage_requests(&self) -> u32 {
        self.reengage_requests.value().load(Ordering::Relaxed)
    }

    /// Region entry: stale requests from the previous region's teardown
    /// must not eat into this region's wakeups.
    pub fn drain_reengage_requests(&self) {
        self.reengage_requests.value().store(0, Ordering::Release);
    }

    /// Parks until a reengagement request arrives; consumes one and returns
    /// the observed wake value for sentinel classification.
    fn wait_for_reengagement(&self) -> u32 {
        loop {
            let val = self.reengage_requests.value().load(Ordering::Acquire);
            if val > 0 {
                if self
                    .reengage_requests
                    .value()
                    .compare_exchange(val, val - 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return val;
                }
                continue;
            }
            self.reengage_requests.wait(0);
        }
    }

    /// Classifies a woken worker: low wake values mean the workforce is
    /// trickling back in, so rejoin as a sentinel.
    pub fn init_fails(&self, wake_val: u32) -> u32 {
        if wake_val as usize <= self.nworkers / 2 {
            self.add_to_sentinels(1);
            SENTINEL_THRESHOLD
        } else {
            0
        }
    }

    /// A sentinel that found work stops being a sentinel.
    pub fn reset_fails(&self, fails: u32) -> u32 {
        if fails >= SENTINEL_THRESHOLD {
            self.add_to_sentinels(-1);
        }
        0
    }

    // === disengagement ===

    fn try_to_disengage_thief(&self, self_id: WorkerId, done: &AtomicBool, snapshot: u64) -> bool {
        let Ok(guard) = self.index_lock.try_lock() else {
            return false;
        };

        let packed = DisengagedSentinel::from_bits(snapshot);
        let new = pack(
            packed.get(DisengagedSentinel::DISENGAGED) as u32 + 1,
            packed.get(DisengagedSentinel::SENTINEL) as u32 - 1,
        );

        if self
            .disengaged_sentinel
            .compare_exchange(snapshot, new, Ordering::SeqCst, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        // Move ourselves into the disengaged suffix of the index map.
        let last_index = self.nworkers as u32 - (new >> 32) as u32;
        if self.worker_to_index[self_id as usize].load(Ordering::Relaxed) < last_index {
            self.swap_worker_with_target(self_id, last_index);
        }
        drop(guard);

        // A region ending between our count update and the park would strand
        // us on the futex; the terminator sets `done` (SeqCst) before
        // counting the disengaged workers it must kick.
        if !done.load(Ordering::SeqCst) {
            tracing::trace!(worker = self_id, "disengaging");
            let wake_val = self.wait_for_reengagement();
            tracing::trace!(worker = self_id, wake_val, "reengaged");
        }

        // Reengage: decrement disengaged, increment sentinel, move back into
        // the engaged prefix.
        let guard = self.index_lock.lock().unwrap();
        let old = {
            let mut boff = crate::sync::Backoff::new();
            loop {
                let old = self.disengaged_sentinel.load(Ordering::Relaxed);
                let packed = DisengagedSentinel::from_bits(old);
                let new = pack(
                    packed.get(DisengagedSentinel::DISENGAGED) as u32 - 1,
                    packed.get(DisengagedSentinel::SENTINEL) as u32 + 1,
                );
                if self
                    .disengaged_sentinel
                    .compare_exchange(old, new, Ordering::Release, Ordering::Acquire)
                    .is_ok()
                {
                    break old;
                }
                boff.spin();
            }
        };
        let last_index = self.nworkers as u32 - (old >> 32) as u32;
        if self.worker_to_index[self_id as usize].load(Ordering::Relaxed) > last_index {
            self.swap_worker_with_target(self_id, last_index);
        }
        drop(guard);
        true
    }

    fn maybe_disengage_thief(&self, self_id: WorkerId, done: &AtomicBool) -> bool {
        // Never disengage the last sentinel.
        let mut boff = crate::sync::Backoff::new();
        loop {
            let snapshot = self.disengaged_sentinel.load(Ordering::Acquire);
            if !is_inefficient(worker_counts(snapshot, self.nworkers)) {
                return false;
            }
            if self.try_to_disengage_thief(self_id, done, snapshot) {
                return true;
            }
            boff.spin();
        }
    }

    // === steal-outcome accounting ===

    /// Steal attempts found work: update histories, possibly request
    /// reengagement. Returns the adjusted fail count.
    pub fn on_successful_steal(&self, self_id: WorkerId, sleep: &mut SleepState, fails: u32) -> u32 {
        if fails < SENTINEL_THRESHOLD {
            return fails;
        }
        // This thief is no longer a sentinel.
        let word = self.add_to_sentinels(-1);
        let counts = worker_counts(word.wrapping_sub(1), self.nworkers);
        debug_assert!(counts.active >= 1);

        if fails >= sleep.sample_threshold {
            let ineff = is_inefficient(counts) as u32;
            sleep.inefficient_history = (sleep.inefficient_history >> 1) | (ineff << (HISTORY_LENGTH - 1));
            let eff = is_efficient(counts) as u32;
            sleep.efficient_history = (sleep.efficient_history >> 1) | (eff << (HISTORY_LENGTH - 1));
            sleep.push_sentinel_count(counts.sentinels as u32 + 1);
        }

        // Request reengagement proportional to the efficiency surplus,
        // divided by the recent average sentinel count so parallel sentinels
        // acting on the same history don't over-request.
        let eff_steps = sleep.efficient_history.count_ones() as i32;
        let ineff_steps = sleep.inefficient_history.count_ones() as i32;
        let eff_diff = eff_steps - ineff_steps;
        let mut request = 0;
        if eff_diff >= HISTORY_THRESHOLD as i32 {
            let avg_sentinels =
                (sleep.recent_sentinel_count / SENTINEL_COUNT_HISTORY as u32).max(1);
            request = eff_diff as u32 / avg_sentinels;
            let remainder = eff_diff as u32 % avg_sentinels;
            if remainder != 0 && self_id % remainder != 0 {
                request += 1;
            }
            // Charge the request against the history.
            sleep.efficient_history = 0;
            sleep.inefficient_history = 0;
        }

        // Keep at least one worker inbound whenever sentinels ran out with
        // workers still parked.
        if request == 0 && counts.sentinels == 0 && counts.active < self.nworkers as i32 {
            let floor = (counts.active as u32 + 3) / 4;
            let current = self.pending_reengage_requests();
            if current < floor {
                request = floor - current;
            }
        }

        if request > 0 {
            tracing::trace!(worker = self_id, request, "requesting reengagement");
            self.request_more_thieves(request);
        }

        let fails = fails.min(SENTINEL_THRESHOLD);
        sleep.sample_threshold = fails + SENTINEL_THRESHOLD;
        fails
    }

    /// Steal attempts found nothing: escalate nap → sleep → disengage.
    /// Returns the new fail count.
    pub fn on_failed_steal(
        &self,
        self_id: WorkerId,
        is_boss: bool,
        done: &AtomicBool,
        sleep: &mut SleepState,
        mut fails: u32,
    ) -> u32 {
        const NAP_THRESHOLD: u32 = SENTINEL_THRESHOLD;
        const SLEEP_THRESHOLD: u32 = NAP_THRESHOLD;
        const MAX_FAILS: u32 = 2 * if SLEEP_THRESHOLD > DISENGAGE_THRESHOLD {
            SLEEP_THRESHOLD
        } else {
            DISENGAGE_THRESHOLD
        };

        fails += ATTEMPTS;
        if fails % SENTINEL_THRESHOLD != 0 {
            return fails;
        }

        if fails > MAX_FAILS {
            // Cap so the count cannot overflow.
            std::thread::sleep(Duration::from_nanos(SLEEP_NSEC));
            return MAX_FAILS;
        }

        if fails == SENTINEL_THRESHOLD {
            self.add_to_sentinels(1);
        }

        let counts = self.counts();
        sleep.push_sentinel_count(counts.sentinels as u32);

        let eff = is_efficient(counts) as u32;
        sleep.efficient_history = (sleep.efficient_history >> 1) | (eff << (HISTORY_LENGTH - 1));
        let ineff = is_inefficient(counts) as u32;
        sleep.inefficient_history = (sleep.inefficient_history >> 1) | (ineff << (HISTORY_LENGTH - 1));
        let eff_steps = sleep.efficient_history.count_ones() as i32;
        let ineff_steps = sleep.inefficient_history.count_ones() as i32;

        if is_boss {
            // The boss never disengages; it naps instead.
            if fails % NAP_THRESHOLD == 0 {
                let nsec = if fails > SLEEP_THRESHOLD { SLEEP_NSEC } else { NAP_NSEC };
                std::thread::sleep(Duration::from_nanos(nsec));
            }
            return fails;
        }

        if ineff != 0 && ineff_steps - eff_steps > HISTORY_THRESHOLD as i32 {
            let start = std::time::Instant::now();
            if self.maybe_disengage_thief(self_id, done) {
                // Time disengaged converts back into history samples and a
                // fail-count reduction, so a worker woken into a quiet
                // system retries disengaging soon.
                let scaled = scaled_elapsed(start.elapsed().as_nanos() as u64);
                if scaled > SENTINEL_THRESHOLD {
                    let samples = scaled / SENTINEL_THRESHOLD;
                    if samples >= HISTORY_LENGTH {
                        sleep.efficient_history = 0;
                        sleep.inefficient_history = 0;
                        let current = self.counts().sentinels as u32;
                        sleep.sentinel_count_history = [current; SENTINEL_COUNT_HISTORY];
                        sleep.recent_sentinel_count = current * SENTINEL_COUNT_HISTORY as u32;
                    } else {
                        sleep.efficient_history >>= samples;
                        sleep.inefficient_history >>= samples;
                    }
                }
                fails = if scaled < SENTINEL_THRESHOLD {
                    fails - scaled.min(fails)
                } else {
                    DISENGAGE_THRESHOLD - SENTINEL_THRESHOLD
                };
                sleep.sample_threshold = SENTINEL_THRESHOLD;
                return fails;
            }
        }

        if fails % NAP_THRESHOLD == 0 {
            let nsec = if fails > SLEEP_THRESHOLD { SLEEP_NSEC } else { NAP_NSEC };
            std::thread::sleep(Duration::from_nanos(nsec));
        }
        fails
    }
}

/// Converts elapsed nanoseconds into an equivalent fail count, rounded to a
/// multiple of ATTEMPTS.
fn scaled_elapsed(elapsed_ns: u64) -> u32 {
    (((elapsed_ns * SENTINEL_THRESHOLD as u64 / 65_536) / ATTEMPTS as u64) * ATTEMPTS as u64)
        .min(u32::MAX as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_word_roundtrips() {
        let word = pack(3, 7);
        let packed = DisengagedSentinel::from_bits(word);
        assert_eq!(packed.get(DisengagedSentinel::SENTINEL), 7);
        assert_eq!(packed.get(DisengagedSentinel::DISENGAGED), 3);

        let counts = worker_counts(word, 16);
        assert_eq!(counts, WorkerCounts { active: 6, sentinels: 7, disengaged: 3 });
    }

    #[test]
    fn efficiency_classification() {
        let balanced = WorkerCounts { active: 8, sentinels: 4, disengaged: 0 };
        assert!(is_efficient(balanced));
        assert!(!is_inefficient(balanced));

        let starved = WorkerCounts { active: 2, sentinels: 10, disengaged: 0 };
        assert!(!is_efficient(starved));
        assert!(is_inefficient(starved));
    }

    #[test]
    fn sentinel_transitions_update_the_word() {
        let coord = Coord::new(8);
        coord.add_to_sentinels(1);
        coord.add_to_sentinels(1);
        assert_eq!(coord.counts().sentinels, 2);
        coord.add_to_sentinels(-1);
        assert_eq!(coord.counts().sentinels, 1);
        coord.add_to_disengaged(1);
        assert_eq!(coord.counts().disengaged, 1);
        coord.add_to_disengaged(-1);
        assert_eq!(coord.counts(), WorkerCounts { active: 7, sentinels: 1, disengaged: 0 });
    }

    #[test]
    fn minimum_one_reengagement_request() {
        let coord = Coord::new(8);
        let mut sleep = SleepState::new();
        // The last sentinel finds work while a worker is parked: at least
        // one parked worker must be requested back.
        coord.add_to_disengaged(1);
        coord.add_to_sentinels(1);
        let fails = coord.on_successful_steal(0, &mut sleep, SENTINEL_THRESHOLD);
        assert_eq!(fails, SENTINEL_THRESHOLD);
        assert!(coord.pending_reengage_requests() >= 1);
    }

    #[test]
    fn failed_steals_escalate_to_sentinel() {
        let coord = Coord::new(4);
        let done = AtomicBool::new(false);
        let mut sleep = SleepState::new();
        let mut fails = 0;
        while fails < SENTINEL_THRESHOLD {
            fails = coord.on_failed_steal(1, false, &done, &mut sleep, fails);
        }
        assert_eq!(coord.counts().sentinels, 1);
        let fails = coord.reset_fails(fails);
        assert_eq!(fails, 0);
        assert_eq!(coord.counts().sentinels, 0);
    }

    #[test]
    fn index_map_swaps_are_consistent() {
        let coord = Coord::new(4);
        let _guard = coord.index_lock.lock().unwrap();
        coord.swap_worker_with_target(0, 3);
        assert_eq!(coord.index_to_worker(3), 0);
        assert_eq!(coord.index_to_worker(0), 3);
        for i in 0..4 {
            let w = coord.index_to_worker(i);
            assert_eq!(coord.worker_to_index[w as usize].load(Ordering::Relaxed), i as u32);
        }
    }
}
