// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Worker-to-CPU pinning (Linux only). `CILK_PIN` selects grouped or
//! hyperthread-split placement; when workers outnumber cores, pinning is
//! disabled entirely rather than oversubscribing a partial assignment.

use crate::config::PinStrategy;

#[cfg(target_os = "linux")]
pub fn pin_current_thread(worker_id: usize, nworkers: usize, strategy: PinStrategy) {
    if strategy == PinStrategy::Disabled {
        return;
    }

    // Safety: plain affinity queries/updates on the calling thread.
    unsafe {
        let mut process_mask: libc::cpu_set_t = core::mem::zeroed();
        if libc::sched_getaffinity(0, size_of::<libc::cpu_set_t>(), &mut process_mask) != 0 {
            return;
        }
        let available: Vec<usize> =
            (0..libc::CPU_SETSIZE as usize).filter(|&c| libc::CPU_ISSET(c, &process_mask)).collect();

        if nworkers > available.len() {
            tracing::warn!(
                nworkers,
                cores = available.len(),
                "more workers than cores, pinning disabled"
            );
            return;
        }

        let group_size = available.len() / nworkers;
        let mut mask: libc::cpu_set_t = core::mem::zeroed();
        for k in 0..group_size {
            let idx = match strategy {
                // (0, 1), (2, 3), ...: adjacent ids share a worker.
                PinStrategy::Grouped => worker_id * group_size + k,
                // (0, N/2), (1, N/2 + 1), ...: split hyperthread pairs.
                PinStrategy::Split => worker_id + k * nworkers,
                PinStrategy::Disabled => unreachable!(),
            };
            libc::CPU_SET(available[idx], &mut mask);
        }
        if libc::sched_setaffinity(0, size_of::<libc::cpu_set_t>(), &mask) != 0 {
            tracing::warn!(worker_id, "sched_setaffinity failed");
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(_worker_id: usize, _nworkers: usize, strategy: PinStrategy) {
    if strategy != PinStrategy::Disabled {
        tracing::warn!("worker pinning is only supported on Linux");
    }
}
