//! Kill-thread loop
//!
//! Drives a set of weakly held threads to termination:
//!
//! 1. purge threads that already terminated
//! 2. once per `kill_thread_interval`, mark every thread in one round if
//!    any of them is still unmarked, and account the pause it caused
//! 3. past `FORCEFUL_FACTOR` intervals, force-wake every survivor
//! 4. interrupt threads sitting in tenant-aware waits (all of them once
//!    forceful)
//! 5. dump the survivors' stacks once, if configured
//! 6. bail out with [`KillOutcome::PartialSuccess`] when a soft budget is
//!    exceeded and the caller allows asynchronous completion
//!
//! The loop polls instead of spinning so it does not flood the marking step.

use crate::config::ShutdownSettings;
use crate::engine::control::ThreadControl;
use crate::engine::thread::ThreadRecord;
use crate::perf::{ScopedTimer, ShutdownMetrics, TimerType};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Escalate to forced wake-ups after this many marking intervals.
pub const FORCEFUL_FACTOR: u32 = 10;

/// Upper bound on the sleep between two iterations.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Result of one kill loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum KillOutcome {
    /// Every thread terminated.
    FullSuccess,
    /// A soft budget ran out; the remaining threads are left to a watchdog.
    PartialSuccess,
}

/// Diagnostics of one kill loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KillStats {
    /// Marking rounds issued.
    pub tries: u32,
    pub total_pause: Duration,
    pub max_pause: Duration,
    pub elapsed: Duration,
}

/// What a watchdog reports once it finished a deferred destroy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchdogReport {
    pub container_id: u64,
    pub name: String,
    /// Threads that were still alive when the watchdog took over.
    pub handed_over: usize,
    pub stats: KillStats,
}

pub(crate) struct KillResult {
    pub outcome: KillOutcome,
    pub remaining: Vec<Weak<ThreadRecord>>,
    pub stats: KillStats,
}

pub(crate) struct KillLoop<'a> {
    pub control: &'a dyn ThreadControl,
    pub settings: &'a ShutdownSettings,
    pub metrics: &'a ShutdownMetrics,
    pub container_id: u64,
    pub destroy_begin: Instant,
    pub stacks_dumped: &'a AtomicBool,
}

impl KillLoop<'_> {
    pub(crate) fn run(&self, mut threads: Vec<Weak<ThreadRecord>>, allow_async: bool) -> KillResult {
        let interval = self.settings.kill_thread_interval;
        let poll = interval.min(MAX_POLL_INTERVAL);
        let stw_limit = self.settings.stw_soft_limit;
        let wall_limit = self.settings.effective_wall_clock_limit();
        let start = Instant::now();
        let mut stats = KillStats::default();
        let mut last_round: Option<Instant> = None;

        loop {
            let live = purge(&mut threads);
            stats.elapsed = start.elapsed();
            if live.is_empty() {
                self.log_stats(&stats, 0);
                return KillResult {
                    outcome: KillOutcome::FullSuccess,
                    remaining: threads,
                    stats,
                };
            }

            let forceful = stats.elapsed > interval * FORCEFUL_FACTOR;
            if last_round.map_or(true, |at| at.elapsed() >= interval) {
                if live
                    .iter()
                    .any(|thread| !self.control.is_marked_for_destroy(thread))
                {
                    let timer = ScopedTimer::new(self.metrics, TimerType::MarkRound);
                    self.control.mark_for_destroy(&live);
                    let pause = timer.elapsed();
                    stats.tries += 1;
                    stats.total_pause += pause;
                    stats.max_pause = stats.max_pause.max(pause);
                }
                if forceful {
                    for thread in &live {
                        self.control.force_wake(thread);
                    }
                }
                last_round = Some(Instant::now());
                self.log_stats(&stats, live.len());
            }

            for thread in &live {
                if forceful || thread.run_state().is_waiting() {
                    self.control.interrupt(thread);
                }
            }

            if let Some(delay) = self.settings.print_stacks_on_timeout_delay {
                if self.destroy_begin.elapsed() >= delay
                    && !self.stacks_dumped.swap(true, Ordering::SeqCst)
                {
                    info!(
                        container_id = self.container_id,
                        remaining = live.len(),
                        "Dumping stacks of threads that survived destroy"
                    );
                    self.control.dump_stacks(&live);
                }
            }

            if allow_async {
                let over_stw = stw_limit.map_or(false, |limit| stats.total_pause > limit);
                let over_wall = wall_limit.map_or(false, |limit| stats.elapsed > limit);
                if over_stw || over_wall {
                    info!(
                        container_id = self.container_id,
                        remaining = live.len(),
                        elapsed_ms = stats.elapsed.as_millis() as u64,
                        total_pause_us = stats.total_pause.as_micros() as u64,
                        "Soft shutdown limit exceeded, continuing asynchronously"
                    );
                    return KillResult {
                        outcome: KillOutcome::PartialSuccess,
                        remaining: threads,
                        stats,
                    };
                }
            }

            drop(live);
            std::thread::sleep(poll);
        }
    }

    fn log_stats(&self, stats: &KillStats, remaining: usize) {
        if self.settings.debug_shutdown {
            info!(
                container_id = self.container_id,
                remaining,
                tries = stats.tries,
                total_pause_us = stats.total_pause.as_micros() as u64,
                max_pause_us = stats.max_pause.as_micros() as u64,
                elapsed_ms = stats.elapsed.as_millis() as u64,
                "Kill loop progress"
            );
        } else {
            debug!(container_id = self.container_id, remaining, tries = stats.tries, "Kill loop progress");
        }
    }
}

/// Drop dead entries and return strong references to the live ones.
fn purge(threads: &mut Vec<Weak<ThreadRecord>>) -> Vec<Arc<ThreadRecord>> {
    let mut live = Vec::with_capacity(threads.len());
    threads.retain(|weak| match weak.upgrade() {
        Some(thread) if !thread.is_terminated() => {
            live.push(thread);
            true
        }
        _ => false,
    });
    live
}
