//! Host-side thread control and per-thread usage metering
//!
//! The kill loop never touches threads directly: it goes through a
//! [`ThreadControl`], and resource accounting goes through a [`UsageMeter`].
//! Both are installed on the [`TenantRuntime`](crate::TenantRuntime) and can be
//! replaced, which is how tests observe or slow down termination.

use crate::engine::thread::ThreadRecord;
use std::sync::Arc;
use tracing::warn;

/// Operations the kill loop needs from the host runtime.
///
/// Every method must be safe to call from any thread and must do nothing
/// when the target already exited.
pub trait ThreadControl: Send + Sync {
    /// Mark all `threads` for destruction in one round.
    fn mark_for_destroy(&self, threads: &[Arc<ThreadRecord>]);

    fn is_marked_for_destroy(&self, thread: &ThreadRecord) -> bool;

    /// Wake a thread however it is blocked.
    fn force_wake(&self, thread: &ThreadRecord);

    /// Lighter wake-up for threads waiting in tenant-aware helpers.
    fn interrupt(&self, thread: &ThreadRecord);

    /// Report where the given threads currently are.
    fn dump_stacks(&self, threads: &[Arc<ThreadRecord>]);
}

/// Default [`ThreadControl`] built on cooperative check points plus
/// `SIGURG` escalation.
#[derive(Debug, Default, Clone, Copy)]
pub struct CooperativeControl;

impl ThreadControl for CooperativeControl {
    fn mark_for_destroy(&self, threads: &[Arc<ThreadRecord>]) {
        for thread in threads {
            thread.mark_for_destroy();
        }
    }

    fn is_marked_for_destroy(&self, thread: &ThreadRecord) -> bool {
        thread.is_marked_for_destroy()
    }

    fn force_wake(&self, thread: &ThreadRecord) {
        if thread.is_masked() || thread.is_terminated() {
            return;
        }
        thread.unpark();
        // Re-checks the mask level under the lock that masking takes.
        thread.signal_wake();
    }

    fn interrupt(&self, thread: &ThreadRecord) {
        thread.interrupt();
    }

    fn dump_stacks(&self, threads: &[Arc<ThreadRecord>]) {
        for thread in threads {
            let checkpoint = thread
                .last_checkpoint()
                .map(|loc| loc.to_string())
                .unwrap_or_else(|| "<none>".to_string());
            warn!(
                thread_id = thread.id(),
                name = thread.name().unwrap_or("<unnamed>"),
                os_tid = thread.os_tid(),
                state = %thread.run_state(),
                mask_level = thread.mask_level(),
                last_checkpoint = %checkpoint,
                "Thread still alive after destroy"
            );
        }
    }
}

/// Source of per-thread resource usage, in nanoseconds.
///
/// Readings of one thread must be monotonic.
pub trait UsageMeter: Send + Sync {
    fn thread_usage(&self, thread: &ThreadRecord) -> u64;
}

/// Reads the CPU clock of a thread (`pthread_getcpuclockid` + `clock_gettime`).
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadCpuMeter;

impl UsageMeter for ThreadCpuMeter {
    fn thread_usage(&self, thread: &ThreadRecord) -> u64 {
        thread.with_native(read_thread_cpu_ns).flatten().unwrap_or(0)
    }
}

fn read_thread_cpu_ns(thread: libc::pthread_t) -> Option<u64> {
    let mut clock: libc::clockid_t = 0;
    // SAFETY: the caller holds the record's native handle lock, so `thread`
    // has not exited yet.
    let rc = unsafe { libc::pthread_getcpuclockid(thread, &mut clock) };
    if rc != 0 {
        return None;
    }
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid out pointer.
    let rc = unsafe { libc::clock_gettime(clock, &mut ts) };
    if rc != 0 {
        return None;
    }
    Some(ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::thread;
    use std::time::Duration;

    #[test]
    fn test_cooperative_mark() {
        let handle = std::thread::spawn(|| {
            let record = ThreadRecord::current();
            CooperativeControl.mark_for_destroy(&[Arc::clone(&record)]);
            (
                CooperativeControl.is_marked_for_destroy(&record),
                thread::checkpoint(),
            )
        });
        let (marked, result) = handle.join().unwrap();
        assert!(marked);
        assert!(result.is_err());
    }

    #[test]
    fn test_force_wake_skips_masked() {
        let handle = std::thread::spawn(|| {
            let record = ThreadRecord::current();
            let _guard = thread::mask();
            CooperativeControl.force_wake(&record);
            CooperativeControl.interrupt(&record);
            record.is_interrupted()
        });
        assert!(!handle.join().unwrap());
    }

    #[test]
    fn test_dump_stacks_does_not_panic() {
        let record = ThreadRecord::current();
        let _ = thread::checkpoint();
        CooperativeControl.dump_stacks(&[record]);
    }

    #[test]
    fn test_cpu_meter_is_monotonic() {
        let record = ThreadRecord::current();
        let before = ThreadCpuMeter.thread_usage(&record);
        let deadline = std::time::Instant::now() + Duration::from_millis(20);
        let mut spin = 0u64;
        while std::time::Instant::now() < deadline {
            spin = spin.wrapping_add(1);
        }
        let after = ThreadCpuMeter.thread_usage(&record);
        assert!(spin > 0);
        assert!(after > before);
    }

    #[test]
    fn test_cpu_meter_exited_thread_reads_zero() {
        let handle = thread::spawn(|| ()).unwrap();
        let record = Arc::clone(handle.record());
        handle.join().unwrap();
        assert_eq!(ThreadCpuMeter.thread_usage(&record), 0);
    }
}
