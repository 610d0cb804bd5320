//! Shutdown Metrics
//!
//! Lightweight counters describing how containers are created and torn
//! down: how long `destroy()` takes, how many marking rounds the kill loop
//! needed, and how often it had to fall back to a watchdog.
//!
//! # Design Goals:
//! - Lock-free atomic counters
//! - Zero allocation when recording

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Metrics of one [`TenantRuntime`](crate::TenantRuntime).
#[derive(Debug, Default)]
pub struct ShutdownMetrics {
    pub containers_created: AtomicU64,
    pub containers_destroyed: AtomicU64,
    pub destroy_time_ns: AtomicU64,

    // Kill loop
    pub mark_rounds: AtomicU64,
    pub pause_time_ns: AtomicU64,
    pub max_pause_ns: AtomicU64,
    pub watchdogs_spawned: AtomicU64,

    // Hooks
    pub hooks_run: AtomicU64,
    pub hook_failures: AtomicU64,
}

impl ShutdownMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_create(&self) {
        self.containers_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished `destroy()`
    pub fn record_destroy(&self, duration: Duration) {
        self.containers_destroyed.fetch_add(1, Ordering::Relaxed);
        self.destroy_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Record one marking round and the pause it caused
    pub fn record_mark_round(&self, pause: Duration) {
        let ns = pause.as_nanos() as u64;
        self.mark_rounds.fetch_add(1, Ordering::Relaxed);
        self.pause_time_ns.fetch_add(ns, Ordering::Relaxed);
        self.max_pause_ns.fetch_max(ns, Ordering::Relaxed);
    }

    pub fn record_watchdog(&self) {
        self.watchdogs_spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hook(&self, succeeded: bool) {
        self.hooks_run.fetch_add(1, Ordering::Relaxed);
        if !succeeded {
            self.hook_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> ShutdownSnapshot {
        let destroyed = self.containers_destroyed.load(Ordering::Relaxed);
        ShutdownSnapshot {
            containers_created: self.containers_created.load(Ordering::Relaxed),
            containers_destroyed: destroyed,
            avg_destroy_ms: avg_ms(destroyed, self.destroy_time_ns.load(Ordering::Relaxed)),
            mark_rounds: self.mark_rounds.load(Ordering::Relaxed),
            total_pause_ms: ns_to_ms(self.pause_time_ns.load(Ordering::Relaxed)),
            max_pause_ms: ns_to_ms(self.max_pause_ns.load(Ordering::Relaxed)),
            watchdogs_spawned: self.watchdogs_spawned.load(Ordering::Relaxed),
            hooks_run: self.hooks_run.load(Ordering::Relaxed),
            hook_failures: self.hook_failures.load(Ordering::Relaxed),
        }
    }

    /// Reset all metrics to zero
    pub fn reset(&self) {
        for counter in [
            &self.containers_created,
            &self.containers_destroyed,
            &self.destroy_time_ns,
            &self.mark_rounds,
            &self.pause_time_ns,
            &self.max_pause_ns,
            &self.watchdogs_spawned,
            &self.hooks_run,
            &self.hook_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

fn ns_to_ms(ns: u64) -> f64 {
    ns as f64 / 1_000_000.0
}

fn avg_ms(count: u64, total_ns: u64) -> f64 {
    if count == 0 {
        return 0.0;
    }
    ns_to_ms(total_ns) / count as f64
}

/// A point-in-time snapshot of [`ShutdownMetrics`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShutdownSnapshot {
    pub containers_created: u64,
    pub containers_destroyed: u64,
    pub avg_destroy_ms: f64,
    pub mark_rounds: u64,
    pub total_pause_ms: f64,
    pub max_pause_ms: f64,
    pub watchdogs_spawned: u64,
    pub hooks_run: u64,
    pub hook_failures: u64,
}

/// A scoped timer that records its duration on drop
pub struct ScopedTimer<'a> {
    start: Instant,
    metrics: &'a ShutdownMetrics,
    metric_type: TimerType,
}

pub enum TimerType {
    Destroy,
    MarkRound,
}

impl<'a> ScopedTimer<'a> {
    pub fn new(metrics: &'a ShutdownMetrics, metric_type: TimerType) -> Self {
        Self {
            start: Instant::now(),
            metrics,
            metric_type,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for ScopedTimer<'_> {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        match self.metric_type {
            TimerType::Destroy => self.metrics.record_destroy(duration),
            TimerType::MarkRound => self.metrics.record_mark_round(duration),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = ShutdownMetrics::new();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.containers_created, 0);
        assert_eq!(snapshot.avg_destroy_ms, 0.0);
    }

    #[test]
    fn test_record_destroy_average() {
        let metrics = ShutdownMetrics::new();
        metrics.record_destroy(Duration::from_millis(100));
        metrics.record_destroy(Duration::from_millis(200));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.containers_destroyed, 2);
        assert_eq!(snapshot.avg_destroy_ms, 150.0);
    }

    #[test]
    fn test_mark_rounds_track_max_pause() {
        let metrics = ShutdownMetrics::new();
        metrics.record_mark_round(Duration::from_millis(2));
        metrics.record_mark_round(Duration::from_millis(5));
        metrics.record_mark_round(Duration::from_millis(1));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.mark_rounds, 3);
        assert_eq!(snapshot.total_pause_ms, 8.0);
        assert_eq!(snapshot.max_pause_ms, 5.0);
    }

    #[test]
    fn test_hooks_and_reset() {
        let metrics = ShutdownMetrics::new();
        metrics.record_hook(true);
        metrics.record_hook(false);
        metrics.record_watchdog();
        assert_eq!(metrics.snapshot().hook_failures, 1);

        metrics.reset();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.hooks_run, 0);
        assert_eq!(snapshot.watchdogs_spawned, 0);
    }

    #[tokio::test]
    async fn test_scoped_timer() {
        let metrics = ShutdownMetrics::new();
        {
            let _timer = ScopedTimer::new(&metrics, TimerType::Destroy);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.containers_destroyed, 1);
        assert!(snapshot.avg_destroy_ms >= 10.0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = ShutdownMetrics::new();
        metrics.record_create();
        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        assert!(json.contains("\"containers_created\":1"));
    }
}
