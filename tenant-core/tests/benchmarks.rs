//! Performance benchmarks for Tenant Core.
//!
//! These tests measure timing for key operations and validate that
//! performance stays within acceptable bounds. Run with:
//!
//! ```sh
//! cargo test -p tenant-core --test benchmarks -- --ignored --nocapture
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use tenant_core::thread;
use tenant_core::{
    ShutdownSettings, TenantConfiguration, TenantFlags, TenantRuntime, TenantSettings,
};

fn bench_runtime() -> TenantRuntime {
    TenantRuntime::builder()
        .flags(TenantFlags::with_thread_stop())
        .settings(TenantSettings {
            shutdown: ShutdownSettings {
                kill_thread_interval: Duration::from_millis(1),
                ..Default::default()
            },
            ..Default::default()
        })
        .build()
        .unwrap()
}

// ---------------------------------------------------------------------------
// Container create/destroy benchmark
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn bench_container_create_destroy() {
    const ITERATIONS: usize = 1000;
    let rt = bench_runtime();

    let start = Instant::now();
    for _ in 0..ITERATIONS {
        let c = rt.create(TenantConfiguration::new()).unwrap();
        c.destroy().unwrap();
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / ITERATIONS as u32;

    let metrics = rt.metrics();
    eprintln!(
        "[bench_container_create_destroy] {ITERATIONS} iterations in {elapsed:?} ({per_iter:?}/iter)"
    );
    eprintln!("  avg_destroy_ms={:.3}", metrics.avg_destroy_ms);
    assert_eq!(metrics.containers_destroyed, ITERATIONS as u64);
    assert!(
        per_iter.as_millis() < 5,
        "create + destroy of an empty container should take < 5 ms, got {per_iter:?}"
    );
}

// ---------------------------------------------------------------------------
// Attach/detach benchmark
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn bench_run_attach_detach() {
    const ITERATIONS: usize = 100_000;
    let rt = bench_runtime();
    let c = rt.create(TenantConfiguration::new()).unwrap();

    let start = Instant::now();
    for i in 0..ITERATIONS {
        let value = c.run(|| i).unwrap();
        std::hint::black_box(value);
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / ITERATIONS as u32;

    eprintln!(
        "[bench_run_attach_detach] {ITERATIONS} run() calls in {elapsed:?} ({per_iter:?}/iter)"
    );
    assert!(
        elapsed.as_millis() < 2000,
        "100 000 attach/detach cycles should finish in < 2 s, got {elapsed:?}"
    );
}

// ---------------------------------------------------------------------------
// Check point benchmark
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn bench_checkpoint() {
    const ITERATIONS: usize = 1_000_000;

    let start = Instant::now();
    for _ in 0..ITERATIONS {
        thread::checkpoint().unwrap();
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / ITERATIONS as u32;

    eprintln!("[bench_checkpoint] {ITERATIONS} check points in {elapsed:?} ({per_iter:?}/iter)");
    assert!(
        per_iter.as_micros() < 1,
        "a check point should cost well under 1 µs, got {per_iter:?}"
    );
}

// ---------------------------------------------------------------------------
// Kill loop benchmark
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn bench_destroy_busy_workers() {
    const WORKERS: usize = 64;
    let rt = bench_runtime();
    let c = rt.create(TenantConfiguration::new()).unwrap();

    let handles: Vec<_> = (0..WORKERS)
        .map(|i| {
            c.spawn(format!("bench-{i}"), || {
                while thread::checkpoint().is_ok() {
                    std::hint::spin_loop();
                }
            })
            .unwrap()
        })
        .collect();
    while c.spawned_threads().len() < WORKERS {
        std::thread::sleep(Duration::from_millis(1));
    }

    let start = Instant::now();
    c.destroy().unwrap();
    let elapsed = start.elapsed();
    for handle in handles {
        handle.join().unwrap();
    }

    let metrics = rt.metrics();
    eprintln!("[bench_destroy_busy_workers] {WORKERS} workers terminated in {elapsed:?}");
    eprintln!(
        "  mark_rounds={}, total_pause_ms={:.3}, max_pause_ms={:.3}",
        metrics.mark_rounds, metrics.total_pause_ms, metrics.max_pause_ms
    );
    assert!(
        elapsed.as_millis() < 1000,
        "terminating {WORKERS} busy workers should finish in < 1 s, got {elapsed:?}"
    );
}

// ---------------------------------------------------------------------------
// Lookup benchmark
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn bench_lookup_by_id() {
    const CONTAINERS: usize = 100;
    const LOOKUPS: usize = 100_000;
    let rt = Arc::new(bench_runtime());
    let ids: Vec<u64> = (0..CONTAINERS)
        .map(|_| rt.create(TenantConfiguration::new()).unwrap().id())
        .collect();

    let start = Instant::now();
    for i in 0..LOOKUPS {
        let found = rt.get_by_id(ids[i % CONTAINERS]).unwrap();
        assert!(found.is_some());
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / LOOKUPS as u32;

    eprintln!("[bench_lookup_by_id] {LOOKUPS} lookups in {elapsed:?} ({per_iter:?}/iter)");
    assert!(
        elapsed.as_millis() < 1000,
        "100 000 lookups should finish in < 1 s, got {elapsed:?}"
    );
    assert_eq!(rt.shutdown().unwrap(), CONTAINERS);
}
