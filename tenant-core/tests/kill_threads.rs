//! Forced termination of tenant threads during destroy.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tenant_core::globals::TENANT_FLAG_THREAD_STOP_ENABLED;
use tenant_core::thread::{self, TenantJoinHandle};
use tenant_core::{
    ContainerState, DestroyOutcome, ShutdownSettings, TenantConfiguration, TenantContainer,
    TenantDeath, TenantFlags, TenantRuntime, TenantSettings, ThreadRecord,
};

fn runtime_with(shutdown: ShutdownSettings) -> TenantRuntime {
    TenantRuntime::builder()
        .flags(TenantFlags::with_thread_stop())
        .settings(TenantSettings {
            shutdown,
            ..Default::default()
        })
        .build()
        .unwrap()
}

fn fast_kill() -> ShutdownSettings {
    ShutdownSettings {
        kill_thread_interval: Duration::from_millis(1),
        ..Default::default()
    }
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Wait until `thread` has been admitted into `c`.
fn wait_admitted(c: &TenantContainer, thread: &ThreadRecord) {
    wait_until("thread to be admitted", || {
        c.spawned_threads().iter().any(|t| t.id() == thread.id())
    });
}

/// Started from inside the container, so it joins it by inheritance.
fn busy_worker(i: usize, spins: Arc<AtomicU64>) -> TenantJoinHandle<()> {
    thread::Builder::new()
        .name(format!("busy-{i}"))
        .spawn(move || {
            while thread::checkpoint().is_ok() {
                spins.fetch_add(1, Ordering::Relaxed);
                std::hint::spin_loop();
            }
        })
        .unwrap()
}

/// A worker that masks itself and stays masked until `release` is set.
fn masked_worker(
    c: &TenantContainer,
    release: &Arc<AtomicBool>,
) -> TenantJoinHandle<Result<(), TenantDeath>> {
    let release = Arc::clone(release);
    let handle = c
        .spawn("masked", move || {
            let guard = thread::mask();
            while !release.load(Ordering::SeqCst) {
                // Check points inside a masked region never fail.
                thread::checkpoint().expect("masked checkpoint");
                std::thread::sleep(Duration::from_millis(1));
            }
            guard.unmask()
        })
        .unwrap();
    let record = Arc::clone(handle.record());
    wait_until("worker to mask", || record.is_masked());
    handle
}

#[test]
fn test_busy_workers_all_terminated() {
    let rt = runtime_with(fast_kill());
    let c = rt.create(TenantConfiguration::new()).unwrap();
    let spins = Arc::new(AtomicU64::new(0));
    let workers: Vec<_> = c
        .run(|| {
            (0..10)
                .map(|i| busy_worker(i, Arc::clone(&spins)))
                .collect::<Vec<_>>()
        })
        .unwrap();

    wait_until("workers to start", || c.spawned_threads().len() == 10);
    for worker in &workers {
        assert!(c.spawned_threads().iter().any(|t| t.id() == worker.record().id()));
    }
    assert_eq!(c.destroy().unwrap(), DestroyOutcome::Destroyed);
    assert_eq!(c.state(), ContainerState::Dead);

    for worker in workers {
        assert!(worker.is_terminated());
        worker.join().unwrap();
    }
    assert!(spins.load(Ordering::Relaxed) > 0);
    assert!(rt.metrics().mark_rounds >= 1);
}

#[test]
fn test_tiny_budget_defers_to_watchdog() {
    let rt = runtime_with(ShutdownSettings {
        kill_thread_interval: Duration::from_millis(1),
        wall_clock_soft_limit: Some(Duration::from_millis(1)),
        ..Default::default()
    });
    let c = rt.create(TenantConfiguration::new()).unwrap();
    let release = Arc::new(AtomicBool::new(false));
    let workers: Vec<_> = (0..3).map(|_| masked_worker(&c, &release)).collect();

    assert_eq!(c.destroy().unwrap(), DestroyOutcome::Deferred);
    assert_eq!(c.state(), ContainerState::Dead);
    for worker in &workers {
        assert!(worker.record().is_marked_for_destroy());
        assert!(!worker.is_terminated());
    }

    release.store(true, Ordering::SeqCst);
    let report = c.join_watchdog().expect("watchdog report");
    assert_eq!(report.container_id, c.id());
    assert_eq!(report.handed_over, 3);
    for worker in workers {
        assert_eq!(worker.join().unwrap(), Err(TenantDeath));
    }
    assert_eq!(rt.metrics().watchdogs_spawned, 1);
}

#[test]
fn test_mask_defers_termination_until_unmask() {
    let rt = runtime_with(fast_kill());
    let c = rt.create(TenantConfiguration::new()).unwrap();
    let release = Arc::new(AtomicBool::new(false));
    let worker = masked_worker(&c, &release);
    let record = Arc::clone(worker.record());

    let destroyer = {
        let c = c.clone();
        std::thread::spawn(move || c.destroy().unwrap())
    };

    wait_until("mark to be requested", || record.is_marked_for_destroy());
    std::thread::sleep(Duration::from_millis(20));
    assert!(!record.is_terminated());
    assert_eq!(c.state(), ContainerState::Stopping);

    release.store(true, Ordering::SeqCst);
    assert_eq!(destroyer.join().unwrap(), DestroyOutcome::Destroyed);
    assert_eq!(worker.join().unwrap(), Err(TenantDeath));
}

#[test]
fn test_parked_threads_are_woken() {
    let rt = runtime_with(fast_kill());
    let c = rt.create(TenantConfiguration::new()).unwrap();
    let parked = c
        .spawn("parked", || -> Result<(), TenantDeath> {
            loop {
                thread::park()?;
            }
        })
        .unwrap();
    let sleeping = c
        .spawn("sleeping", || thread::sleep(Duration::from_secs(60)))
        .unwrap();

    let (p, s) = (Arc::clone(parked.record()), Arc::clone(sleeping.record()));
    wait_until("threads to block", || {
        p.run_state().is_waiting() && s.run_state().is_waiting()
    });

    let started = Instant::now();
    assert_eq!(c.destroy().unwrap(), DestroyOutcome::Destroyed);
    assert!(started.elapsed() < Duration::from_secs(30));

    assert_eq!(parked.join().unwrap(), Err(TenantDeath));
    assert_eq!(sleeping.join().unwrap(), Err(TenantDeath));
}

#[test]
fn test_blocking_syscall_interrupted() {
    let rt = runtime_with(fast_kill());
    let c = rt.create(TenantConfiguration::new()).unwrap();

    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: fds has room for two descriptors.
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let read_fd = fds[0];

    let reader = c
        .spawn("reader", move || -> Result<(), TenantDeath> {
            let mut buf = [0u8; 8];
            loop {
                // SAFETY: buf is valid for buf.len() bytes and read_fd stays
                // open until the reader is joined.
                let n = unsafe { libc::read(read_fd, buf.as_mut_ptr().cast(), buf.len()) };
                if n < 0 {
                    thread::checkpoint()?;
                }
            }
        })
        .unwrap();
    let record = Arc::clone(reader.record());
    wait_admitted(&c, &record);

    assert_eq!(c.destroy().unwrap(), DestroyOutcome::Destroyed);
    assert_eq!(reader.join().unwrap(), Err(TenantDeath));

    // SAFETY: both descriptors came from pipe() above.
    unsafe {
        libc::close(fds[0]);
        libc::close(fds[1]);
    }
}

#[test]
fn test_service_thread_is_terminated() {
    let rt = runtime_with(fast_kill());
    let c = rt.create(TenantConfiguration::new()).unwrap();
    let service = c
        .spawn_service("service", || -> Result<(), TenantDeath> {
            loop {
                thread::park_timeout(Duration::from_millis(5))?;
            }
        })
        .unwrap();
    let record = Arc::clone(service.record());
    wait_admitted(&c, &record);

    assert_eq!(c.destroy().unwrap(), DestroyOutcome::Destroyed);
    assert_eq!(service.join().unwrap(), Err(TenantDeath));
}

#[test]
fn test_thread_stop_disabled_leaves_threads_alone() {
    let rt = TenantRuntime::builder()
        .flags(TenantFlags::with_thread_stop().without(TENANT_FLAG_THREAD_STOP_ENABLED))
        .build()
        .unwrap();
    let c = rt.create(TenantConfiguration::new()).unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    let worker = c
        .spawn("survivor", move || -> Result<(), TenantDeath> {
            while !flag.load(Ordering::SeqCst) {
                thread::checkpoint()?;
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        })
        .unwrap();
    let record = Arc::clone(worker.record());
    wait_admitted(&c, &record);

    assert_eq!(c.destroy().unwrap(), DestroyOutcome::Destroyed);
    assert!(!record.is_marked_for_destroy());

    stop.store(true, Ordering::SeqCst);
    assert_eq!(worker.join().unwrap(), Ok(()));
}
