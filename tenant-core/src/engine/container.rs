//! Tenant containers
//!
//! A [`TenantContainer`] groups threads, resource limits and shutdown
//! behavior. Its state only moves forward:
//!
//! ```text
//! Starting ──first attach──▶ Running ──destroy()──▶ Stopping ──▶ Dead
//! ```
//!
//! # Locking
//!
//! `destroy_lock` is the admission gate between new threads and teardown.
//! Threads entering through `run_thread` take a read permit without
//! blocking; `destroy()` holds the write permit for the whole teardown, so
//! no thread can start running inside a container that is being destroyed.
//! All bookkeeping sets sit behind their own mutexes and only hold `Weak`
//! references to threads.

use crate::config::TenantSettings;
use crate::engine::group::Group;
use crate::engine::hooks::{HookId, ShutdownHooks};
use crate::engine::kill::{KillLoop, KillOutcome, WatchdogReport};
use crate::engine::resource_limits::TenantConfiguration;
use crate::engine::thread::{Builder, JoinError, TenantJoinHandle, ThreadRecord};
use crate::error::{Result, TenantError};
use crate::management::ContainerStats;
use crate::perf::{ScopedTimer, TimerType};
use crate::runtime::{RuntimeInner, TenantRuntime};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(u8)]
pub enum ContainerState {
    Starting = 0,
    Running = 1,
    Stopping = 2,
    Dead = 3,
}

impl ContainerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Starting,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Dead,
        }
    }

    /// Starting or Running.
    pub fn is_alive(self) -> bool {
        self < Self::Stopping
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Dead => "DEAD",
        };
        f.write_str(s)
    }
}

/// How a `destroy()` call ended. The container is `Dead` in every case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DestroyOutcome {
    /// Every thread terminated and all resources were released.
    Destroyed,
    /// A watchdog is still terminating threads and will release resources.
    Deferred,
    /// Another call already destroyed the container.
    AlreadyDestroyed,
}

/// A resource owned by a tenant and released when the tenant is destroyed.
pub trait TenantResource: Send + Sync {
    fn dispose(&self);
}

thread_local! {
    static CURRENT_CONTAINER: RefCell<Option<TenantContainer>> = const { RefCell::new(None) };
}

/// Container the calling thread runs in, `None` for the root context.
pub(crate) fn current() -> Option<TenantContainer> {
    CURRENT_CONTAINER
        .try_with(|slot| slot.borrow().clone())
        .ok()
        .flatten()
}

/// Swap the calling thread's container, returning the previous one.
pub(crate) fn replace_current(container: Option<TenantContainer>) -> Option<TenantContainer> {
    CURRENT_CONTAINER
        .try_with(|slot| slot.replace(container))
        .ok()
        .flatten()
}

/// Restores the calling thread's previous container on drop.
pub(crate) struct RestoreCurrent(pub(crate) Option<TenantContainer>);

impl Drop for RestoreCurrent {
    fn drop(&mut self) {
        replace_current(self.0.take());
    }
}

#[derive(Default)]
struct Bookkeeping {
    attached: Vec<Arc<ThreadRecord>>,
    /// Usage of detached threads, minus attach-time readings of attached ones.
    accumulated_usage: i128,
}

type Finalizer = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct ContainerInner {
    id: u64,
    name: String,
    runtime: Arc<RuntimeInner>,
    state: AtomicU8,
    configuration: Mutex<TenantConfiguration>,
    parent: Mutex<Option<Weak<ContainerInner>>>,
    group: Mutex<Option<Box<dyn Group>>>,
    destroy_lock: RwLock<()>,
    destroy_begin: Mutex<Option<Instant>>,
    book: Mutex<Bookkeeping>,
    spawned: Mutex<Vec<Weak<ThreadRecord>>>,
    service: Mutex<Vec<Weak<ThreadRecord>>>,
    hooks: Mutex<Option<ShutdownHooks>>,
    finalizers: Mutex<Vec<Finalizer>>,
    resources: Mutex<Vec<Weak<dyn TenantResource>>>,
    properties: Mutex<HashMap<String, String>>,
    stacks_dumped: AtomicBool,
    watchdog: Mutex<Option<JoinHandle<WatchdogReport>>>,
}

/// Handle to a tenant container. Cloning is cheap and every clone refers
/// to the same container.
#[derive(Clone)]
pub struct TenantContainer {
    inner: Arc<ContainerInner>,
}

impl TenantContainer {
    pub(crate) fn new(
        runtime: Arc<RuntimeInner>,
        id: u64,
        name: String,
        configuration: TenantConfiguration,
        parent: Option<&TenantContainer>,
        group: Option<Box<dyn Group>>,
    ) -> Self {
        Self {
            inner: Arc::new(ContainerInner {
                id,
                name,
                runtime,
                state: AtomicU8::new(ContainerState::Starting as u8),
                configuration: Mutex::new(configuration),
                parent: Mutex::new(parent.map(|p| Arc::downgrade(&p.inner))),
                group: Mutex::new(group),
                destroy_lock: RwLock::new(()),
                destroy_begin: Mutex::new(None),
                book: Mutex::new(Bookkeeping::default()),
                spawned: Mutex::new(Vec::new()),
                service: Mutex::new(Vec::new()),
                hooks: Mutex::new(Some(ShutdownHooks::new())),
                finalizers: Mutex::new(Vec::new()),
                resources: Mutex::new(Vec::new()),
                properties: Mutex::new(HashMap::new()),
                stacks_dumped: AtomicBool::new(false),
                watchdog: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> ContainerState {
        ContainerState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    fn advance_state(&self, state: ContainerState) {
        self.inner.state.fetch_max(state as u8, Ordering::SeqCst);
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.state().is_alive() {
            Ok(())
        } else {
            Err(TenantError::ContainerDead { id: self.id() })
        }
    }

    /// Container this one was created from, while it is still reachable.
    pub fn parent(&self) -> Option<TenantContainer> {
        self.inner
            .parent
            .lock()
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| TenantContainer { inner })
    }

    /// Snapshot of the current limits.
    pub fn configuration(&self) -> TenantConfiguration {
        self.inner.configuration.lock().clone()
    }

    pub fn runtime(&self) -> TenantRuntime {
        TenantRuntime::from_inner(Arc::clone(&self.inner.runtime))
    }

    pub(crate) fn runtime_settings(&self) -> &TenantSettings {
        &self.inner.runtime.settings
    }

    // ── attach / detach ───────────────────────────────────────────────

    /// Run `task` on the calling thread inside this container.
    ///
    /// A thread already inside this container runs the task inline. A
    /// thread inside another container is rejected with
    /// [`TenantError::IllegalNesting`]. Otherwise the thread is attached for
    /// the duration of the task and detached afterwards, even if the task
    /// panics.
    pub fn run<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce() -> T,
    {
        self.ensure_alive()?;
        match current() {
            Some(current) if current == *self => return Ok(task()),
            Some(current) => {
                return Err(TenantError::IllegalNesting {
                    current: current.id(),
                    target: self.id(),
                })
            }
            None => {}
        }
        let _attached = self.attach(ThreadRecord::current());
        Ok(task())
    }

    fn attach(&self, record: Arc<ThreadRecord>) -> AttachGuard<'_> {
        {
            let meter = &self.inner.runtime.meter;
            let mut book = self.inner.book.lock();
            book.accumulated_usage -= i128::from(meter.thread_usage(&record));
            book.attached.push(Arc::clone(&record));
        }
        let _ = self.inner.state.compare_exchange(
            ContainerState::Starting as u8,
            ContainerState::Running as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if let Some(group) = self.inner.group.lock().as_ref() {
            if let Err(err) = group.attach(&record) {
                warn!(container_id = self.id(), thread_id = record.id(), error = %err, "Failed to move thread into group");
            }
        }
        let previous = replace_current(Some(self.clone()));
        debug!(container_id = self.id(), thread_id = record.id(), "Attached thread");
        AttachGuard {
            container: self,
            record,
            previous,
        }
    }

    fn detach(&self, record: &ThreadRecord) {
        if let Some(group) = self.inner.group.lock().as_ref() {
            if let Err(err) = group.detach(record) {
                warn!(container_id = self.id(), thread_id = record.id(), error = %err, "Failed to move thread out of group");
            }
        }
        let meter = &self.inner.runtime.meter;
        let mut book = self.inner.book.lock();
        book.accumulated_usage += i128::from(meter.thread_usage(record));
        if let Some(pos) = book.attached.iter().position(|r| ptr::eq(r.as_ref(), record)) {
            book.attached.swap_remove(pos);
        }
        debug!(container_id = self.id(), thread_id = record.id(), "Detached thread");
    }

    /// Entry point of a thread that lives inside this container for its
    /// whole run. Returns `None` when the thread was not admitted.
    pub(crate) fn run_thread<F, T>(&self, record: &Arc<ThreadRecord>, f: F) -> Option<T>
    where
        F: FnOnce() -> T,
    {
        match self.inner.destroy_lock.try_read() {
            Some(permit) => {
                if !self.state().is_alive() {
                    debug!(container_id = self.id(), thread_id = record.id(), "Container is dead, thread not started");
                    return None;
                }
                self.inner.spawned.lock().push(Arc::downgrade(record));
                let result = self.run(move || {
                    drop(permit);
                    f()
                });
                self.inner
                    .spawned
                    .lock()
                    .retain(|w| !ptr::eq(w.as_ptr(), Arc::as_ptr(record)) && is_live(w));
                match result {
                    Ok(value) => Some(value),
                    Err(err) => {
                        warn!(container_id = self.id(), thread_id = record.id(), error = %err, "Thread rejected");
                        None
                    }
                }
            }
            None if self.is_service_thread(record) => {
                debug!(container_id = self.id(), thread_id = record.id(), "Running service thread during destroy");
                // Current for the body, but never attached.
                let value = {
                    let _restore = RestoreCurrent(replace_current(Some(self.clone())));
                    f()
                };
                self.inner
                    .service
                    .lock()
                    .retain(|w| !ptr::eq(w.as_ptr(), Arc::as_ptr(record)));
                Some(value)
            }
            None => {
                debug!(container_id = self.id(), thread_id = record.id(), "Destroy in progress, thread not started");
                None
            }
        }
    }

    pub(crate) fn register_service_thread(&self, record: &Arc<ThreadRecord>) {
        let mut service = self.inner.service.lock();
        service.retain(is_live);
        service.push(Arc::downgrade(record));
    }

    fn is_service_thread(&self, record: &Arc<ThreadRecord>) -> bool {
        self.inner
            .service
            .lock()
            .iter()
            .any(|w| ptr::eq(w.as_ptr(), Arc::as_ptr(record)))
    }

    /// Start a thread that runs inside this container.
    pub fn spawn<F, T>(&self, name: impl Into<String>, f: F) -> Result<TenantJoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        Builder::new().name(name).container(self.clone()).spawn(f)
    }

    /// Start a service thread: tracked like any other thread, but still
    /// admitted (untracked) while the container is being destroyed.
    pub fn spawn_service<F, T>(&self, name: impl Into<String>, f: F) -> Result<TenantJoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        Builder::new().name(name).service(self.clone()).spawn(f)
    }

    /// Threads currently running inside this container.
    pub fn attached_threads(&self) -> Vec<Arc<ThreadRecord>> {
        self.inner.book.lock().attached.clone()
    }

    /// Live threads started inside this container.
    pub fn spawned_threads(&self) -> Vec<Arc<ThreadRecord>> {
        self.inner
            .spawned
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|t| !t.is_terminated())
            .collect()
    }

    /// Usage of every thread while it ran inside this container, in
    /// nanoseconds of the runtime's [`UsageMeter`](crate::UsageMeter).
    pub fn accumulated_usage(&self) -> u64 {
        let meter = &self.inner.runtime.meter;
        let book = self.inner.book.lock();
        let live: i128 = book
            .attached
            .iter()
            .map(|t| i128::from(meter.thread_usage(t)))
            .sum();
        (book.accumulated_usage + live).clamp(0, i128::from(u64::MAX)) as u64
    }

    // ── limits ────────────────────────────────────────────────────────

    /// Apply new limits.
    ///
    /// Every limit is validated before anything is applied, so an invalid
    /// limit changes nothing. Controller-backed limits are then pushed to
    /// the group and stored once the push succeeds. A limit whose push fails
    /// is logged and skipped, the remaining limits are still applied, and
    /// the first failure is returned. Other limits, or any limit while no
    /// group exists, are only stored.
    pub fn update(&self, config: &TenantConfiguration) -> Result<()> {
        self.ensure_alive()?;
        for limit in config.limits() {
            limit.validate()?;
        }
        let group = self.inner.group.lock();
        let mut current = self.inner.configuration.lock();
        let mut first_error = None;
        for limit in config.limits() {
            let kind = limit.resource_type();
            match group.as_ref() {
                Some(group) if kind.is_controller_backed() => {
                    if let Err(err) = limit.sync(&**group) {
                        warn!(container_id = self.id(), resource = %kind, error = %err, "Failed to apply limit, keeping the old one");
                        first_error.get_or_insert(err);
                        continue;
                    }
                }
                _ => debug!(container_id = self.id(), resource = %kind, "Limit stored without live effect"),
            }
            current.set_limit(limit.clone())?;
        }
        first_error.map_or(Ok(()), Err)
    }

    /// CPU time of the container's group, in nanoseconds.
    pub fn cpu_time(&self) -> Result<u64> {
        if !self.inner.runtime.flags.is_cpu_accounting_enabled() {
            return Err(TenantError::FeatureDisabled(
                "CPU accounting is not enabled".to_string(),
            ));
        }
        match self.inner.group.lock().as_ref() {
            Some(group) => group.cpu_time(),
            None => Err(TenantError::ContainerDead { id: self.id() }),
        }
    }

    /// Heap isolation is not provided by this crate.
    pub fn occupied_memory(&self) -> Result<u64> {
        Err(TenantError::FeatureDisabled(
            "heap isolation is not available".to_string(),
        ))
    }

    // ── hooks, finalizers, resources, properties ──────────────────────

    pub fn add_shutdown_hook<F>(&self, hook: F) -> Result<HookId>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.inner.hooks.lock().as_mut() {
            Some(hooks) => hooks.add(Box::new(hook)),
            None => Err(TenantError::IllegalState("shutdown in progress".to_string())),
        }
    }

    pub fn remove_shutdown_hook(&self, id: HookId) -> Result<bool> {
        match self.inner.hooks.lock().as_mut() {
            Some(hooks) => hooks.remove(id),
            None => Err(TenantError::IllegalState("shutdown in progress".to_string())),
        }
    }

    /// Register cleanup that runs during destroy, inside the container.
    pub fn register_finalizer<F>(&self, finalizer: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.ensure_alive()?;
        self.inner.finalizers.lock().push(Box::new(finalizer));
        Ok(())
    }

    /// Dispose `resource` when the container is destroyed, if it is still
    /// alive then. Only a weak reference is kept.
    pub fn link_resource(&self, resource: &Arc<dyn TenantResource>) -> Result<()> {
        self.ensure_alive()?;
        let mut resources = self.inner.resources.lock();
        resources.retain(|w| w.strong_count() > 0);
        resources.push(Arc::downgrade(resource));
        Ok(())
    }

    pub fn set_property(&self, key: &str, value: impl Into<String>) -> Result<Option<String>> {
        check_key(key)?;
        Ok(self.inner.properties.lock().insert(key.to_string(), value.into()))
    }

    pub fn property(&self, key: &str) -> Option<String> {
        self.inner.properties.lock().get(key).cloned()
    }

    pub fn clear_property(&self, key: &str) -> Result<Option<String>> {
        check_key(key)?;
        Ok(self.inner.properties.lock().remove(key))
    }

    /// Replace all properties; `None` copies the process environment.
    pub fn set_properties(&self, properties: Option<HashMap<String, String>>) {
        let properties = properties.unwrap_or_else(|| std::env::vars().collect());
        *self.inner.properties.lock() = properties;
    }

    pub fn properties(&self) -> HashMap<String, String> {
        self.inner.properties.lock().clone()
    }

    pub fn stats(&self) -> ContainerStats {
        ContainerStats {
            id: self.id(),
            name: self.name().to_string(),
            state: self.state(),
            attached_threads: self.inner.book.lock().attached.len(),
            live_spawned_threads: self.spawned_threads().len(),
            accumulated_usage: self.accumulated_usage(),
            cpu_time: self.cpu_time().ok(),
        }
    }

    // ── destroy ───────────────────────────────────────────────────────

    /// Tear the container down.
    ///
    /// Must be called from the root context. Runs finalizers and shutdown
    /// hooks, terminates every thread started inside the container (when
    /// thread stop is enabled) and releases the group. The container ends up
    /// `Dead` whatever happens on the way; failures are logged, not returned.
    pub fn destroy(&self) -> Result<DestroyOutcome> {
        if let Some(current) = current() {
            return Err(TenantError::IllegalState(format!(
                "destroy of tenant {} called from inside tenant {}, must be called from the root context",
                self.id(),
                current.id()
            )));
        }

        let _writer = self.inner.destroy_lock.write();
        if !self.state().is_alive() {
            debug!(container_id = self.id(), "Container already destroyed");
            return Ok(DestroyOutcome::AlreadyDestroyed);
        }

        let timer = ScopedTimer::new(&self.inner.runtime.metrics, TimerType::Destroy);
        info!(container_id = self.id(), name = self.name(), "Destroying tenant container");
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.destroy_locked())) {
            Ok(outcome) => outcome,
            Err(payload) => {
                error!(
                    container_id = self.id(),
                    panic = panic_message(payload.as_ref()),
                    "Destroy failed, forcing container to DEAD"
                );
                DestroyOutcome::Destroyed
            }
        };
        self.advance_state(ContainerState::Dead);
        info!(
            container_id = self.id(),
            outcome = ?outcome,
            elapsed_ms = timer.elapsed().as_millis() as u64,
            "Tenant container destroyed"
        );
        Ok(outcome)
    }

    /// [`destroy`](Self::destroy) on the blocking pool, for async callers.
    pub async fn destroy_async(&self) -> Result<DestroyOutcome> {
        let container = self.clone();
        tokio::task::spawn_blocking(move || container.destroy())
            .await
            .map_err(|e| TenantError::IllegalState(format!("destroy task failed: {e}")))?
    }

    /// Wait for the watchdog of a deferred destroy.
    pub fn join_watchdog(&self) -> Option<WatchdogReport> {
        let handle = self.inner.watchdog.lock().take()?;
        match handle.join() {
            Ok(report) => Some(report),
            Err(payload) => {
                error!(container_id = self.id(), panic = panic_message(payload.as_ref()), "Watchdog panicked");
                None
            }
        }
    }

    fn destroy_locked(&self) -> DestroyOutcome {
        let runtime = &self.inner.runtime;
        *self.inner.destroy_begin.lock() = Some(Instant::now());
        self.advance_state(ContainerState::Stopping);
        runtime.unregister(self.id());

        self.run_finalizers();
        self.run_shutdown_hooks();

        if !runtime.flags.is_thread_stop_enabled() {
            self.cleanup();
            return DestroyOutcome::Destroyed;
        }

        let mut targets = std::mem::take(&mut *self.inner.spawned.lock());
        targets.extend(self.inner.service.lock().drain(..));
        let result = self.kill_loop().run(targets, true);
        match result.outcome {
            KillOutcome::FullSuccess => {
                self.cleanup();
                DestroyOutcome::Destroyed
            }
            KillOutcome::PartialSuccess => self.spawn_watchdog(result.remaining),
        }
    }

    fn kill_loop(&self) -> KillLoop<'_> {
        let runtime = &self.inner.runtime;
        KillLoop {
            control: runtime.control.as_ref(),
            settings: &runtime.settings.shutdown,
            metrics: &runtime.metrics,
            container_id: self.id(),
            destroy_begin: (*self.inner.destroy_begin.lock()).unwrap_or_else(Instant::now),
            stacks_dumped: &self.inner.stacks_dumped,
        }
    }

    fn run_finalizers(&self) {
        let finalizers = std::mem::take(&mut *self.inner.finalizers.lock());
        if finalizers.is_empty() {
            return;
        }
        let _restore = RestoreCurrent(replace_current(Some(self.clone())));
        for finalizer in finalizers {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(finalizer)) {
                warn!(container_id = self.id(), panic = panic_message(payload.as_ref()), "Tenant finalizer panicked");
            }
        }
    }

    fn run_shutdown_hooks(&self) {
        let hooks = match self.inner.hooks.lock().as_mut() {
            Some(hooks) => hooks.drain(),
            None => return,
        };
        let metrics = &self.inner.runtime.metrics;

        let mut running = Vec::with_capacity(hooks.len());
        for (id, hook) in hooks {
            let name = format!("{}-hook-{}", self.name(), id);
            match Builder::new().name(name).service(self.clone()).spawn(hook) {
                Ok(handle) => running.push((id, handle)),
                Err(err) => {
                    warn!(container_id = self.id(), hook_id = %id, error = %err, "Failed to start shutdown hook");
                    metrics.record_hook(false);
                }
            }
        }

        for (id, handle) in running {
            let succeeded = match handle.join() {
                Ok(()) => true,
                Err(JoinError::Panicked(payload)) => {
                    warn!(container_id = self.id(), hook_id = %id, panic = panic_message(payload.as_ref()), "Shutdown hook panicked");
                    false
                }
                Err(JoinError::Rejected) => {
                    warn!(container_id = self.id(), hook_id = %id, "Shutdown hook was not admitted");
                    false
                }
            };
            metrics.record_hook(succeeded);
        }
    }

    fn spawn_watchdog(&self, remaining: Vec<Weak<ThreadRecord>>) -> DestroyOutcome {
        let handed_over = remaining.len();
        let fallback = remaining.clone();
        let container = self.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("WatchDog-{}", self.name()))
            .spawn(move || container.watchdog_main(remaining, handed_over));

        match spawned {
            Ok(handle) => {
                self.inner.runtime.metrics.record_watchdog();
                info!(container_id = self.id(), remaining = handed_over, "Spawned watchdog");
                *self.inner.watchdog.lock() = Some(handle);
                DestroyOutcome::Deferred
            }
            Err(err) => {
                error!(container_id = self.id(), error = %err, "Failed to spawn watchdog, terminating synchronously");
                self.kill_loop().run(fallback, false);
                self.cleanup();
                DestroyOutcome::Destroyed
            }
        }
    }

    fn watchdog_main(self, remaining: Vec<Weak<ThreadRecord>>, handed_over: usize) -> WatchdogReport {
        let result = self.kill_loop().run(remaining, false);
        self.cleanup();
        info!(
            container_id = self.id(),
            tries = result.stats.tries,
            elapsed_ms = result.stats.elapsed.as_millis() as u64,
            "Watchdog finished"
        );
        WatchdogReport {
            container_id: self.id(),
            name: self.name().to_string(),
            handed_over,
            stats: result.stats,
        }
    }

    /// Release everything the container still owns.
    fn cleanup(&self) {
        if let Some(group) = self.inner.group.lock().take() {
            if let Err(err) = group.destroy() {
                warn!(container_id = self.id(), error = %err, "Failed to destroy group");
            }
        }

        if self.inner.runtime.flags.is_thread_stop_enabled() {
            let resources = std::mem::take(&mut *self.inner.resources.lock());
            let mut disposed = 0usize;
            for resource in resources.iter().filter_map(Weak::upgrade) {
                match panic::catch_unwind(AssertUnwindSafe(|| resource.dispose())) {
                    Ok(()) => disposed += 1,
                    Err(payload) => {
                        warn!(container_id = self.id(), panic = panic_message(payload.as_ref()), "Resource dispose panicked")
                    }
                }
            }
            debug!(container_id = self.id(), disposed, "Disposed tenant resources");
        }

        self.inner.book.lock().attached.clear();
        self.inner.spawned.lock().clear();
        self.inner.service.lock().clear();
        self.inner.hooks.lock().take();
        self.inner.parent.lock().take();
    }
}

struct AttachGuard<'a> {
    container: &'a TenantContainer,
    record: Arc<ThreadRecord>,
    previous: Option<TenantContainer>,
}

impl Drop for AttachGuard<'_> {
    fn drop(&mut self) {
        self.container.detach(&self.record);
        replace_current(self.previous.take());
    }
}

impl PartialEq for TenantContainer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for TenantContainer {}

impl fmt::Debug for TenantContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantContainer")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

fn is_live(thread: &Weak<ThreadRecord>) -> bool {
    thread.upgrade().map_or(false, |t| !t.is_terminated())
}

fn check_key(key: &str) -> Result<()> {
    if key.is_empty() {
        Err(TenantError::IllegalArgument("property key is empty".to_string()))
    } else {
        Ok(())
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::thread;
    use crate::globals::TenantFlags;
    use std::sync::atomic::AtomicUsize;

    fn runtime() -> TenantRuntime {
        TenantRuntime::builder()
            .flags(TenantFlags::with_thread_stop())
            .build()
            .unwrap()
    }

    #[test]
    fn test_first_attach_moves_to_running() {
        let rt = runtime();
        let c = rt.create(TenantConfiguration::new()).unwrap();
        assert_eq!(c.state(), ContainerState::Starting);
        let inside = c.run(|| current().map(|t| t.id())).unwrap();
        assert_eq!(inside, Some(c.id()));
        assert_eq!(c.state(), ContainerState::Running);
        assert!(current().is_none());
        assert!(c.attached_threads().is_empty());
    }

    #[test]
    fn test_run_inline_when_already_inside() {
        let rt = runtime();
        let c = rt.create(TenantConfiguration::new()).unwrap();
        let depth = c
            .run(|| c.run(|| c.attached_threads().len()).unwrap())
            .unwrap();
        assert_eq!(depth, 1);
    }

    #[test]
    fn test_run_detaches_on_panic() {
        let rt = runtime();
        let c = rt.create(TenantConfiguration::new()).unwrap();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let _ = c.run(|| panic!("task failed"));
        }));
        assert!(result.is_err());
        assert!(c.attached_threads().is_empty());
        assert!(current().is_none());
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let rt = runtime();
        let c = rt.create(TenantConfiguration::new()).unwrap();
        assert_eq!(c.destroy().unwrap(), DestroyOutcome::Destroyed);
        assert_eq!(c.state(), ContainerState::Dead);
        assert_eq!(c.destroy().unwrap(), DestroyOutcome::AlreadyDestroyed);
        assert_eq!(c.state(), ContainerState::Dead);
        assert!(matches!(c.run(|| ()), Err(TenantError::ContainerDead { .. })));
    }

    #[test]
    fn test_destroy_from_inside_is_rejected() {
        let rt = runtime();
        let c = rt.create(TenantConfiguration::new()).unwrap();
        let result = c.run(|| c.destroy()).unwrap();
        assert!(matches!(result, Err(TenantError::IllegalState(_))));
        assert!(c.state().is_alive());
    }

    #[test]
    fn test_hooks_sealed_after_destroy() {
        let rt = runtime();
        let c = rt.create(TenantConfiguration::new()).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let id = c
            .add_shutdown_hook(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        c.destroy().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(matches!(c.add_shutdown_hook(|| {}), Err(TenantError::IllegalState(_))));
        assert!(matches!(c.remove_shutdown_hook(id), Err(TenantError::IllegalState(_))));
    }

    #[test]
    fn test_finalizer_runs_inside_container() {
        let rt = runtime();
        let c = rt.create(TenantConfiguration::new()).unwrap();
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        c.register_finalizer(move || {
            *slot.lock() = current().map(|t| t.id());
        })
        .unwrap();
        c.register_finalizer(|| panic!("bad finalizer")).unwrap();
        c.destroy().unwrap();
        assert_eq!(*seen.lock(), Some(c.id()));
        assert!(current().is_none());
    }

    struct Flagged(AtomicBool);

    impl TenantResource for Flagged {
        fn dispose(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_linked_resource_disposed() {
        let rt = runtime();
        let c = rt.create(TenantConfiguration::new()).unwrap();
        let flagged = Arc::new(Flagged(AtomicBool::new(false)));
        let resource: Arc<dyn TenantResource> = flagged.clone();
        c.link_resource(&resource).unwrap();
        c.destroy().unwrap();
        assert!(flagged.0.load(Ordering::SeqCst));
    }

    #[test]
    fn test_properties() {
        let rt = runtime();
        let c = rt.create(TenantConfiguration::new()).unwrap();
        assert_eq!(c.set_property("k", "v").unwrap(), None);
        assert_eq!(c.property("k").as_deref(), Some("v"));
        assert_eq!(c.clear_property("k").unwrap().as_deref(), Some("v"));
        assert!(c.set_property("", "v").is_err());

        c.set_properties(Some(HashMap::from([("a".to_string(), "1".to_string())])));
        assert_eq!(c.properties().len(), 1);
    }

    #[test]
    fn test_spawned_thread_runs_inside() {
        let rt = runtime();
        let c = rt.create(TenantConfiguration::new()).unwrap();
        let handle = c.spawn("worker", || current().map(|t| t.id())).unwrap();
        assert_eq!(handle.join().unwrap(), Some(c.id()));
    }

    #[test]
    fn test_inherited_spawn() {
        let rt = runtime();
        let c = rt.create(TenantConfiguration::new()).unwrap();
        let handle = c
            .run(|| thread::spawn(|| current().map(|t| t.id())))
            .unwrap()
            .unwrap();
        assert_eq!(handle.join().unwrap(), Some(c.id()));
    }

    #[test]
    fn test_spawn_after_destroy_is_rejected() {
        let rt = runtime();
        let c = rt.create(TenantConfiguration::new()).unwrap();
        c.destroy().unwrap();
        let handle = c.spawn("late", || ()).unwrap();
        assert!(matches!(handle.join(), Err(JoinError::Rejected)));
    }

    #[test]
    fn test_occupied_memory_disabled() {
        let rt = runtime();
        let c = rt.create(TenantConfiguration::new()).unwrap();
        assert!(matches!(c.occupied_memory(), Err(TenantError::FeatureDisabled(_))));
        assert!(matches!(c.cpu_time(), Err(TenantError::FeatureDisabled(_))));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
    }
}
