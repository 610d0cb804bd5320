//! Tenant-aware threads
//!
//! Every OS thread that interacts with a container owns one [`ThreadRecord`].
//! Containers only ever hold `Weak` references to records, so bookkeeping
//! never keeps a finished thread alive, and liveness is polled through
//! [`ThreadRecord::is_terminated`].
//!
//! # Termination model
//!
//! Forced termination is cooperative. A container marks its threads for
//! destruction; tenant code observes the mark at its next check point
//! ([`checkpoint`], [`sleep`], [`park_timeout`], [`park`]) and receives
//! [`TenantDeath`], which it propagates with `?` back to its entry point.
//! Threads blocked in the tenant-aware waiting helpers are woken through
//! their parker, and threads blocked in system calls are knocked out with
//! `SIGURG` so the call returns `EINTR`.
//!
//! # Masking
//!
//! [`mask`] opens a region in which the thread is never marked. A mark
//! requested while masked is remembered and delivered when the outermost
//! [`MaskGuard`] is released.
//!
//! The mask level, the kill mark, the pending mark and the interrupt flag
//! share one atomic word, so marking and mask transitions never interleave:
//! a pending mark only exists while the thread is masked.

use crate::engine::container::{self, RestoreCurrent, TenantContainer};
use crate::error::{Result, TenantDeath};
use nix::sys::pthread::{pthread_kill, pthread_self, Pthread};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::panic::Location;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);
static WAKE_HANDLER: Once = Once::new();

/// Signal used to interrupt blocking system calls of a thread being destroyed.
pub const WAKE_SIGNAL: Signal = Signal::SIGURG;

/// Scheduling state of a tracked thread as seen by the kill loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum RunState {
    New = 0,
    Running = 1,
    Waiting = 2,
    TimedWaiting = 3,
    Terminated = 4,
}

impl RunState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::New,
            1 => Self::Running,
            2 => Self::Waiting,
            3 => Self::TimedWaiting,
            _ => Self::Terminated,
        }
    }

    /// Blocked in one of the tenant-aware waiting helpers.
    pub fn is_waiting(self) -> bool {
        matches!(self, Self::Waiting | Self::TimedWaiting)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::Running => "RUNNABLE",
            Self::Waiting => "WAITING",
            Self::TimedWaiting => "TIMED_WAITING",
            Self::Terminated => "TERMINATED",
        };
        f.write_str(s)
    }
}

const MASK_LEVEL: u64 = 0xffff_ffff;
const KILLED: u64 = 1 << 32;
const DEATH_PENDING: u64 = 1 << 33;
const INTERRUPTED: u64 = 1 << 34;

const INHERIT_DEFAULT: u8 = 0;
const INHERIT_ON: u8 = 1;
const INHERIT_OFF: u8 = 2;

struct Parker {
    notified: Mutex<bool>,
    cvar: Condvar,
}

impl Parker {
    fn new() -> Self {
        Self {
            notified: Mutex::new(false),
            cvar: Condvar::new(),
        }
    }

    fn park_until(&self, deadline: Option<Instant>) {
        let mut notified = self.notified.lock();
        if !*notified {
            match deadline {
                Some(deadline) => {
                    self.cvar.wait_until(&mut notified, deadline);
                }
                None => self.cvar.wait(&mut notified),
            }
        }
        *notified = false;
    }

    fn unpark(&self) {
        let mut notified = self.notified.lock();
        *notified = true;
        self.cvar.notify_one();
    }
}

/// Per-thread state shared between the thread itself, the containers it
/// belongs to and the kill loop.
pub struct ThreadRecord {
    id: u64,
    name: Option<String>,
    /// Mask level in the low 32 bits, plus the `KILLED`, `DEATH_PENDING`
    /// and `INTERRUPTED` bits.
    term: AtomicU64,
    parker: Parker,
    run_state: AtomicU8,
    native: Mutex<Option<Pthread>>,
    os_tid: AtomicI32,
    last_checkpoint: Mutex<Option<&'static Location<'static>>>,
    inherit: AtomicU8,
}

struct CurrentRecord(Arc<ThreadRecord>);

impl Drop for CurrentRecord {
    fn drop(&mut self) {
        self.0.exit();
    }
}

thread_local! {
    static CURRENT_RECORD: RefCell<Option<CurrentRecord>> = const { RefCell::new(None) };
}

impl ThreadRecord {
    pub(crate) fn new(name: Option<String>) -> Self {
        Self {
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            name,
            term: AtomicU64::new(0),
            parker: Parker::new(),
            run_state: AtomicU8::new(RunState::New as u8),
            native: Mutex::new(None),
            os_tid: AtomicI32::new(0),
            last_checkpoint: Mutex::new(None),
            inherit: AtomicU8::new(INHERIT_DEFAULT),
        }
    }

    /// Record of the calling thread, created on first use.
    pub fn current() -> Arc<ThreadRecord> {
        let found = CURRENT_RECORD.try_with(|slot| {
            let mut slot = slot.borrow_mut();
            match slot.as_ref() {
                Some(current) => Arc::clone(&current.0),
                None => {
                    let name = std::thread::current().name().map(str::to_string);
                    let record = Arc::new(ThreadRecord::new(name));
                    record.bind_to_current_thread();
                    *slot = Some(CurrentRecord(Arc::clone(&record)));
                    record
                }
            }
        });
        // Thread-local storage is gone during thread teardown: hand out a
        // detached record that nothing else can see.
        found.unwrap_or_else(|_| Arc::new(ThreadRecord::new(None)))
    }

    /// Make `record` the record of the calling thread.
    fn install(record: &Arc<ThreadRecord>) {
        record.bind_to_current_thread();
        let _ = CURRENT_RECORD.try_with(|slot| {
            *slot.borrow_mut() = Some(CurrentRecord(Arc::clone(record)));
        });
    }

    fn bind_to_current_thread(&self) {
        *self.native.lock() = Some(pthread_self());
        // SAFETY: gettid has no preconditions.
        let tid = unsafe { libc::gettid() };
        self.os_tid.store(tid, Ordering::Relaxed);
        self.set_run_state(RunState::Running);
    }

    fn exit(&self) {
        *self.native.lock() = None;
        self.set_run_state(RunState::Terminated);
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Kernel thread id, 0 until the thread started.
    pub fn os_tid(&self) -> i32 {
        self.os_tid.load(Ordering::Relaxed)
    }

    pub fn run_state(&self) -> RunState {
        RunState::from_u8(self.run_state.load(Ordering::Acquire))
    }

    fn set_run_state(&self, state: RunState) {
        self.run_state.store(state as u8, Ordering::Release);
    }

    pub fn is_terminated(&self) -> bool {
        self.run_state() == RunState::Terminated
    }

    fn term(&self) -> u64 {
        self.term.load(Ordering::SeqCst)
    }

    pub fn mask_level(&self) -> u32 {
        (self.term() & MASK_LEVEL) as u32
    }

    pub fn is_masked(&self) -> bool {
        self.mask_level() > 0
    }

    /// Source location of the most recent [`checkpoint`] call.
    pub fn last_checkpoint(&self) -> Option<&'static Location<'static>> {
        *self.last_checkpoint.lock()
    }

    /// Request destruction of this thread.
    ///
    /// A masked thread only gets a pending mark, delivered on unmask.
    pub fn mark_for_destroy(&self) {
        if self.is_terminated() {
            return;
        }
        // The closure always returns Some, so the update cannot fail.
        let _ = self
            .term
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |term| {
                if term & MASK_LEVEL > 0 {
                    Some(term | DEATH_PENDING)
                } else {
                    Some(term | KILLED)
                }
            });
        self.parker.unpark();
    }

    /// A pending mark only counts while the thread is masked, so a thread
    /// that somehow ends up unmasked with a stale pending mark gets marked
    /// again by the kill loop.
    pub fn is_marked_for_destroy(&self) -> bool {
        let term = self.term();
        term & KILLED != 0 || (term & DEATH_PENDING != 0 && term & MASK_LEVEL > 0)
    }

    #[cfg(test)]
    pub(crate) fn leave_pending_mark(&self) {
        self.term.fetch_or(DEATH_PENDING, Ordering::SeqCst);
    }

    fn death_due(&self) -> bool {
        let term = self.term();
        term & KILLED != 0 && term & MASK_LEVEL == 0
    }

    fn check_death(&self) -> std::result::Result<(), TenantDeath> {
        if self.death_due() {
            Err(TenantDeath)
        } else {
            Ok(())
        }
    }

    /// Set the interrupt flag and wake the thread if it waits.
    /// Masked threads are left alone.
    pub fn interrupt(&self) {
        if self.is_terminated() {
            return;
        }
        let set = self
            .term
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |term| {
                (term & MASK_LEVEL == 0).then_some(term | INTERRUPTED)
            });
        if set.is_ok() {
            self.parker.unpark();
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.term() & INTERRUPTED != 0
    }

    fn take_interrupt(&self) -> bool {
        self.term.fetch_and(!INTERRUPTED, Ordering::SeqCst) & INTERRUPTED != 0
    }

    /// Wake the thread from tenant-aware waits.
    pub fn unpark(&self) {
        self.parker.unpark();
    }

    /// Send [`WAKE_SIGNAL`] so a blocking system call returns `EINTR`.
    ///
    /// Returns false when the thread has already exited or is masked. The
    /// mask level is checked under the same lock that [`mask`] takes, so a
    /// masked region never starts with a wake signal in flight.
    pub fn signal_wake(&self) -> bool {
        install_wake_handler();
        let native = self.native.lock();
        let Some(thread) = *native else {
            return false;
        };
        if self.is_masked() {
            return false;
        }
        match pthread_kill(thread, WAKE_SIGNAL) {
            Ok(()) => true,
            Err(err) => {
                debug!(thread_id = self.id, error = %err, "pthread_kill failed");
                false
            }
        }
    }

    /// Run `f` with the native handle while it is guaranteed to stay valid.
    pub fn with_native<R>(&self, f: impl FnOnce(Pthread) -> R) -> Option<R> {
        let native = self.native.lock();
        native.map(f)
    }

    pub(crate) fn inherits(&self, default: bool) -> bool {
        match self.inherit.load(Ordering::Relaxed) {
            INHERIT_ON => true,
            INHERIT_OFF => false,
            _ => default,
        }
    }

    pub(crate) fn set_inherit(&self, inherit: bool) {
        let raw = if inherit { INHERIT_ON } else { INHERIT_OFF };
        self.inherit.store(raw, Ordering::Relaxed);
    }

    fn mask(&self) {
        let _native = self.native.lock();
        self.term.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one mask level. Leaving the outermost level turns a pending
    /// mark into a kill in the same step.
    fn unmask(&self) -> std::result::Result<(), TenantDeath> {
        let previous = self
            .term
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |term| {
                let level = term & MASK_LEVEL;
                if level == 0 {
                    return None;
                }
                let next = term - 1;
                if level == 1 && next & DEATH_PENDING != 0 {
                    Some((next & !DEATH_PENDING) | KILLED)
                } else {
                    Some(next)
                }
            });
        match previous {
            Ok(term) if term & MASK_LEVEL == 1 => self.check_death(),
            Ok(_) => Ok(()),
            Err(_) => {
                warn!(thread_id = self.id, "unmask without matching mask");
                Ok(())
            }
        }
    }

    fn enter_state(&self, state: RunState) -> StateGuard<'_> {
        self.set_run_state(state);
        StateGuard { record: self }
    }
}

impl fmt::Debug for ThreadRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.run_state())
            .field("mask_level", &self.mask_level())
            .field("marked", &self.is_marked_for_destroy())
            .finish()
    }
}

struct StateGuard<'a> {
    record: &'a ThreadRecord,
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        if !self.record.is_terminated() {
            self.record.set_run_state(RunState::Running);
        }
    }
}

extern "C" fn on_wake_signal(_: libc::c_int) {}

fn install_wake_handler() {
    WAKE_HANDLER.call_once(|| {
        // No SA_RESTART: interrupted system calls must fail with EINTR.
        let action = SigAction::new(
            SigHandler::Handler(on_wake_signal),
            SaFlags::empty(),
            SigSet::empty(),
        );
        // SAFETY: the handler is async-signal-safe, it does nothing.
        if let Err(err) = unsafe { sigaction(WAKE_SIGNAL, &action) } {
            warn!(error = %err, "Failed to install thread wake handler");
        }
    });
}

// ── cooperative check points ──────────────────────────────────────────

/// Fail with [`TenantDeath`] if the calling thread has been marked for
/// destruction and is not masked.
#[track_caller]
pub fn checkpoint() -> std::result::Result<(), TenantDeath> {
    let record = ThreadRecord::current();
    *record.last_checkpoint.lock() = Some(Location::caller());
    record.check_death()
}

/// Sleep for `duration`.
///
/// Returns early (with the interrupt flag still set) when interrupted, and
/// fails once the thread is marked for destruction.
#[track_caller]
pub fn sleep(duration: Duration) -> std::result::Result<(), TenantDeath> {
    let record = ThreadRecord::current();
    *record.last_checkpoint.lock() = Some(Location::caller());
    let deadline = Instant::now() + duration;
    let _state = record.enter_state(RunState::TimedWaiting);
    loop {
        record.check_death()?;
        if record.is_interrupted() || Instant::now() >= deadline {
            return Ok(());
        }
        record.parker.park_until(Some(deadline));
    }
}

/// Block until unparked, interrupted, marked, or `timeout` elapses.
#[track_caller]
pub fn park_timeout(timeout: Duration) -> std::result::Result<(), TenantDeath> {
    let record = ThreadRecord::current();
    *record.last_checkpoint.lock() = Some(Location::caller());
    let _state = record.enter_state(RunState::TimedWaiting);
    record.check_death()?;
    if !record.is_interrupted() {
        record.parker.park_until(Some(Instant::now() + timeout));
    }
    record.check_death()
}

/// Block until unparked, interrupted or marked.
#[track_caller]
pub fn park() -> std::result::Result<(), TenantDeath> {
    let record = ThreadRecord::current();
    *record.last_checkpoint.lock() = Some(Location::caller());
    let _state = record.enter_state(RunState::Waiting);
    record.check_death()?;
    if !record.is_interrupted() {
        record.parker.park_until(None);
    }
    record.check_death()
}

/// Read and clear the interrupt flag of the calling thread.
pub fn interrupted() -> bool {
    ThreadRecord::current().take_interrupt()
}

// ── masking ───────────────────────────────────────────────────────────

/// Protects a region of the calling thread from forced termination.
///
/// Release it with [`MaskGuard::unmask`] to learn whether destruction was
/// requested in the meantime. Dropping the guard also unmasks; a pending
/// death then surfaces at the next check point.
#[must_use = "the region is unmasked as soon as the guard is dropped"]
pub struct MaskGuard {
    record: Arc<ThreadRecord>,
    active: bool,
    _not_send: PhantomData<*const ()>,
}

/// Enter a masked region. Regions nest.
pub fn mask() -> MaskGuard {
    let record = ThreadRecord::current();
    record.mask();
    MaskGuard {
        record,
        active: true,
        _not_send: PhantomData,
    }
}

impl MaskGuard {
    pub fn unmask(mut self) -> std::result::Result<(), TenantDeath> {
        self.active = false;
        self.record.unmask()
    }
}

impl Drop for MaskGuard {
    fn drop(&mut self) {
        if self.active {
            let _ = self.record.unmask();
        }
    }
}

/// Run `f` masked and outside of any container, then re-enter the
/// container the thread was running in.
pub fn primitive_run_in_root<F, T>(f: F) -> T
where
    F: FnOnce() -> T,
{
    let _mask = mask();
    let _restore = RestoreCurrent(container::replace_current(None));
    f()
}

// ── spawning ──────────────────────────────────────────────────────────

/// Failure to obtain the result of a tenant-aware thread.
#[derive(Error, Debug)]
pub enum JoinError {
    #[error("thread panicked")]
    Panicked(Box<dyn Any + Send + 'static>),

    #[error("thread was rejected by its tenant container")]
    Rejected,
}

/// Owned permission to join a thread started through this module.
pub struct TenantJoinHandle<T> {
    inner: std::thread::JoinHandle<Option<T>>,
    record: Arc<ThreadRecord>,
}

impl<T> TenantJoinHandle<T> {
    pub fn join(self) -> std::result::Result<T, JoinError> {
        match self.inner.join() {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(JoinError::Rejected),
            Err(payload) => Err(JoinError::Panicked(payload)),
        }
    }

    pub fn record(&self) -> &Arc<ThreadRecord> {
        &self.record
    }

    pub fn is_terminated(&self) -> bool {
        self.record.is_terminated()
    }
}

impl<T> fmt::Debug for TenantJoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantJoinHandle")
            .field("record", &self.record)
            .finish()
    }
}

enum Placement {
    Inherit,
    Container(TenantContainer),
    Service(TenantContainer),
}

/// Tenant-aware counterpart of [`std::thread::Builder`].
pub struct Builder {
    name: Option<String>,
    stack_size: Option<usize>,
    placement: Placement,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// The new thread joins the spawning thread's container when the
    /// spawning thread inherits.
    pub fn new() -> Self {
        Self {
            name: None,
            stack_size: None,
            placement: Placement::Inherit,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    pub(crate) fn container(mut self, container: TenantContainer) -> Self {
        self.placement = Placement::Container(container);
        self
    }

    pub(crate) fn service(mut self, container: TenantContainer) -> Self {
        self.placement = Placement::Service(container);
        self
    }

    pub fn spawn<F, T>(self, f: F) -> Result<TenantJoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let record = Arc::new(ThreadRecord::new(self.name.clone()));
        let target = match self.placement {
            Placement::Inherit => inherited_container(),
            Placement::Container(container) => Some(container),
            Placement::Service(container) => {
                container.register_service_thread(&record);
                Some(container)
            }
        };

        let mut builder = std::thread::Builder::new();
        if let Some(name) = self.name {
            builder = builder.name(name);
        }
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }

        let thread_record = Arc::clone(&record);
        let inner = builder.spawn(move || {
            ThreadRecord::install(&thread_record);
            let _exit = ExitGuard(&thread_record);
            match target {
                Some(container) => container.run_thread(&thread_record, f),
                None => Some(f()),
            }
        })?;

        Ok(TenantJoinHandle { inner, record })
    }
}

struct ExitGuard<'a>(&'a ThreadRecord);

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        self.0.exit();
    }
}

/// Start a thread that inherits the caller's container.
pub fn spawn<F, T>(f: F) -> Result<TenantJoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Builder::new().spawn(f)
}

fn inherited_container() -> Option<TenantContainer> {
    let container = container::current()?;
    let default = container.runtime_settings().thread_inheritance;
    ThreadRecord::current()
        .inherits(default)
        .then_some(container)
}
