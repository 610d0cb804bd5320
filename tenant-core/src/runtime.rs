//! Tenant Runtime - process-wide container registry
//!
//! Everything that is global to multi-tenancy lives in one
//! [`TenantRuntime`]: the feature flags, the shutdown settings, the host
//! collaborators (thread control, usage meter, group provider), the
//! id-to-container lookup table and the metrics. There are no ambient
//! statics; a process normally builds one runtime at startup and calls
//! [`TenantRuntime::shutdown`] once at exit.
//!
//! # Lifecycle
//! - `builder()...build()` or `from_env()` decides flags and settings once
//! - `create*` registers containers; `destroy()` unregisters them
//! - `shutdown()` destroys whatever is left and refuses new containers

use crate::config::TenantSettings;
use crate::engine::container::{self, DestroyOutcome, TenantContainer};
use crate::engine::control::{CooperativeControl, ThreadCpuMeter, ThreadControl, UsageMeter};
use crate::engine::group::{CgroupProvider, Group, GroupProvider};
use crate::engine::resource_limits::TenantConfiguration;
use crate::engine::thread::ThreadRecord;
use crate::error::{Result, TenantError};
use crate::globals::TenantFlags;
use crate::management::TenantManagement;
use crate::perf::{ShutdownMetrics, ShutdownSnapshot};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

pub(crate) struct RuntimeInner {
    pub(crate) flags: TenantFlags,
    pub(crate) settings: TenantSettings,
    pub(crate) control: Arc<dyn ThreadControl>,
    pub(crate) meter: Arc<dyn UsageMeter>,
    pub(crate) metrics: Arc<ShutdownMetrics>,
    groups: Option<Arc<dyn GroupProvider>>,
    registry: Mutex<HashMap<u64, TenantContainer>>,
    next_id: AtomicU64,
    shut_down: AtomicBool,
}

impl RuntimeInner {
    pub(crate) fn unregister(&self, id: u64) {
        self.registry.lock().remove(&id);
    }
}

/// Builder for [`TenantRuntime`].
pub struct TenantRuntimeBuilder {
    flags: TenantFlags,
    settings: TenantSettings,
    control: Arc<dyn ThreadControl>,
    meter: Arc<dyn UsageMeter>,
    groups: Option<Arc<dyn GroupProvider>>,
}

impl Default for TenantRuntimeBuilder {
    fn default() -> Self {
        Self {
            flags: TenantFlags::disabled(),
            settings: TenantSettings::default(),
            control: Arc::new(CooperativeControl),
            meter: Arc::new(ThreadCpuMeter),
            groups: None,
        }
    }
}

impl TenantRuntimeBuilder {
    pub fn flags(mut self, flags: TenantFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn settings(mut self, settings: TenantSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn thread_control(mut self, control: Arc<dyn ThreadControl>) -> Self {
        self.control = control;
        self
    }

    pub fn usage_meter(mut self, meter: Arc<dyn UsageMeter>) -> Self {
        self.meter = meter;
        self
    }

    pub fn group_provider(mut self, groups: Arc<dyn GroupProvider>) -> Self {
        self.groups = Some(groups);
        self
    }

    pub fn build(self) -> Result<TenantRuntime> {
        self.settings.validate()?;
        if self.flags.needs_group() && self.groups.is_none() {
            return Err(TenantError::IllegalState(
                "CPU throttling or accounting needs a group provider".to_string(),
            ));
        }
        info!(
            flags = %self.flags,
            thread_stop = self.flags.is_thread_stop_enabled(),
            kill_interval_ms = self.settings.shutdown.kill_thread_interval.as_millis() as u64,
            "Tenant runtime initialized"
        );
        Ok(TenantRuntime {
            inner: Arc::new(RuntimeInner {
                flags: self.flags,
                settings: self.settings,
                control: self.control,
                meter: self.meter,
                metrics: ShutdownMetrics::new(),
                groups: self.groups,
                registry: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                shut_down: AtomicBool::new(false),
            }),
        })
    }
}

/// Handle to the process-wide tenant state. Cloning is cheap.
#[derive(Clone)]
pub struct TenantRuntime {
    inner: Arc<RuntimeInner>,
}

impl TenantRuntime {
    pub fn builder() -> TenantRuntimeBuilder {
        TenantRuntimeBuilder::default()
    }

    /// Build a runtime from `TENANT_FLAGS`, the `TENANT_*` settings and,
    /// when a CPU feature is on, the cgroup root in `TENANT_CGROUP_ROOT`.
    pub fn from_env() -> Result<Self> {
        let flags = TenantFlags::from_env()?;
        let mut builder = Self::builder()
            .flags(flags)
            .settings(TenantSettings::from_env()?);
        if flags.needs_group() {
            builder = builder.group_provider(Arc::new(CgroupProvider::from_env()));
        }
        builder.build()
    }

    pub(crate) fn from_inner(inner: Arc<RuntimeInner>) -> Self {
        Self { inner }
    }

    pub fn flags(&self) -> TenantFlags {
        self.inner.flags
    }

    pub fn settings(&self) -> &TenantSettings {
        &self.inner.settings
    }

    pub fn metrics(&self) -> ShutdownSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn management(&self) -> TenantManagement {
        TenantManagement::new(self.clone())
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    // ── creation ──────────────────────────────────────────────────────

    /// Create a container named `Tenant-<id>`, child of the caller's
    /// current container.
    pub fn create(&self, config: TenantConfiguration) -> Result<TenantContainer> {
        let parent = container::current();
        self.create_inner(parent.as_ref(), None, config)
    }

    pub fn create_named(&self, name: &str, config: TenantConfiguration) -> Result<TenantContainer> {
        let parent = container::current();
        self.create_inner(parent.as_ref(), Some(name), config)
    }

    pub fn create_child(
        &self,
        parent: Option<&TenantContainer>,
        name: &str,
        config: TenantConfiguration,
    ) -> Result<TenantContainer> {
        self.create_inner(parent, Some(name), config)
    }

    fn create_inner(
        &self,
        parent: Option<&TenantContainer>,
        name: Option<&str>,
        config: TenantConfiguration,
    ) -> Result<TenantContainer> {
        self.inner.flags.require_tenant()?;
        if name.is_some_and(str::is_empty) {
            return Err(TenantError::IllegalArgument(
                "tenant name must not be empty".to_string(),
            ));
        }
        if self.is_shut_down() {
            return Err(TenantError::IllegalState(
                "tenant runtime is shut down".to_string(),
            ));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let name = name.map_or_else(|| format!("Tenant-{id}"), str::to_string);
        let group = self.provision_group(id, &name, &config)?;

        let container = TenantContainer::new(
            Arc::clone(&self.inner),
            id,
            name,
            config,
            parent,
            group,
        );
        self.inner.registry.lock().insert(id, container.clone());
        self.inner.metrics.record_create();
        info!(
            container_id = id,
            name = container.name(),
            parent = parent.map(TenantContainer::id),
            "Created tenant container"
        );
        Ok(container)
    }

    fn provision_group(
        &self,
        id: u64,
        name: &str,
        config: &TenantConfiguration,
    ) -> Result<Option<Box<dyn Group>>> {
        let Some(provider) = self.inner.groups.as_ref().filter(|_| self.inner.flags.needs_group())
        else {
            return Ok(None);
        };
        let group = provider.create(id, name)?;
        let synced = config
            .limits()
            .filter(|limit| limit.resource_type().is_controller_backed())
            .try_for_each(|limit| limit.sync(&*group));
        if let Err(err) = synced {
            if let Err(destroy_err) = group.destroy() {
                warn!(container_id = id, error = %destroy_err, "Failed to release group");
            }
            return Err(err);
        }
        Ok(Some(group))
    }

    // ── lookup ────────────────────────────────────────────────────────

    pub fn get_by_id(&self, id: u64) -> Result<Option<TenantContainer>> {
        self.inner.flags.require_tenant()?;
        Ok(self.inner.registry.lock().get(&id).cloned())
    }

    /// Ids of all containers not yet destroyed, ascending.
    pub fn all_ids(&self) -> Result<Vec<u64>> {
        self.inner.flags.require_tenant()?;
        let mut ids: Vec<u64> = self.inner.registry.lock().keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Container the calling thread runs in, `None` in the root context.
    pub fn current(&self) -> Result<Option<TenantContainer>> {
        self.inner.flags.require_tenant()?;
        Ok(container::current())
    }

    /// Decide whether threads started by the calling thread join its
    /// container.
    pub fn set_current_thread_inheritance(&self, inherit: bool) -> Result<()> {
        self.inner.flags.require_tenant()?;
        if !self.inner.settings.allow_per_thread_inheritance {
            return Err(TenantError::IllegalState(
                "per-thread inheritance is not allowed".to_string(),
            ));
        }
        ThreadRecord::current().set_inherit(inherit);
        Ok(())
    }

    // ── teardown ──────────────────────────────────────────────────────

    /// Destroy every live container and refuse new ones.
    ///
    /// Returns how many containers this call destroyed; later calls return 0.
    pub fn shutdown(&self) -> Result<usize> {
        if let Some(current) = container::current() {
            return Err(TenantError::IllegalState(format!(
                "shutdown called from inside tenant {}",
                current.id()
            )));
        }
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }

        let mut containers: Vec<TenantContainer> =
            self.inner.registry.lock().values().cloned().collect();
        containers.sort_by_key(TenantContainer::id);

        let mut destroyed = 0;
        for container in containers {
            match container.destroy() {
                Ok(DestroyOutcome::AlreadyDestroyed) => {}
                Ok(_) => destroyed += 1,
                Err(err) => {
                    warn!(container_id = container.id(), error = %err, "Failed to destroy container during shutdown")
                }
            }
        }
        info!(destroyed, "Tenant runtime shut down");
        Ok(destroyed)
    }
}

impl fmt::Debug for TenantRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantRuntime")
            .field("flags", &self.inner.flags)
            .field("containers", &self.inner.registry.lock().len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
