//! Read-only management surface
//!
//! [`TenantManagement`] answers by-id questions about the containers of one
//! runtime, the way an external monitoring agent would ask them. Every
//! lookup of an unknown (or already destroyed) id fails with
//! [`TenantError::IllegalArgument`].

use crate::engine::container::{ContainerState, TenantContainer};
use crate::error::{Result, TenantError};
use crate::runtime::TenantRuntime;
use serde::Serialize;

/// Point-in-time view of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerStats {
    pub id: u64,
    pub name: String,
    pub state: ContainerState,
    pub attached_threads: usize,
    pub live_spawned_threads: usize,
    /// Nanoseconds accumulated by threads while attached.
    pub accumulated_usage: u64,
    /// Group CPU time in nanoseconds, when CPU accounting is available.
    pub cpu_time: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct TenantManagement {
    runtime: TenantRuntime,
}

impl TenantManagement {
    pub fn new(runtime: TenantRuntime) -> Self {
        Self { runtime }
    }

    pub fn all_ids(&self) -> Result<Vec<u64>> {
        self.runtime.all_ids()
    }

    pub fn name_by_id(&self, id: u64) -> Result<String> {
        Ok(self.lookup(id)?.name().to_string())
    }

    pub fn cpu_time_by_id(&self, id: u64) -> Result<u64> {
        self.lookup(id)?.cpu_time()
    }

    pub fn usage_by_id(&self, id: u64) -> Result<u64> {
        Ok(self.lookup(id)?.accumulated_usage())
    }

    pub fn occupied_memory_by_id(&self, id: u64) -> Result<u64> {
        self.lookup(id)?.occupied_memory()
    }

    pub fn attached_threads_by_id(&self, id: u64) -> Result<usize> {
        Ok(self.lookup(id)?.attached_threads().len())
    }

    pub fn stats_by_id(&self, id: u64) -> Result<ContainerStats> {
        Ok(self.lookup(id)?.stats())
    }

    /// Stats of every live container, ordered by id.
    pub fn all_stats(&self) -> Result<Vec<ContainerStats>> {
        let mut stats = Vec::new();
        for id in self.all_ids()? {
            // A container may be destroyed between the two lookups.
            if let Some(container) = self.runtime.get_by_id(id)? {
                stats.push(container.stats());
            }
        }
        Ok(stats)
    }

    fn lookup(&self, id: u64) -> Result<TenantContainer> {
        self.runtime
            .get_by_id(id)?
            .ok_or_else(|| TenantError::IllegalArgument(format!("no tenant with id {id}")))
    }
}
