//! Tenant Core - In-process multi-tenancy
//!
//! This crate lets one process host several isolated tenants. Each tenant is
//! a [`TenantContainer`]: a set of threads, resource limits backed by a
//! control group, shutdown hooks, and a destroy path that can terminate
//! every thread the tenant started.
//!
//! # Design:
//! - One [`TenantRuntime`] per process holds flags, settings and the id table
//! - Threads enter containers through `run()` or tenant-aware spawning
//! - Termination is cooperative: marked threads fail their next check point
//!   with [`TenantDeath`], while masked regions defer the mark
//! - Destroy never blocks unbounded when a soft limit is configured; a
//!   watchdog thread finishes the job

pub mod config;
pub mod engine;
pub mod error;
pub mod globals;
pub mod management;
pub mod perf;
pub mod runtime;

pub use engine::thread;

pub use config::{ShutdownSettings, TenantSettings};
pub use engine::container::{ContainerState, DestroyOutcome, TenantContainer, TenantResource};
pub use engine::control::{CooperativeControl, ThreadControl, ThreadCpuMeter, UsageMeter};
pub use engine::group::{CgroupProvider, Group, GroupProvider};
pub use engine::hooks::HookId;
pub use engine::kill::{KillOutcome, KillStats, WatchdogReport};
pub use engine::resource_limits::{ResourceLimit, ResourceType, TenantConfiguration};
pub use engine::thread::{JoinError, MaskGuard, RunState, TenantJoinHandle, ThreadRecord};
pub use error::{Result, TenantDeath, TenantError};
pub use globals::TenantFlags;
pub use management::{ContainerStats, TenantManagement};
pub use perf::{ShutdownMetrics, ShutdownSnapshot};
pub use runtime::{TenantRuntime, TenantRuntimeBuilder};

use tracing::info;
use tracing_subscriber::EnvFilter;

/// Initialize logging. Honours `RUST_LOG`, defaulting to `info`.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub async fn init() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
    {
        info!("Initializing Tenant Core v{}", env!("CARGO_PKG_VERSION"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init() {
        assert!(init().await.is_ok());
        assert!(init().await.is_ok());
    }
}
