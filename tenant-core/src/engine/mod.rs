//! Engine module - Core tenancy components
//!
//! Containers, the threads that run inside them, the kill loop that
//! terminates those threads, and the resource-control groups that back
//! their limits.

pub mod container;
pub mod control;
pub mod group;
pub mod hooks;
pub mod kill;
pub mod resource_limits;
pub mod thread;

pub use container::{ContainerState, DestroyOutcome, TenantContainer, TenantResource};
pub use control::{CooperativeControl, ThreadControl, ThreadCpuMeter, UsageMeter};
pub use group::{CgroupGroup, CgroupProvider, Group, GroupProvider};
pub use hooks::HookId;
pub use kill::{KillOutcome, KillStats, WatchdogReport};
pub use resource_limits::{ResourceLimit, ResourceType, TenantConfiguration};
pub use thread::{JoinError, MaskGuard, RunState, TenantJoinHandle, ThreadRecord};
