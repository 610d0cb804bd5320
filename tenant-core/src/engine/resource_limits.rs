//! Per-tenant resource limits
//!
//! A [`TenantConfiguration`] maps each [`ResourceType`] to at most one
//! [`ResourceLimit`]. Only controller-backed types are ever pushed to a
//! container's [`Group`]; the others are kept in the configuration so that
//! configuration objects stay forward compatible.
//!
//! # Controller files
//! - `CpuShares` maps onto `cpu.weight`
//! - `CpuCfs` maps onto `cpu.max`
//! - `CpusetCpus` maps onto `cpuset.cpus`

use crate::engine::group::Group;
use crate::error::{Result, TenantError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Kind of resource a limit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// Heap memory bound.
    Memory,
    /// Relative CPU weight.
    CpuShares,
    /// Set of CPUs the tenant may run on.
    CpusetCpus,
    /// CPU bandwidth (quota per period).
    CpuCfs,
    /// Open socket bound.
    Socket,
}

impl ResourceType {
    pub const ALL: [ResourceType; 5] = [
        ResourceType::Memory,
        ResourceType::CpuShares,
        ResourceType::CpusetCpus,
        ResourceType::CpuCfs,
        ResourceType::Socket,
    ];

    /// Whether limits of this type are enforced by the resource controller.
    pub const fn is_controller_backed(self) -> bool {
        matches!(
            self,
            ResourceType::CpuShares | ResourceType::CpusetCpus | ResourceType::CpuCfs
        )
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::CpuShares => write!(f, "cpu.shares"),
            Self::CpusetCpus => write!(f, "cpuset.cpus"),
            Self::CpuCfs => write!(f, "cpu.cfs"),
            Self::Socket => write!(f, "socket"),
        }
    }
}

/// Smallest accepted CFS period, in microseconds.
pub const CFS_PERIOD_MIN_US: u64 = 1_000;
/// Largest accepted CFS period, in microseconds.
pub const CFS_PERIOD_MAX_US: u64 = 1_000_000;
/// Smallest accepted positive CFS quota, in microseconds.
pub const CFS_QUOTA_MIN_US: i64 = 1_000;

/// A typed quota value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceLimit {
    Memory { max_bytes: u64 },
    CpuShares { shares: u64 },
    CpusetCpus { cpus: String },
    /// A negative quota means unlimited bandwidth.
    CpuCfs { period_us: u64, quota_us: i64 },
    Socket { max: u64 },
}

impl ResourceLimit {
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Self::Memory { .. } => ResourceType::Memory,
            Self::CpuShares { .. } => ResourceType::CpuShares,
            Self::CpusetCpus { .. } => ResourceType::CpusetCpus,
            Self::CpuCfs { .. } => ResourceType::CpuCfs,
            Self::Socket { .. } => ResourceType::Socket,
        }
    }

    /// Check the value against the ranges the controller accepts.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Memory { max_bytes } if *max_bytes == 0 => Err(TenantError::IllegalArgument(
                "memory limit must be greater than 0".to_string(),
            )),
            Self::CpuShares { shares } if *shares == 0 => Err(TenantError::IllegalArgument(
                "cpu shares must be greater than 0".to_string(),
            )),
            Self::CpusetCpus { cpus } => parse_cpu_list(cpus).map(|_| ()),
            Self::CpuCfs {
                period_us,
                quota_us,
            } => {
                if !(CFS_PERIOD_MIN_US..=CFS_PERIOD_MAX_US).contains(period_us) {
                    return Err(TenantError::IllegalArgument(format!(
                        "cfs period {period_us}us outside {CFS_PERIOD_MIN_US}..={CFS_PERIOD_MAX_US}"
                    )));
                }
                if *quota_us >= 0 && *quota_us < CFS_QUOTA_MIN_US {
                    return Err(TenantError::IllegalArgument(format!(
                        "cfs quota {quota_us}us below {CFS_QUOTA_MIN_US}us"
                    )));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Push this limit to the resource controller.
    pub fn sync(&self, group: &dyn Group) -> Result<()> {
        let kind = self.resource_type();
        if !kind.is_controller_backed() {
            return Err(TenantError::IllegalArgument(format!(
                "{kind} is not enforced by the resource controller"
            )));
        }
        debug!(resource = %kind, limit = ?self, "Syncing resource limit");
        group.sync(self)
    }
}

/// Convert cgroup v1 style shares to a cgroup v2 `cpu.weight`.
pub fn shares_to_weight(shares: u64) -> u64 {
    let shares = shares.clamp(2, 262_144);
    1 + ((shares - 2) * 9_999) / 262_142
}

/// Parse a cpu list such as `0-3,6` into its sorted CPU indices.
pub fn parse_cpu_list(list: &str) -> Result<Vec<u32>> {
    let invalid = || TenantError::IllegalArgument(format!("invalid cpu list '{list}'"));
    let mut cpus = Vec::new();
    for part in list.split(',').map(str::trim) {
        if part.is_empty() {
            return Err(invalid());
        }
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo.trim().parse().map_err(|_| invalid())?;
                let hi: u32 = hi.trim().parse().map_err(|_| invalid())?;
                if lo > hi {
                    return Err(invalid());
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(part.parse().map_err(|_| invalid())?),
        }
    }
    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}

/// Resource limits of one tenant, keyed by type.
///
/// Updating a configuration replaces entries; a running container only sees
/// a change through `TenantContainer::update`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ConfigurationRepr", into = "ConfigurationRepr")]
pub struct TenantConfiguration {
    limits: BTreeMap<ResourceType, ResourceLimit>,
}

#[derive(Serialize, Deserialize)]
struct ConfigurationRepr {
    #[serde(default)]
    limits: Vec<ResourceLimit>,
}

impl From<ConfigurationRepr> for TenantConfiguration {
    fn from(repr: ConfigurationRepr) -> Self {
        let mut config = Self::new();
        for limit in repr.limits {
            config.limits.insert(limit.resource_type(), limit);
        }
        config
    }
}

impl From<TenantConfiguration> for ConfigurationRepr {
    fn from(config: TenantConfiguration) -> Self {
        Self {
            limits: config.limits.into_values().collect(),
        }
    }
}

impl TenantConfiguration {
    /// A configuration without any limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a JSON document of the form
    /// `{"limits": [{"type": "cpu_shares", "shares": 512}]}`.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| TenantError::Config(format!("tenant configuration: {e}")))?;
        for limit in config.limits.values() {
            limit.validate()?;
        }
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| TenantError::Config(format!("tenant configuration: {e}")))
    }

    pub fn limit_cpu_shares(self, shares: u64) -> Result<Self> {
        self.with_limit(ResourceLimit::CpuShares { shares })
    }

    pub fn limit_cpu_cfs(self, period_us: u64, quota_us: i64) -> Result<Self> {
        self.with_limit(ResourceLimit::CpuCfs {
            period_us,
            quota_us,
        })
    }

    pub fn limit_cpuset(self, cpus: impl Into<String>) -> Result<Self> {
        self.with_limit(ResourceLimit::CpusetCpus { cpus: cpus.into() })
    }

    pub fn limit_memory(self, max_bytes: u64) -> Result<Self> {
        self.with_limit(ResourceLimit::Memory { max_bytes })
    }

    pub fn limit_sockets(self, max: u64) -> Result<Self> {
        self.with_limit(ResourceLimit::Socket { max })
    }

    /// Add or replace the limit for the limit's own type.
    pub fn with_limit(mut self, limit: ResourceLimit) -> Result<Self> {
        self.set_limit(limit)?;
        Ok(self)
    }

    pub fn set_limit(&mut self, limit: ResourceLimit) -> Result<()> {
        limit.validate()?;
        self.limits.insert(limit.resource_type(), limit);
        Ok(())
    }

    pub fn limit(&self, kind: ResourceType) -> Option<&ResourceLimit> {
        self.limits.get(&kind)
    }

    pub fn limits(&self) -> impl Iterator<Item = &ResourceLimit> {
        self.limits.values()
    }

    pub fn len(&self) -> usize {
        self.limits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_backed_types() {
        assert!(!ResourceType::Memory.is_controller_backed());
        assert!(ResourceType::CpuShares.is_controller_backed());
        assert!(ResourceType::CpusetCpus.is_controller_backed());
        assert!(ResourceType::CpuCfs.is_controller_backed());
        assert!(!ResourceType::Socket.is_controller_backed());
    }

    #[test]
    fn test_builder_replaces_same_type() {
        let config = TenantConfiguration::new()
            .limit_cpu_shares(512)
            .unwrap()
            .limit_cpu_shares(1024)
            .unwrap()
            .limit_memory(64 << 20)
            .unwrap();

        assert_eq!(config.len(), 2);
        assert_eq!(
            config.limit(ResourceType::CpuShares),
            Some(&ResourceLimit::CpuShares { shares: 1024 })
        );
    }

    #[test]
    fn test_validation() {
        assert!(TenantConfiguration::new().limit_cpu_shares(0).is_err());
        assert!(TenantConfiguration::new().limit_cpu_cfs(10, 5_000).is_err());
        assert!(TenantConfiguration::new().limit_cpu_cfs(100_000, 10).is_err());
        assert!(TenantConfiguration::new().limit_cpu_cfs(100_000, -1).is_ok());
        assert!(TenantConfiguration::new().limit_cpuset("3-1").is_err());
        assert!(TenantConfiguration::new().limit_cpuset("").is_err());
        assert!(TenantConfiguration::new().limit_memory(0).is_err());
    }

    #[test]
    fn test_parse_cpu_list() {
        assert_eq!(parse_cpu_list("0-3,6").unwrap(), vec![0, 1, 2, 3, 6]);
        assert_eq!(parse_cpu_list("2, 2,1").unwrap(), vec![1, 2]);
        assert!(parse_cpu_list("a-b").is_err());
    }

    #[test]
    fn test_shares_to_weight() {
        assert_eq!(shares_to_weight(2), 1);
        assert_eq!(shares_to_weight(262_144), 10_000);
        assert_eq!(shares_to_weight(1024), 39);
        assert_eq!(shares_to_weight(0), 1);
    }

    #[test]
    fn test_from_json() {
        let config = TenantConfiguration::from_json(
            r#"{"limits": [
                {"type": "cpu_shares", "shares": 512},
                {"type": "cpu_cfs", "period_us": 100000, "quota_us": 50000},
                {"type": "socket", "max": 16}
            ]}"#,
        )
        .unwrap();

        assert_eq!(config.len(), 3);
        assert!(config.limit(ResourceType::Socket).is_some());
        let back = TenantConfiguration::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_from_json_rejects_invalid_limit() {
        let err = TenantConfiguration::from_json(
            r#"{"limits": [{"type": "cpuset_cpus", "cpus": "x"}]}"#,
        );
        assert!(err.is_err());
    }
}
