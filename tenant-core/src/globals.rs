//! Process-wide multi-tenancy feature bits
//!
//! The flags are decided once when a [`TenantRuntime`](crate::TenantRuntime)
//! is built and never change afterwards. Every operation that depends on a
//! feature consults them and fails with
//! [`TenantError::FeatureDisabled`](crate::TenantError::FeatureDisabled)
//! instead of silently doing nothing.

use crate::error::{Result, TenantError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Multi-tenant support is active.
pub const TENANT_FLAG_MULTI_TENANT_ENABLED: u32 = 0x1;
/// Heap throttling is active.
pub const TENANT_FLAG_HEAP_THROTTLING_ENABLED: u32 = 0x2;
/// CPU limits are pushed to the resource controller.
pub const TENANT_FLAG_CPU_THROTTLING_ENABLED: u32 = 0x4;
/// Per-tenant data isolation is active.
pub const TENANT_FLAG_DATA_ISOLATION_ENABLED: u32 = 0x8;
/// Spawned threads are terminated by `destroy()`.
pub const TENANT_FLAG_THREAD_STOP_ENABLED: u32 = 0x10;
/// IO handles are reclaimed on destroy.
pub const TENANT_FLAG_IOHANDLE_RECLAIMING_ENABLED: u32 = 0x20;
/// CPU time is accounted per tenant by the resource controller.
pub const TENANT_FLAG_CPU_ACCOUNTING_ENABLED: u32 = 0x40;
/// Heap isolation is active.
pub const TENANT_FLAG_HEAP_ISOLATION_ENABLED: u32 = 0x80;
/// Socket throttling is active.
pub const TENANT_FLAG_SOCKET_THROTTLING_ENABLED: u32 = 0x400;

const ALL_FLAGS: u32 = TENANT_FLAG_MULTI_TENANT_ENABLED
    | TENANT_FLAG_HEAP_THROTTLING_ENABLED
    | TENANT_FLAG_CPU_THROTTLING_ENABLED
    | TENANT_FLAG_DATA_ISOLATION_ENABLED
    | TENANT_FLAG_THREAD_STOP_ENABLED
    | TENANT_FLAG_IOHANDLE_RECLAIMING_ENABLED
    | TENANT_FLAG_CPU_ACCOUNTING_ENABLED
    | TENANT_FLAG_HEAP_ISOLATION_ENABLED
    | TENANT_FLAG_SOCKET_THROTTLING_ENABLED;

/// Immutable set of multi-tenancy feature bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TenantFlags(u32);

impl TenantFlags {
    /// No feature enabled, multi-tenancy included.
    pub const fn disabled() -> Self {
        Self(0)
    }

    /// Multi-tenancy with forced thread termination, the common setup.
    pub const fn with_thread_stop() -> Self {
        Self(TENANT_FLAG_MULTI_TENANT_ENABLED | TENANT_FLAG_THREAD_STOP_ENABLED)
    }

    /// Build flags from a raw bitmask, rejecting unknown bits.
    pub fn from_bits(bits: u32) -> Result<Self> {
        if bits & !ALL_FLAGS != 0 {
            return Err(TenantError::Config(format!(
                "unknown tenant flag bits {:#x}",
                bits & !ALL_FLAGS
            )));
        }
        Ok(Self(bits))
    }

    /// Read flags from `TENANT_FLAGS` (decimal or `0x` hex). Missing means
    /// everything disabled.
    pub fn from_env() -> Result<Self> {
        match std::env::var("TENANT_FLAGS") {
            Ok(raw) => Self::parse(&raw),
            Err(_) => Ok(Self::disabled()),
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let bits = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16),
            None => raw.parse::<u32>(),
        }
        .map_err(|e| TenantError::Config(format!("invalid TENANT_FLAGS '{raw}': {e}")))?;
        Self::from_bits(bits)
    }

    /// Return a copy with `bit` set.
    pub const fn with(self, bit: u32) -> Self {
        Self(self.0 | bit)
    }

    /// Return a copy with `bit` cleared.
    pub const fn without(self, bit: u32) -> Self {
        Self(self.0 & !bit)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    const fn has(&self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub const fn is_tenant_enabled(&self) -> bool {
        self.has(TENANT_FLAG_MULTI_TENANT_ENABLED)
    }

    pub const fn is_heap_throttling_enabled(&self) -> bool {
        self.has(TENANT_FLAG_HEAP_THROTTLING_ENABLED)
    }

    pub const fn is_cpu_throttling_enabled(&self) -> bool {
        self.has(TENANT_FLAG_CPU_THROTTLING_ENABLED)
    }

    pub const fn is_data_isolation_enabled(&self) -> bool {
        self.has(TENANT_FLAG_DATA_ISOLATION_ENABLED)
    }

    pub const fn is_thread_stop_enabled(&self) -> bool {
        self.has(TENANT_FLAG_THREAD_STOP_ENABLED)
    }

    pub const fn is_iohandle_reclaiming_enabled(&self) -> bool {
        self.has(TENANT_FLAG_IOHANDLE_RECLAIMING_ENABLED)
    }

    pub const fn is_cpu_accounting_enabled(&self) -> bool {
        self.has(TENANT_FLAG_CPU_ACCOUNTING_ENABLED)
    }

    pub const fn is_heap_isolation_enabled(&self) -> bool {
        self.has(TENANT_FLAG_HEAP_ISOLATION_ENABLED)
    }

    pub const fn is_socket_throttling_enabled(&self) -> bool {
        self.has(TENANT_FLAG_SOCKET_THROTTLING_ENABLED)
    }

    /// A resource group is provisioned per container when either CPU
    /// feature is on.
    pub const fn needs_group(&self) -> bool {
        self.is_cpu_throttling_enabled() || self.is_cpu_accounting_enabled()
    }

    pub(crate) fn require_tenant(&self) -> Result<()> {
        if self.is_tenant_enabled() {
            Ok(())
        } else {
            Err(TenantError::FeatureDisabled(
                "the multi-tenant feature is not enabled".to_string(),
            ))
        }
    }
}

impl fmt::Display for TenantFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_has_nothing() {
        let flags = TenantFlags::disabled();
        assert!(!flags.is_tenant_enabled());
        assert!(!flags.is_thread_stop_enabled());
        assert!(flags.require_tenant().is_err());
    }

    #[test]
    fn test_with_and_without() {
        let flags = TenantFlags::with_thread_stop().with(TENANT_FLAG_CPU_ACCOUNTING_ENABLED);
        assert!(flags.is_tenant_enabled());
        assert!(flags.is_thread_stop_enabled());
        assert!(flags.is_cpu_accounting_enabled());
        assert!(flags.needs_group());

        let flags = flags.without(TENANT_FLAG_CPU_ACCOUNTING_ENABLED);
        assert!(!flags.needs_group());
    }

    #[test]
    fn test_parse_hex_and_decimal() {
        assert_eq!(TenantFlags::parse("0x11").unwrap().bits(), 0x11);
        assert_eq!(TenantFlags::parse("17").unwrap().bits(), 0x11);
        assert!(TenantFlags::parse("banana").is_err());
    }

    #[test]
    fn test_unknown_bits_rejected() {
        assert!(TenantFlags::from_bits(0x8000).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(TenantFlags::with_thread_stop().to_string(), "0x11");
    }
}
