//! Process-wide tenant policy and shutdown tuning knobs
//!
//! # Environment
//!
//! | Variable                                  | Meaning                                  |
//! |-------------------------------------------|------------------------------------------|
//! | `TENANT_KILL_THREAD_INTERVAL_MS`          | marking interval of the kill loop        |
//! | `TENANT_DEBUG_SHUTDOWN`                   | verbose kill loop diagnostics            |
//! | `TENANT_SHUTDOWN_STW_SOFT_LIMIT_MS`       | cumulative marking pause budget          |
//! | `TENANT_SHUTDOWN_WALL_SOFT_LIMIT_MS`      | wall-clock budget of the synchronous loop |
//! | `TENANT_PRINT_STACKS_ON_TIMEOUT_DELAY_MS` | dump remaining stacks after this delay   |
//! | `TENANT_THREAD_INHERITANCE`               | new threads inherit the container        |
//! | `TENANT_ALLOW_PER_THREAD_INHERITANCE`     | threads may change their own inheritance |
//!
//! Numeric budgets that are missing or not positive mean "unset".

use crate::error::{Result, TenantError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default marking interval of the kill loop.
pub const DEFAULT_KILL_THREAD_INTERVAL: Duration = Duration::from_millis(20);

/// When only the pause budget is set, the wall-clock ceiling is this many
/// times larger.
pub const WALL_CLOCK_MULTIPLIER: u32 = 16;

/// Tuning of `TenantContainer::destroy` and its kill loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownSettings {
    /// Minimum delay between two marking rounds.
    pub kill_thread_interval: Duration,
    /// Emit per-round diagnostics at `info` level.
    pub debug_shutdown: bool,
    /// Budget for the cumulative time spent in marking rounds.
    pub stw_soft_limit: Option<Duration>,
    /// Budget for the wall-clock time of the synchronous loop.
    pub wall_clock_soft_limit: Option<Duration>,
    /// Dump the stacks of surviving threads once this long after destroy began.
    pub print_stacks_on_timeout_delay: Option<Duration>,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            kill_thread_interval: DEFAULT_KILL_THREAD_INTERVAL,
            debug_shutdown: false,
            stw_soft_limit: None,
            wall_clock_soft_limit: None,
            print_stacks_on_timeout_delay: None,
        }
    }
}

impl ShutdownSettings {
    /// Wall-clock ceiling actually enforced by the kill loop.
    ///
    /// An explicit value wins; otherwise it is derived from the pause budget.
    pub fn effective_wall_clock_limit(&self) -> Option<Duration> {
        self.wall_clock_soft_limit
            .or_else(|| self.stw_soft_limit.map(|d| d * WALL_CLOCK_MULTIPLIER))
    }

    /// True when the kill loop may hand its work to a watchdog.
    pub fn has_soft_limit(&self) -> bool {
        self.effective_wall_clock_limit().is_some()
    }

    fn validate(&self) -> Result<()> {
        if self.kill_thread_interval.is_zero() {
            return Err(TenantError::Config(
                "kill_thread_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Process-wide tenant policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantSettings {
    pub shutdown: ShutdownSettings,
    /// Threads started from inside a container join it by default.
    pub thread_inheritance: bool,
    /// Threads may flip their own inheritance flag.
    pub allow_per_thread_inheritance: bool,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            shutdown: ShutdownSettings::default(),
            thread_inheritance: true,
            allow_per_thread_inheritance: true,
        }
    }
}

impl TenantSettings {
    /// Load settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        let shutdown = &mut settings.shutdown;

        if let Some(interval) = millis(&lookup, "TENANT_KILL_THREAD_INTERVAL_MS")? {
            shutdown.kill_thread_interval = interval;
        }
        if let Some(flag) = boolean(&lookup, "TENANT_DEBUG_SHUTDOWN")? {
            shutdown.debug_shutdown = flag;
        }
        shutdown.stw_soft_limit = millis(&lookup, "TENANT_SHUTDOWN_STW_SOFT_LIMIT_MS")?;
        shutdown.wall_clock_soft_limit = millis(&lookup, "TENANT_SHUTDOWN_WALL_SOFT_LIMIT_MS")?;
        shutdown.print_stacks_on_timeout_delay =
            millis(&lookup, "TENANT_PRINT_STACKS_ON_TIMEOUT_DELAY_MS")?;

        if let Some(flag) = boolean(&lookup, "TENANT_THREAD_INHERITANCE")? {
            settings.thread_inheritance = flag;
        }
        if let Some(flag) = boolean(&lookup, "TENANT_ALLOW_PER_THREAD_INHERITANCE")? {
            settings.allow_per_thread_inheritance = flag;
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.shutdown.validate()
    }
}

fn millis<F>(lookup: &F, key: &str) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let value: i64 = raw
        .trim()
        .parse()
        .map_err(|e| TenantError::Config(format!("{key}='{raw}': {e}")))?;
    if value <= 0 {
        return Ok(None);
    }
    Ok(Some(Duration::from_millis(value as u64)))
}

fn boolean<F>(lookup: &F, key: &str) -> Result<Option<bool>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(TenantError::Config(format!("{key}='{raw}' is not a boolean"))),
    }
}
