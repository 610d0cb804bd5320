//! Error types for tenant container operations

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for tenant container operations
pub type Result<T> = std::result::Result<T, TenantError>;

/// Errors that can occur while operating tenant containers
#[derive(Error, Debug)]
pub enum TenantError {
    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    #[error("Feature disabled: {0}")]
    FeatureDisabled(String),

    #[error("Tenant container {id} is dead")]
    ContainerDead { id: u64 },

    #[error("Thread is attached to tenant {current}, must be in root tenant before running into tenant {target}")]
    IllegalNesting { current: u64, target: u64 },

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Resource group error: {0}")]
    Group(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Returned by cooperative check points once the current thread has been
/// marked for destruction by its container.
///
/// Tenant code is expected to propagate it with `?` until the thread's entry
/// point returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TenantDeath;

impl fmt::Display for TenantDeath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread was terminated by tenant container destroy")
    }
}

impl std::error::Error for TenantDeath {}
