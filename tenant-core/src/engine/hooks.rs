//! Per-container shutdown hooks
//!
//! Hooks are collected until the container starts destroying itself. At
//! that point the registry is drained and sealed: every later `add` or
//! `remove` is an error.

use crate::error::{Result, TenantError};
use std::fmt;
use tracing::debug;

/// A shutdown hook body.
pub type Hook = Box<dyn FnOnce() + Send + 'static>;

/// Identity of a registered hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookId(u64);

impl fmt::Display for HookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registry of shutdown hooks for one container.
#[derive(Default)]
pub struct ShutdownHooks {
    hooks: Vec<(HookId, Hook)>,
    next_id: u64,
    sealed: bool,
}

impl ShutdownHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, hook: Hook) -> Result<HookId> {
        self.ensure_open()?;
        self.next_id += 1;
        let id = HookId(self.next_id);
        self.hooks.push((id, hook));
        debug!(hook_id = %id, "Registered shutdown hook");
        Ok(id)
    }

    /// Unregister a hook; `Ok(false)` when `id` is unknown.
    pub fn remove(&mut self, id: HookId) -> Result<bool> {
        self.ensure_open()?;
        let before = self.hooks.len();
        self.hooks.retain(|(hook_id, _)| *hook_id != id);
        Ok(self.hooks.len() != before)
    }

    /// Take every hook and seal the registry.
    pub fn drain(&mut self) -> Vec<(HookId, Hook)> {
        self.sealed = true;
        std::mem::take(&mut self.hooks)
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.sealed {
            Err(TenantError::IllegalState("shutdown in progress".to_string()))
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for ShutdownHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownHooks")
            .field("hooks", &self.hooks.len())
            .field("sealed", &self.sealed)
            .finish()
    }
}
