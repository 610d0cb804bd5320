//! Resource controller adapter
//!
//! A [`Group`] is bound 1:1 to a container and owns the lifetime of the
//! OS-level control group behind it. Containers obtain groups from a
//! [`GroupProvider`] installed on the runtime.
//!
//! [`CgroupProvider`] implements both on top of cgroup v2 with thread
//! granularity: each container gets a `tenant-<id>` directory below the
//! provider root, and threads move in and out through `cgroup.threads`.
//!
//! # Layout
//! ```text
//! $TENANT_CGROUP_ROOT (default /sys/fs/cgroup/tenants)
//! ├── cgroup.threads        <- detached threads go back here
//! └── tenant-<id>/
//!     ├── cgroup.threads
//!     ├── cpu.weight
//!     ├── cpu.max
//!     ├── cpuset.cpus
//!     └── cpu.stat
//! ```

use crate::engine::resource_limits::{shares_to_weight, ResourceLimit};
use crate::engine::thread::ThreadRecord;
use crate::error::{Result, TenantError};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Default root of the tenant control groups.
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup/tenants";

/// Handle to the resource-control group of one container.
pub trait Group: Send + Sync {
    /// Move `thread` into the group.
    fn attach(&self, thread: &ThreadRecord) -> Result<()>;

    /// Move `thread` back out of the group.
    fn detach(&self, thread: &ThreadRecord) -> Result<()>;

    /// Push a controller-backed limit.
    fn sync(&self, limit: &ResourceLimit) -> Result<()>;

    /// CPU time consumed by the group, in nanoseconds.
    fn cpu_time(&self) -> Result<u64>;

    /// Release the group. Called exactly once.
    fn destroy(self: Box<Self>) -> Result<()>;
}

/// Creates a [`Group`] per container.
pub trait GroupProvider: Send + Sync {
    fn create(&self, container_id: u64, name: &str) -> Result<Box<dyn Group>>;
}

/// cgroup v2 backed [`GroupProvider`].
#[derive(Debug, Clone)]
pub struct CgroupProvider {
    root: PathBuf,
}

impl CgroupProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root from `TENANT_CGROUP_ROOT`, or [`DEFAULT_CGROUP_ROOT`].
    pub fn from_env() -> Self {
        let root = std::env::var("TENANT_CGROUP_ROOT")
            .unwrap_or_else(|_| DEFAULT_CGROUP_ROOT.to_string());
        Self::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl GroupProvider for CgroupProvider {
    fn create(&self, container_id: u64, name: &str) -> Result<Box<dyn Group>> {
        let path = self.root.join(format!("tenant-{container_id}"));
        fs::create_dir_all(&path).map_err(|e| {
            TenantError::Group(format!("failed to create {}: {e}", path.display()))
        })?;

        // Thread-granular membership needs a threaded subtree. Plain
        // directories (tests) have no cgroup.type.
        let type_file = path.join("cgroup.type");
        if type_file.exists() {
            fs::write(&type_file, "threaded").map_err(|e| {
                TenantError::Group(format!("failed to make {} threaded: {e}", path.display()))
            })?;
        }

        info!(container_id, name, path = %path.display(), "Created tenant cgroup");
        Ok(Box::new(CgroupGroup {
            path,
            parent: self.root.clone(),
            container_id,
        }))
    }
}

/// One `tenant-<id>` control group.
#[derive(Debug)]
pub struct CgroupGroup {
    path: PathBuf,
    parent: PathBuf,
    container_id: u64,
}

impl CgroupGroup {
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_control(&self, file: &str, value: &str) -> Result<()> {
        debug!(container_id = self.container_id, file, value, "Writing cgroup control file");
        fs::write(self.path.join(file), value)
            .map_err(|e| TenantError::Group(format!("failed to write {file}: {e}")))
    }

    fn move_thread(dir: &Path, tid: i32) -> io::Result<()> {
        let mut threads = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("cgroup.threads"))?;
        writeln!(threads, "{tid}")
    }
}

impl Group for CgroupGroup {
    fn attach(&self, thread: &ThreadRecord) -> Result<()> {
        let tid = thread.os_tid();
        if tid <= 0 {
            return Err(TenantError::Group(format!(
                "thread {} has no kernel id yet",
                thread.id()
            )));
        }
        Self::move_thread(&self.path, tid)
            .map_err(|e| TenantError::Group(format!("failed to attach tid {tid}: {e}")))
    }

    fn detach(&self, thread: &ThreadRecord) -> Result<()> {
        let tid = thread.os_tid();
        if tid <= 0 {
            return Ok(());
        }
        Self::move_thread(&self.parent, tid)
            .map_err(|e| TenantError::Group(format!("failed to detach tid {tid}: {e}")))
    }

    fn sync(&self, limit: &ResourceLimit) -> Result<()> {
        match limit {
            ResourceLimit::CpuShares { shares } => {
                self.write_control("cpu.weight", &shares_to_weight(*shares).to_string())
            }
            ResourceLimit::CpuCfs {
                period_us,
                quota_us,
            } => {
                let quota = if *quota_us < 0 {
                    "max".to_string()
                } else {
                    quota_us.to_string()
                };
                self.write_control("cpu.max", &format!("{quota} {period_us}"))
            }
            ResourceLimit::CpusetCpus { cpus } => self.write_control("cpuset.cpus", cpus),
            other => Err(TenantError::Group(format!(
                "{} is not handled by cgroups",
                other.resource_type()
            ))),
        }
    }

    fn cpu_time(&self) -> Result<u64> {
        let stat = fs::read_to_string(self.path.join("cpu.stat"))?;
        for line in stat.lines() {
            if let Some(value) = line.strip_prefix("usage_usec") {
                let usec: u64 = value
                    .trim()
                    .parse()
                    .map_err(|e| TenantError::Group(format!("bad usage_usec: {e}")))?;
                return Ok(usec * 1_000);
            }
        }
        Err(TenantError::Group("cpu.stat has no usage_usec".to_string()))
    }

    fn destroy(self: Box<Self>) -> Result<()> {
        match fs::remove_dir(&self.path) {
            Ok(()) => {
                info!(container_id = self.container_id, "Removed tenant cgroup");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TenantError::Group(format!(
                "failed to remove {}: {e}",
                self.path.display()
            ))),
        }
    }
}
