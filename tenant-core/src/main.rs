//! Tenant - multi-tenancy demo driver
//!
//! Builds a runtime from the environment, starts a container with a few
//! busy workers, destroys it and prints what happened as JSON.

use anyhow::{bail, Context, Result};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tenant_core::{
    init, thread, CgroupProvider, TenantConfiguration, TenantFlags, TenantRuntime, TenantSettings,
};
use tracing::info;

const DEFAULT_WORKERS: usize = 4;

fn print_help() {
    println!("tenant - in-process multi-tenancy v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("USAGE:");
    println!("  tenant [OPTIONS] [demo [--workers N]]");
    println!();
    println!("OPTIONS:");
    println!("  -h, --help       Print this help message");
    println!("  -v, --version    Print version information");
    println!();
    println!("COMMANDS:");
    println!("  demo             Run busy workers in a tenant, then destroy it");
    println!();
    println!("ENVIRONMENT:");
    println!("  TENANT_FLAGS                     feature bitmask (thread stop is forced on for the demo)");
    println!("  TENANT_KILL_THREAD_INTERVAL_MS   marking interval of the kill loop");
    println!("  TENANT_SHUTDOWN_STW_SOFT_LIMIT_MS pause budget before a watchdog takes over");
    println!("  TENANT_CGROUP_ROOT               cgroup v2 root for CPU throttling/accounting");
    println!("  RUST_LOG                         log filter (default: info)");
}

fn parse_workers(value: Option<&String>) -> Result<usize> {
    let raw = value.context("--workers needs a value")?;
    let workers: usize = raw
        .parse()
        .with_context(|| format!("invalid worker count '{raw}'"))?;
    if workers == 0 {
        bail!("--workers must be at least 1");
    }
    Ok(workers)
}

fn build_runtime() -> Result<TenantRuntime> {
    let flags = TenantFlags::from_env()
        .context("failed to read TENANT_FLAGS")?
        .with(tenant_core::globals::TENANT_FLAG_MULTI_TENANT_ENABLED)
        .with(tenant_core::globals::TENANT_FLAG_THREAD_STOP_ENABLED);
    let settings = TenantSettings::from_env().context("failed to read tenant settings")?;

    let mut builder = TenantRuntime::builder().flags(flags).settings(settings);
    if flags.needs_group() {
        builder = builder.group_provider(Arc::new(CgroupProvider::from_env()));
    }
    builder.build().context("failed to build tenant runtime")
}

fn run_demo(workers: usize) -> Result<()> {
    let runtime = build_runtime()?;
    let container = runtime
        .create_named("demo", TenantConfiguration::new())
        .context("failed to create demo tenant")?;

    let iterations = Arc::new(AtomicU64::new(0));
    let mut handles = Vec::with_capacity(workers);
    for i in 0..workers {
        let counter = Arc::clone(&iterations);
        let handle = container
            .spawn(format!("demo-worker-{i}"), move || {
                while thread::checkpoint().is_ok() {
                    counter.fetch_add(1, Ordering::Relaxed);
                    std::hint::spin_loop();
                }
            })
            .with_context(|| format!("failed to spawn worker {i}"))?;
        handles.push(handle);
    }
    info!(workers, container_id = container.id(), "Workers started");

    std::thread::sleep(Duration::from_millis(50));
    let before = container.stats();
    let outcome = container.destroy().context("failed to destroy demo tenant")?;
    let watchdog = container.join_watchdog();

    let mut joined = 0usize;
    for handle in handles {
        if handle.join().is_ok() {
            joined += 1;
        }
    }

    let report = json!({
        "container": before,
        "outcome": outcome,
        "watchdog": watchdog,
        "workers_joined": joined,
        "iterations": iterations.load(Ordering::Relaxed),
        "metrics": runtime.metrics(),
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("failed to render report")?
    );

    runtime.shutdown().context("failed to shut down tenant runtime")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let mut demo = false;
    let mut workers = DEFAULT_WORKERS;

    let mut rest = args.iter().skip(1);
    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(());
            }
            "-v" | "--version" => {
                println!("tenant {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "demo" => demo = true,
            "--workers" if demo => workers = parse_workers(rest.next())?,
            _ => {
                eprintln!("error: unrecognized argument '{}'", arg);
                eprintln!("Run 'tenant --help' for usage information.");
                std::process::exit(1);
            }
        }
    }

    init().await?;

    if !demo {
        info!("Nothing to do; run 'tenant demo' or 'tenant --help'");
        return Ok(());
    }

    tokio::task::spawn_blocking(move || run_demo(workers))
        .await
        .context("demo task failed")?
}
