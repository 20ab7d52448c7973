#![deny(
    clippy::get_unwrap,
    clippy::panic,
    clippy::print_stdout,
    clippy::unwrap_used
)]

mod config;
mod logger;
mod sandbox;
mod util;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use config::Config;
use log::warn;
use nix::unistd::geteuid;
use sandbox::{
    CgroupsConfig, CgroupsV2, Namespace, NamespaceConfig, OverlayConfig,
    OverlayFs, PivotRootConfig, SeccompConfig,
};
use std::sync::Arc;

fn main() {
    /* Must come before the logger, the CLI parser and anything else: a
     * re-exec'd init child has to branch while the process image is still
     * pristine. */
    sandbox::maybe_run_init();

    let args = config::cli::Args::parse();
    let config = match config::resolve_config(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("warden: {:#}", e);
            std::process::exit(1);
        }
    };

    let log_config = logger::LogConfig {
        level: config.log_level,
        dir: config.log_dir.clone(),
        console: true,
    };
    let logger = match logger::SandboxLogger::new(&log_config) {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("warden: {:#}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = logger.init() {
        eprintln!("warden: {:#}", e);
        std::process::exit(1);
    }

    match run(&config) {
        Ok(exit_code) => {
            log::logger().flush();
            std::process::exit(exit_code);
        }
        Err(e) => {
            eprintln!("warden: {:#}", e);
            log::logger().flush();
            std::process::exit(1);
        }
    }
}

/* The child's exit code is propagated verbatim; our own setup failures
 * exit 1 via main. */
fn run(config: &Config) -> Result<i32> {
    /* Namespace creation needs CAP_SYS_ADMIN */
    if !geteuid().is_root() {
        return Err(anyhow!(
            "Insufficient permissions to create the sandbox, please retry using `sudo`"
        ));
    }

    let mut ns_config = NamespaceConfig {
        hostname: config.hostname.clone(),
        ..NamespaceConfig::default()
    };
    if !config.pid {
        ns_config.pid = false;
        ns_config.mount_proc = false;
    }
    if !config.ipc {
        ns_config.ipc = false;
    }
    if !config.net {
        ns_config.net = false;
        ns_config.setup_loopback = false;
    }
    if !config.uts {
        ns_config.uts = false;
    }

    let mut ns = Namespace::new(ns_config);

    let overlay = if config.overlay {
        let ov = Arc::new(OverlayFs::new(OverlayConfig {
            enabled: true,
            lower_dirs: config.overlay_lower.clone(),
            merge_dir: config.overlay_merge.clone(),
            tmpfs_size: config.overlay_size.clone(),
            read_only: config.read_only,
            ..OverlayConfig::default()
        }));
        ov.setup().context("overlay setup")?;
        ns.set_overlayfs(Arc::clone(&ov));
        Some(ov)
    } else {
        if config.pivot {
            return Err(anyhow!("--pivot requires --overlay"));
        }
        None
    };

    if config.pivot {
        ns.set_pivot_root(PivotRootConfig::default());
    }

    let cgroups = if config.cgroup {
        let cg = Arc::new(CgroupsV2::new(CgroupsConfig {
            enabled: true,
            cpu_quota: config.cpu_quota,
            cpu_period: config.cpu_period,
            memory_max: config.memory_max,
            pids_max: config.pids_max,
            ..CgroupsConfig::default()
        }));
        if let Err(e) = cg.setup() {
            if let Some(ov) = &overlay {
                let _ = ov.cleanup();
            }
            return Err(e).context("cgroup setup");
        }
        ns.set_cgroups(Arc::clone(&cg));
        Some(cg)
    } else {
        None
    };

    if config.seccomp {
        ns.set_seccomp(SeccompConfig {
            log_denied: config.seccomp_log,
            ..SeccompConfig::default()
        });
    }

    let (command, args) = config
        .command
        .split_first()
        .ok_or_else(|| anyhow!("no command specified"))?;

    let result = match ns.execute(command, args) {
        Ok(result) => result,
        Err(e) => {
            /* A failed start may not have registered the manager
             * teardowns yet; their cleanups are idempotent, so running
             * them again directly is harmless. */
            let _ = ns.cleanup();
            if let Some(cg) = &cgroups {
                let _ = cg.cleanup();
            }
            if let Some(ov) = &overlay {
                let _ = ov.cleanup();
            }
            return Err(e);
        }
    };

    if let Err(e) = ns.cleanup() {
        /* Residual state is diagnostic; it never changes the exit code */
        warn!("cleanup: {:#}", e);
    }

    Ok(result.exit_code)
}
