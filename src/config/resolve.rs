use super::cli::Args;
use super::structs::Config;
use anyhow::{Context, Result, anyhow};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

pub fn resolve_config(cli: Args) -> Result<Config> {
    let mut log_level = cli.log_level;
    let mut log_dir = PathBuf::from(&cli.log_dir);

    /* Environment overrides beat the flag defaults */
    if let Ok(level) = env::var("WARDEN_LOG_LEVEL") {
        if !level.is_empty() {
            log_level = log::LevelFilter::from_str(&level)
                .map_err(|_| anyhow!("Invalid log level: {}", level))?;
        }
    }
    if let Ok(dir) = env::var("WARDEN_LOG_DIR") {
        if !dir.is_empty() {
            log_dir = PathBuf::from(dir);
        }
    }

    let memory_max = parse_size(&cli.memory_max).context(format!(
        "invalid --memory-max \"{}\"",
        cli.memory_max
    ))?;

    Ok(Config {
        log_level,
        log_dir,

        pid: !cli.no_pid,
        ipc: !cli.no_ipc,
        net: !cli.no_net,
        uts: !cli.no_uts,
        hostname: cli.hostname,

        overlay: cli.overlay,
        overlay_lower: cli.overlay_lower.into_iter().map(PathBuf::from).collect(),
        overlay_size: cli.overlay_size,
        overlay_merge: cli.overlay_merge.map(PathBuf::from),
        read_only: cli.read_only,
        pivot: cli.pivot,

        cgroup: !cli.no_cgroup,
        cpu_quota: cli.cpu_quota,
        cpu_period: cli.cpu_period,
        memory_max,
        pids_max: cli.pids_max,

        seccomp: !cli.no_seccomp,
        seccomp_log: cli.seccomp_log,

        command: cli.command,
    })
}

/**
 * Parses a human-readable byte size: k/K, m/M, g/G suffixes are base-1024,
 * a bare number is bytes, and "0" means unlimited.
 */
pub fn parse_size(s: &str) -> Result<i64> {
    let s = s.trim();
    if s.is_empty() || s == "0" {
        return Ok(0);
    }

    let (digits, multiplier) = match s.as_bytes()[s.len() - 1] {
        b'k' | b'K' => (&s[..s.len() - 1], 1024),
        b'm' | b'M' => (&s[..s.len() - 1], 1024 * 1024),
        b'g' | b'G' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };

    let n: i64 = digits
        .parse()
        .map_err(|_| anyhow!("invalid size: {}", s))?;
    Ok(n * multiplier)
}
