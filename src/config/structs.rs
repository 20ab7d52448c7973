use std::path::PathBuf;

/**
 * The fully resolved launcher configuration: CLI flags plus environment
 * overrides, with human-readable sizes already parsed.
 */
#[derive(Clone, Debug)]
pub struct Config {
    pub log_level: log::LevelFilter,
    pub log_dir: PathBuf,

    pub pid: bool,
    pub ipc: bool,
    pub net: bool,
    pub uts: bool,
    pub hostname: String,

    pub overlay: bool,
    pub overlay_lower: Vec<PathBuf>,
    pub overlay_size: String,
    pub overlay_merge: Option<PathBuf>,
    pub read_only: bool,
    pub pivot: bool,

    pub cgroup: bool,
    pub cpu_quota: i64,
    pub cpu_period: i64,
    pub memory_max: i64,
    pub pids_max: i64,

    pub seccomp: bool,
    pub seccomp_log: bool,

    pub command: Vec<String>,
}
