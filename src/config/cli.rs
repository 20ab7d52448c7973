use clap::Parser;

#[derive(Parser, Clone, Debug)]
#[command(version, about = "Run a command inside a Linux isolation sandbox", long_about = None,
    override_usage = "warden [OPTIONS] [--] <COMMAND> [ARGS]...")]
pub struct Args {
    /**********************/
    /* Namespace settings */
    /**********************/
    /// Disable PID namespace isolation (also keeps the host /proc)
    #[arg(long)]
    pub no_pid: bool,

    /// Disable IPC namespace isolation
    #[arg(long)]
    pub no_ipc: bool,

    /// Disable network namespace isolation
    #[arg(long)]
    pub no_net: bool,

    /// Disable UTS namespace isolation
    #[arg(long)]
    pub no_uts: bool,

    /// Hostname inside the sandbox
    #[arg(long, default_value = "sandbox")]
    pub hostname: String,

    /************************/
    /* Filesystem isolation */
    /************************/
    /// Enable OverlayFS filesystem isolation
    #[arg(long)]
    pub overlay: bool,

    /// Read-only lower directory for the overlay; repeat for layered
    /// lowers, highest priority first
    #[arg(long = "overlay-lower", default_value = "/")]
    pub overlay_lower: Vec<String>,

    /// tmpfs size cap backing the overlay's writable layer
    #[arg(long, default_value = "64m")]
    pub overlay_size: String,

    /// Mountpoint for the merged overlay tree (defaults to a path inside
    /// the scratch directory)
    #[arg(long)]
    pub overlay_merge: Option<String>,

    /// Mount the overlay without a writable layer
    #[arg(long)]
    pub read_only: bool,

    /// pivot_root into the merged overlay before running the command
    #[arg(long)]
    pub pivot: bool,

    /*******************/
    /* Resource limits */
    /*******************/
    /// Disable cgroups v2 resource limits
    #[arg(long)]
    pub no_cgroup: bool,

    /// CPU quota in microseconds per period (0 = unlimited)
    #[arg(long, default_value_t = 100_000)]
    pub cpu_quota: i64,

    /// CPU period in microseconds
    #[arg(long, default_value_t = 100_000)]
    pub cpu_period: i64,

    /// Memory limit; accepts k/m/g suffixes (0 = unlimited)
    #[arg(long, default_value = "512m")]
    pub memory_max: String,

    /// Maximum number of processes (0 = unlimited)
    #[arg(long, default_value_t = 512)]
    pub pids_max: i64,

    /*******************/
    /* Syscall filter  */
    /*******************/
    /// Disable the seccomp syscall filter
    #[arg(long)]
    pub no_seccomp: bool,

    /// Log denied syscalls instead of killing the process
    #[arg(long)]
    pub seccomp_log: bool,

    /***********/
    /* Logging */
    /***********/
    /// Log file storage directory
    #[arg(long, default_value = "/var/log/warden")]
    pub log_dir: String,

    /// Log level: debug, info, warn, or error
    #[arg(long, default_value = "info", value_parser = parse_log_level)]
    pub log_level: log::LevelFilter,

    /*********************/
    /* Sandboxed command */
    /*********************/
    /// The command to run inside the sandbox, with its arguments
    #[arg(
        trailing_var_arg = true,
        allow_hyphen_values = true,
        num_args = 1..,
        required = true,
        value_name = "COMMAND",
        help_heading = "Sandboxed Command"
    )]
    pub command: Vec<String>,
}

fn parse_log_level(s: &str) -> Result<log::LevelFilter, String> {
    s.parse::<log::LevelFilter>().map_err(|e| e.to_string())
}
