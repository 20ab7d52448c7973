use crate::logger::write_init_log;
use crate::sandbox::namespace::InitConfig;
use crate::sandbox::overlayfs::mount_overlay;
use crate::sandbox::pivot_root::{do_pivot_root, setup_minimal_dev};
use crate::sandbox::seccomp::apply_seccomp;
use crate::util::mount;
use anyhow::{Context, Result, anyhow};
use nix::mount::{MntFlags, MsFlags, umount2};
use nix::unistd::execvpe;
use std::ffi::CString;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{FromRawFd, RawFd};
use std::path::Path;

/* The argv[1] token that routes a re-exec of this binary into the init
 * pipeline instead of the normal CLI. */
pub const INIT_SENTINEL: &str = "__sandbox_init__";

/* Environment variables carrying the pipe descriptors into the child.
 * They are stripped from the user command's environment. */
pub const INIT_PIPE_ENV: &str = "_SANDBOX_INIT_PIPE";
pub const LOG_PIPE_ENV: &str = "_SANDBOX_LOG_PIPE";

pub const INIT_PIPE_FD: RawFd = 3;
pub const LOG_PIPE_FD: RawFd = 4;

/**
 * Checks whether this process is a sandbox init child and, if so, runs the
 * init pipeline and execs the user command. It never returns.
 *
 * Must be the very first call in main(), before the logger, the CLI
 * parser, or anything else that could allocate threads or global state:
 * the parent re-execs `/proc/self/exe` with the sentinel in argv[1], and
 * the branch must happen at a point where both process images are still
 * identical.
 */
pub fn maybe_run_init() {
    let is_init = std::env::args_os()
        .nth(1)
        .is_some_and(|arg| arg == INIT_SENTINEL);
    if !is_init {
        return;
    }

    let mut log = InitLog::from_env();
    if let Err(e) = ns_init(&mut log) {
        log.error(&format!("init failed: {:#}", e));
        eprintln!("sandbox init: {:#}", e);
        std::process::exit(1);
    }

    /* ns_init replaces the process image on success */
    std::process::exit(1);
}

/**
 * Child-side log sink: the log pipe when the parent attached one, stderr
 * otherwise. The init pipeline has no logger of its own.
 */
struct InitLog {
    pipe: Option<File>,
}

impl InitLog {
    fn from_env() -> Self {
        let pipe = std::env::var(LOG_PIPE_ENV)
            .ok()
            .and_then(|fd| fd.parse::<RawFd>().ok())
            .map(|fd| unsafe { File::from_raw_fd(fd) });
        Self { pipe }
    }

    fn warn(&mut self, msg: &str) {
        self.write("warn", msg);
    }

    fn error(&mut self, msg: &str) {
        self.write("error", msg);
    }

    fn write(&mut self, level: &str, msg: &str) {
        match &mut self.pipe {
            Some(pipe) => write_init_log(pipe, level, msg),
            None => {
                let _ = writeln!(std::io::stderr(), "sandbox init: {}", msg);
            }
        }
    }

    /* The user command must not inherit the write end */
    fn close(&mut self) {
        self.pipe.take();
    }
}

/**
 * The init pipeline. Runs single-threaded inside the cloned child, in
 * strict order:
 *
 *  1.  read the init descriptor from the config pipe (fd 3)
 *  2.  make mount propagation private (non-fatal)
 *  3.  mount the overlay (fatal)
 *  4.  populate /dev in the new root and pivot into it (fatal)
 *  5.  remount /proc (non-fatal)
 *  6.  sethostname (non-fatal)
 *  7.  bring up loopback (non-fatal)
 *  8.  close the log pipe
 *  9.  chdir to the work dir (fatal)
 *  10. install the seccomp filter (fatal); no syscall but exec follows
 *  11. scrub the environment
 *  12. exec the user command
 */
fn ns_init(log: &mut InitLog) -> Result<()> {
    let config = read_init_config()?;

    /* Stop mount events from propagating back to the host. Some hosts
     * are already private, so a failure is only worth a warning. */
    let null: Option<&str> = None;
    if let Err(e) = mount(
        null,
        "/",
        null,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        null,
    ) {
        log.warn(&format!("mount / private: {:#} (non-fatal)", e));
    }

    /* A failed overlay means no filesystem boundary at all */
    if let Some(overlay) = &config.overlay {
        mount_overlay(overlay).context("mount overlay")?;
    }

    if let Some(pivot) = &config.pivot_root {
        /* The bind sources for /dev live in the old root, so the device
         * directory has to be built before the pivot detaches it. */
        setup_minimal_dev(&pivot.root_dir)
            .context(format!("setup /dev in {}", pivot.root_dir))?;
        do_pivot_root(&pivot.root_dir)
            .context(format!("pivot_root to {}", pivot.root_dir))?;
    }

    /* Fresh /proc so ps and friends see the new PID namespace */
    if config.mount_proc {
        if let Err(e) = mount_proc() {
            log.warn(&format!("mount /proc: {:#} (non-fatal)", e));
        }
    }

    if !config.hostname.is_empty() {
        if let Err(e) = nix::unistd::sethostname(&config.hostname) {
            log.warn(&format!("sethostname: {} (non-fatal)", e));
        }
    }

    if config.setup_loopback {
        if let Err(e) = setup_loopback() {
            log.warn(&format!("setup lo: {:#} (non-fatal)", e));
        }
    }

    log.close();

    if !config.work_dir.is_empty() {
        nix::unistd::chdir(Path::new(&config.work_dir))
            .context(format!("chdir to {}", config.work_dir))?;
    }

    /* Last fatal step: once the filter is loaded, every remaining init
     * syscall is subject to it too, so only the exec may follow. */
    if let Some(spec) = &config.seccomp {
        apply_seccomp(spec).context("install seccomp filter")?;
    }

    let env = build_clean_env(&config.env);

    if config.command.is_empty() {
        return Err(anyhow!("no command specified"));
    }

    let command = CString::new(config.command.as_str())
        .context("command contains a NUL byte")?;
    let args: Vec<CString> = config
        .args
        .iter()
        .map(|a| CString::new(a.as_str()))
        .collect::<Result<_, _>>()
        .context("argument contains a NUL byte")?;
    let argv: Vec<&std::ffi::CStr> = std::iter::once(command.as_c_str())
        .chain(args.iter().map(|a| a.as_c_str()))
        .collect();
    let envp: Vec<CString> = env
        .iter()
        .map(|e| CString::new(e.as_str()))
        .collect::<Result<_, _>>()
        .context("environment entry contains a NUL byte")?;
    let envp_ref: Vec<&std::ffi::CStr> =
        envp.iter().map(|e| e.as_c_str()).collect();

    /* Resolves the command against PATH and replaces the process image.
     * This is the last line of init that can ever run. */
    let Err(e) = execvpe(&command, &argv, &envp_ref);
    Err(anyhow!("exec {}: {}", config.command, e))
}

fn read_init_config() -> Result<InitConfig> {
    let fd_str = std::env::var(INIT_PIPE_ENV)
        .context(format!("env {} not set", INIT_PIPE_ENV))?;
    let fd: RawFd = fd_str
        .parse()
        .context(format!("invalid pipe fd {:?}", fd_str))?;

    let mut pipe = unsafe { File::from_raw_fd(fd) };
    let mut payload = Vec::new();
    pipe.read_to_end(&mut payload)
        .context("read init config pipe")?;

    serde_json::from_slice(&payload).context("decode init config")
}

/* Detach whatever /proc the host namespace left behind, then mount one
 * that reflects the new PID namespace. */
fn mount_proc() -> Result<()> {
    let _ = umount2("/proc", MntFlags::MNT_DETACH);
    let null: Option<&str> = None;
    mount(Some("proc"), "/proc", Some("proc"), MsFlags::empty(), null)
}

/* A fresh network namespace has lo, but DOWN */
fn setup_loopback() -> Result<()> {
    let output = std::process::Command::new("ip")
        .args(["link", "set", "lo", "up"])
        .output()
        .context("run ip link set lo up")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!(
            "ip link set lo up: {}",
            stderr.trim()
        ));
    }
    Ok(())
}

/**
 * Environment for the user command: the configured set, or the inherited
 * one when none was configured, minus the internal pipe variables.
 */
fn build_clean_env(user_env: &[String]) -> Vec<String> {
    let base: Vec<String> = if user_env.is_empty() {
        std::env::vars().map(|(k, v)| format!("{}={}", k, v)).collect()
    } else {
        user_env.to_vec()
    };

    base.into_iter()
        .filter(|entry| {
            !entry.starts_with(&format!("{}=", INIT_PIPE_ENV))
                && !entry.starts_with(&format!("{}=", LOG_PIPE_ENV))
        })
        .collect()
}
