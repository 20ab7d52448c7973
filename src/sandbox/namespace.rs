use crate::logger::read_log_pipe;
use crate::sandbox::cgroups::CgroupsV2;
use crate::sandbox::init::{INIT_PIPE_ENV, INIT_PIPE_FD, INIT_SENTINEL, LOG_PIPE_ENV, LOG_PIPE_FD};
use crate::sandbox::overlayfs::{OverlayFs, OverlayMountSpec};
use crate::sandbox::pivot_root::{PivotRootConfig, PivotSpec};
use crate::sandbox::seccomp::{SeccompConfig, SeccompSpec};
use crate::util::{
    CLONE_NEWIPC, CLONE_NEWNET, CLONE_NEWNS, CLONE_NEWPID, CLONE_NEWUTS,
    Clone3Args, clone3,
};
use anyhow::{Context, Result, anyhow};
use log::{debug, info};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{Pid, pipe2};
use serde::{Deserialize, Serialize};
use std::ffi::CString;
use std::io::Write;
use std::os::fd::{IntoRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/**
 * Which namespaces to unshare for the sandbox and what the child-side init
 * should do inside them. Immutable once the orchestrator is built.
 */
#[derive(Debug, Clone)]
pub struct NamespaceConfig {
    /* Process tree isolation; the command becomes PID 1 */
    pub pid: bool,
    /* System V IPC / POSIX message queue isolation */
    pub ipc: bool,
    /* Mount table isolation; required for the overlay and the pivot */
    pub mount: bool,
    /* Network stack isolation: own interfaces, routes, firewall */
    pub net: bool,
    /* Hostname isolation */
    pub uts: bool,

    /* Init parameters, executed by the child before exec */
    pub hostname: String,
    pub mount_proc: bool,
    pub setup_loopback: bool,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            pid: true,
            ipc: true,
            mount: true,
            net: true,
            uts: true,
            hostname: "sandbox".to_string(),
            mount_proc: true,
            setup_loopback: true,
        }
    }
}

impl NamespaceConfig {
    /* PID and mount isolation only, for workloads that need the host
     * network */
    #[allow(dead_code)]
    pub fn minimal() -> Self {
        Self {
            pid: true,
            ipc: false,
            mount: true,
            net: false,
            uts: false,
            hostname: String::new(),
            mount_proc: true,
            setup_loopback: false,
        }
    }

    pub fn clone_flags(&self) -> u64 {
        let mut flags = 0;
        if self.pid {
            flags |= CLONE_NEWPID;
        }
        if self.ipc {
            flags |= CLONE_NEWIPC;
        }
        if self.mount {
            flags |= CLONE_NEWNS;
        }
        if self.net {
            flags |= CLONE_NEWNET;
        }
        if self.uts {
            flags |= CLONE_NEWUTS;
        }
        flags
    }
}

/**
 * Everything the child needs to build the isolation envelope, serialized
 * as one JSON message over the config pipe. No other state crosses the
 * clone boundary.
 */
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct InitConfig {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub mount_proc: bool,
    #[serde(default)]
    pub setup_loopback: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay: Option<OverlayMountSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pivot_root: Option<PivotSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seccomp: Option<SeccompSpec>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub work_dir: String,
}

/* Outcome of the sandboxed process */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i32,
}

#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceKind {
    Pid,
    Ipc,
    Mount,
    Net,
    Uts,
    User,
}

type CleanupFn = Box<dyn FnOnce() -> Result<()> + Send>;

#[derive(Default)]
struct NamespaceState {
    started: bool,
    running: bool,
    pid: Option<Pid>,
    result: Option<ExecResult>,
    cleanups: Vec<CleanupFn>,
    log_reader: Option<JoinHandle<()>>,
}

/**
 * Drives one sandbox: re-execs this binary as the namespace init stub,
 * feeds it the init descriptor over a private pipe, waits for the user
 * command, and tears the envelope down again.
 *
 * Attached managers are shared; they must stay alive until `cleanup()`
 * has run.
 */
pub struct Namespace {
    config: NamespaceConfig,
    overlayfs: Option<Arc<OverlayFs>>,
    cgroups: Option<Arc<CgroupsV2>>,
    pivot_root: Option<PivotRootConfig>,
    seccomp: Option<SeccompConfig>,
    env: Vec<String>,
    work_dir: Option<PathBuf>,
    state: Mutex<NamespaceState>,
}

impl Namespace {
    pub fn new(config: NamespaceConfig) -> Self {
        Self {
            config,
            overlayfs: None,
            cgroups: None,
            pivot_root: None,
            seccomp: None,
            env: Vec::new(),
            work_dir: None,
            state: Mutex::new(NamespaceState::default()),
        }
    }

    /* All attachments must happen before start() */

    pub fn set_overlayfs(&mut self, ov: Arc<OverlayFs>) {
        self.overlayfs = Some(ov);
    }

    pub fn set_cgroups(&mut self, cg: Arc<CgroupsV2>) {
        self.cgroups = Some(cg);
    }

    pub fn set_pivot_root(&mut self, pivot: PivotRootConfig) {
        self.pivot_root = Some(pivot);
    }

    pub fn set_seccomp(&mut self, seccomp: SeccompConfig) {
        self.seccomp = Some(seccomp);
    }

    /* Environment for the user command; empty means inherit */
    #[allow(dead_code)]
    pub fn set_env(&mut self, env: Vec<String>) {
        self.env = env;
    }

    /* Working directory for the user command */
    #[allow(dead_code)]
    pub fn set_work_dir(&mut self, dir: impl Into<PathBuf>) {
        self.work_dir = Some(dir.into());
    }

    /**
     * Runs the command in the sandbox and blocks until it finishes.
     */
    pub fn execute(
        &self,
        command: &str,
        args: &[String],
    ) -> Result<ExecResult> {
        self.start(command, args)?;
        self.wait()
    }

    /**
     * Starts the command without waiting for it.
     *
     * The child is cloned straight into its new namespaces as a copy of
     * this binary carrying the init sentinel, blocks reading fd 3, gets
     * placed into the cgroup while still blocked, and only then receives
     * the init descriptor. That ordering guarantees no user code ever runs
     * outside the resource limits.
     */
    pub fn start(&self, command: &str, args: &[String]) -> Result<()> {
        let mut state = self.state.lock().expect("namespace state lock");

        if state.started {
            return Err(anyhow!(
                "namespace: process already running (pid={})",
                state.pid.map(Pid::as_raw).unwrap_or(0)
            ));
        }

        /* Remounting /proc without a fresh PID namespace would expose the
         * host's process list inside the sandbox */
        if self.config.mount_proc && !self.config.pid {
            return Err(anyhow!(
                "namespace: mount_proc requires the PID namespace"
            ));
        }

        /* Resolve everything that can still fail cheaply: after this
         * point errors have a child to kill and pipes to close. */
        let seccomp_spec = match &self.seccomp {
            Some(config) => config.init_spec()?,
            None => None,
        };
        let overlay_spec: Option<OverlayMountSpec> =
            self.overlayfs.as_ref().and_then(|ov| ov.init_spec());
        let pivot_spec = match &self.pivot_root {
            Some(pivot) if pivot.enabled => {
                let root_dir = match (&pivot.root_dir, &overlay_spec) {
                    (Some(dir), _) => dir.to_string_lossy().into_owned(),
                    (None, Some(overlay)) => overlay.merge_dir.clone(),
                    (None, None) => {
                        return Err(anyhow!(
                            "namespace: pivot_root needs a root dir or an attached overlay"
                        ));
                    }
                };
                Some(PivotSpec { root_dir })
            }
            _ => None,
        };

        let init_config = InitConfig {
            /* Without a UTS namespace, sethostname would rename the host */
            hostname: if self.config.uts {
                self.config.hostname.clone()
            } else {
                String::new()
            },
            mount_proc: self.config.mount_proc,
            setup_loopback: self.config.setup_loopback,
            overlay: overlay_spec,
            pivot_root: pivot_spec,
            seccomp: seccomp_spec,
            command: command.to_string(),
            args: args.to_vec(),
            env: self.env.clone(),
            work_dir: self
                .work_dir
                .as_ref()
                .map(|d| d.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };

        /* Both pipes are close-on-exec on this side; the child re-arms its
         * ends as fds 3 and 4 before the re-exec. */
        let (config_read, config_write) = pipe2(OFlag::O_CLOEXEC)
            .context("namespace: create config pipe")?;
        let (log_read, log_write) =
            pipe2(OFlag::O_CLOEXEC).context("namespace: create log pipe")?;

        let clone_args = Clone3Args {
            flags: self.config.clone_flags(),
            exit_signal: libc::SIGCHLD as u64,
            ..Default::default()
        };
        let pid =
            clone3(&clone_args).context("namespace: clone3 failed")?;

        if pid.as_raw() == 0 {
            /* Child: nothing but fd shuffling and the re-exec happens
             * here; all real initialization runs after the exec, behind
             * the sentinel. */
            exec_init_stub(config_read, log_write);
        }

        /* Parent: close the child-facing ends */
        drop(config_read);
        drop(log_write);

        let log_reader = std::thread::spawn(move || {
            read_log_pipe(std::fs::File::from(log_read));
        });

        /* Into the cgroup before it can execute anything */
        if let Some(cg) = &self.cgroups {
            if let Err(e) = cg.add_process(pid) {
                let _ = kill(pid, Signal::SIGKILL);
                let _ = waitpid(pid, None);
                drop(config_write);
                let _ = log_reader.join();
                return Err(e)
                    .context("namespace: add process to cgroup");
            }
        }

        /* Release the child by sending the descriptor and closing the
         * pipe; the child reads to EOF. */
        let send_result = serde_json::to_vec(&init_config)
            .context("namespace: encode init config")
            .and_then(|payload| {
                debug!("sending init descriptor ({} bytes)", payload.len());
                let mut pipe = std::fs::File::from(config_write);
                pipe.write_all(&payload)
                    .context("namespace: send init config")
            });
        if let Err(e) = send_result {
            let _ = kill(pid, Signal::SIGKILL);
            let _ = waitpid(pid, None);
            let _ = log_reader.join();
            return Err(e);
        }

        info!(
            "namespace started: pid={} pid_ns={} net_ns={} mount_ns={}",
            pid, self.config.pid, self.config.net, self.config.mount
        );

        state.started = true;
        state.running = true;
        state.pid = Some(pid);
        state.log_reader = Some(log_reader);

        /* Teardown order is the reverse of this registration order: the
         * cgroup goes before the overlay, and cleanup() kills the child
         * before either. */
        if let Some(ov) = &self.overlayfs {
            let ov = Arc::clone(ov);
            state.cleanups.push(Box::new(move || ov.cleanup()));
        }
        if let Some(cg) = &self.cgroups {
            let cg = Arc::clone(cg);
            state.cleanups.push(Box::new(move || cg.cleanup()));
        }

        Ok(())
    }

    /**
     * Blocks until the child exits and translates its status. Idempotent
     * once the first call has captured the status.
     */
    pub fn wait(&self) -> Result<ExecResult> {
        let pid = {
            let state = self.state.lock().expect("namespace state lock");
            if let Some(result) = state.result {
                return Ok(result);
            }
            match state.pid {
                Some(pid) if state.running => pid,
                _ => return Err(anyhow!("namespace: no running process")),
            }
        };

        let wait_result = waitpid(pid, None);

        let mut state = self.state.lock().expect("namespace state lock");
        match wait_result {
            Ok(status) => {
                let result = ExecResult {
                    exit_code: exit_code_from_status(&status),
                };
                state.result = Some(result);
                state.running = false;
                Ok(result)
            }
            /* A concurrent waiter or cleanup() reaped the child first */
            Err(e) => match state.result {
                Some(result) => Ok(result),
                None => Err(anyhow!("namespace: wait: {}", e)),
            },
        }
    }

    /* Sends a signal to the sandboxed process */
    #[allow(dead_code)]
    pub fn signal(&self, sig: Signal) -> Result<()> {
        let state = self.state.lock().expect("namespace state lock");
        match state.pid {
            Some(pid) if state.running => kill(pid, sig)
                .context(format!("namespace: signal {} to {}", sig, pid)),
            _ => Err(anyhow!("namespace: no running process")),
        }
    }

    /**
     * Kills the child if it is still alive, joins the log reader, then
     * runs the registered cleanups in reverse registration order,
     * collecting their errors. Safe to call repeatedly.
     */
    pub fn cleanup(&self) -> Result<()> {
        let (pid, log_reader, cleanups) = {
            let mut state = self.state.lock().expect("namespace state lock");
            let pid = if state.running { state.pid } else { None };
            state.running = false;
            (
                pid,
                state.log_reader.take(),
                std::mem::take(&mut state.cleanups),
            )
        };

        let mut errs: Vec<String> = Vec::new();

        if let Some(pid) = pid {
            info!("namespace cleanup: killing pid {}", pid);
            if let Err(e) = kill(pid, Signal::SIGKILL) {
                if e != Errno::ESRCH {
                    errs.push(format!("kill pid {}: {}", pid, e));
                }
            }
            let _ = waitpid(pid, None);
        }

        /* EOF on the log pipe is guaranteed once the child is gone */
        if let Some(reader) = log_reader {
            let _ = reader.join();
        }

        for cleanup in cleanups.into_iter().rev() {
            if let Err(e) = cleanup() {
                errs.push(format!("{:#}", e));
            }
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("namespace cleanup errors: {}", errs.join("; ")))
        }
    }

    /**
     * Registers an extra teardown step; cleanup() runs all registered
     * steps exactly once, last registered first.
     */
    pub fn add_cleanup(
        &self,
        cleanup: impl FnOnce() -> Result<()> + Send + 'static,
    ) {
        self.state
            .lock()
            .expect("namespace state lock")
            .cleanups
            .push(Box::new(cleanup));
    }

    /* Host PID of the sandboxed process; None before start */
    #[allow(dead_code)]
    pub fn pid(&self) -> Option<Pid> {
        self.state.lock().expect("namespace state lock").pid
    }

    #[allow(dead_code)]
    pub fn running(&self) -> bool {
        self.state.lock().expect("namespace state lock").running
    }

    #[allow(dead_code)]
    pub fn config(&self) -> &NamespaceConfig {
        &self.config
    }

    /* procfs path of one of the child's namespaces, e.g.
     * /proc/<pid>/ns/mnt */
    #[allow(dead_code)]
    pub fn ns_path(&self, kind: NamespaceKind) -> Option<PathBuf> {
        let name = match kind {
            NamespaceKind::Pid => "pid",
            NamespaceKind::Ipc => "ipc",
            NamespaceKind::Mount => "mnt",
            NamespaceKind::Net => "net",
            NamespaceKind::Uts => "uts",
            NamespaceKind::User => "user",
        };
        self.pid()
            .map(|pid| PathBuf::from(format!("/proc/{}/ns/{}", pid, name)))
    }
}

fn exit_code_from_status(status: &WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => *code,
        /* Shell convention for a signal death */
        WaitStatus::Signaled(_, sig, _) => 128 + *sig as i32,
        _ => 1,
    }
}

/**
 * Runs in the cloned child, already inside the new namespaces. Re-arms the
 * pipe descriptors as fds 3/4 and replaces the process image with this
 * binary carrying the init sentinel, so the init pipeline starts from a
 * clean, single-threaded program entry.
 */
fn exec_init_stub(config_read: OwnedFd, log_write: OwnedFd) -> ! {
    let result = (|| -> Result<()> {
        install_fd(config_read, INIT_PIPE_FD)?;
        install_fd(log_write, LOG_PIPE_FD)?;

        let mut envp: Vec<CString> = Vec::new();
        for (key, value) in std::env::vars() {
            if key == INIT_PIPE_ENV || key == LOG_PIPE_ENV {
                continue;
            }
            envp.push(CString::new(format!("{}={}", key, value))?);
        }
        envp.push(CString::new(format!(
            "{}={}",
            INIT_PIPE_ENV, INIT_PIPE_FD
        ))?);
        envp.push(CString::new(format!(
            "{}={}",
            LOG_PIPE_ENV, LOG_PIPE_FD
        ))?);

        let exe = CString::new("/proc/self/exe")?;
        let sentinel = CString::new(INIT_SENTINEL)?;
        let argv = [exe.as_c_str(), sentinel.as_c_str()];
        let envp_ref: Vec<&std::ffi::CStr> =
            envp.iter().map(|e| e.as_c_str()).collect();

        let Err(e) = nix::unistd::execve(&exe, &argv, &envp_ref);
        Err(anyhow!("re-exec /proc/self/exe: {}", e))
    })();

    if let Err(e) = result {
        eprintln!("sandbox init stub: {:#}", e);
    }
    std::process::exit(1);
}

/* Installs an inherited descriptor at a fixed number and clears its
 * close-on-exec flag so it survives the re-exec. */
fn install_fd(fd: OwnedFd, target: RawFd) -> Result<()> {
    let raw = fd.into_raw_fd();
    if raw == target {
        if unsafe { libc::fcntl(raw, libc::F_SETFD, 0) } == -1 {
            return Err(anyhow!(
                "fcntl(F_SETFD, 0) on fd {}: {}",
                raw,
                std::io::Error::last_os_error()
            ));
        }
    } else if unsafe { libc::dup2(raw, target) } == -1 {
        return Err(anyhow!(
            "dup2({}, {}): {}",
            raw,
            target,
            std::io::Error::last_os_error()
        ));
    }
    Ok(())
}
