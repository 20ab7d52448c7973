use crate::sandbox::generate_id;
use anyhow::{Context, Result, anyhow};
use log::{debug, info};
use nix::unistd::Pid;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CgroupsConfig {
    pub enabled: bool,
    /* CPU quota in microseconds per period; 0 = unlimited. 100000 = 1 core. */
    pub cpu_quota: i64,
    /* CPU period in microseconds; defaults to 100000 when unset. */
    pub cpu_period: i64,
    /* Memory ceiling in bytes; 0 = unlimited. */
    pub memory_max: i64,
    /* Process count ceiling; 0 = unlimited. */
    pub pids_max: i64,
    /* cgroup2 mountpoint. */
    pub base_dir: PathBuf,
}

impl Default for CgroupsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cpu_quota: 100_000,
            cpu_period: 100_000,
            memory_max: 512 * 1024 * 1024,
            pids_max: 512,
            base_dir: PathBuf::from("/sys/fs/cgroup"),
        }
    }
}

/* cgroups v2 is detectable by the controllers list in the hierarchy root */
#[allow(dead_code)]
pub fn cgroups_v2_available() -> bool {
    Path::new("/sys/fs/cgroup/cgroup.controllers").exists()
}

#[derive(Default)]
struct CgroupState {
    id: String,
    cgroup_dir: PathBuf,
    setup_done: bool,
}

/**
 * Manages one sandbox's cgroup-v2 directory: creation, controller
 * enablement, limit files, process membership and reclamation.
 */
pub struct CgroupsV2 {
    config: CgroupsConfig,
    state: Mutex<CgroupState>,
}

impl CgroupsV2 {
    pub fn new(config: CgroupsConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CgroupState::default()),
        }
    }

    /**
     * Creates `<base>/sandbox-<id>`, enables the controllers implied by the
     * strictly positive limits, and writes the limit files. Any write
     * failure removes the directory again and surfaces the error.
     */
    pub fn setup(&self) -> Result<()> {
        let mut state = self.state.lock().expect("cgroup state lock");

        if state.setup_done {
            return Err(anyhow!("cgroups: already set up"));
        }
        if !self.config.enabled {
            return Err(anyhow!("cgroups: not enabled"));
        }

        if self.config.cpu_quota < 0 {
            return Err(anyhow!(
                "cgroups: cpu quota must be non-negative, got {}",
                self.config.cpu_quota
            ));
        }
        if self.config.cpu_period < 0 {
            return Err(anyhow!(
                "cgroups: cpu period must be non-negative, got {}",
                self.config.cpu_period
            ));
        }
        if self.config.memory_max < 0 {
            return Err(anyhow!(
                "cgroups: memory max must be non-negative, got {}",
                self.config.memory_max
            ));
        }
        if self.config.pids_max < 0 {
            return Err(anyhow!(
                "cgroups: pids max must be non-negative, got {}",
                self.config.pids_max
            ));
        }

        let base_dir = &self.config.base_dir;
        let controllers_path = base_dir.join("cgroup.controllers");
        if !controllers_path.exists() {
            return Err(anyhow!(
                "cgroups: v2 not available (cannot stat {})",
                controllers_path.display()
            ));
        }

        /* Only the controllers we actually limit with get enabled */
        let mut controllers: Vec<&str> = Vec::new();
        if self.config.cpu_quota > 0 {
            controllers.push("cpu");
        }
        if self.config.memory_max > 0 {
            controllers.push("memory");
        }
        if self.config.pids_max > 0 {
            controllers.push("pids");
        }

        if !controllers.is_empty() {
            enable_controllers(base_dir, &controllers)
                .context("cgroups: enable controllers")?;
        }

        let id = generate_id();
        let cgroup_dir = base_dir.join(format!("sandbox-{}", id));

        let mut builder = std::fs::DirBuilder::new();
        builder.mode(0o755);
        builder.create(&cgroup_dir).context(format!(
            "cgroups: mkdir {}",
            cgroup_dir.display()
        ))?;

        if let Err(e) = self.write_limits(&cgroup_dir) {
            let _ = std::fs::remove_dir(&cgroup_dir);
            return Err(e);
        }

        info!(
            "cgroup {} ready: cpu={}/{} memory={} pids={}",
            id,
            self.config.cpu_quota,
            self.config.cpu_period,
            self.config.memory_max,
            self.config.pids_max
        );

        state.id = id;
        state.cgroup_dir = cgroup_dir;
        state.setup_done = true;

        Ok(())
    }

    fn write_limits(&self, cgroup_dir: &Path) -> Result<()> {
        /* cpu.max takes "<quota> <period>" */
        if self.config.cpu_quota > 0 {
            let period = if self.config.cpu_period > 0 {
                self.config.cpu_period
            } else {
                100_000
            };
            let content = format!("{} {}", self.config.cpu_quota, period);
            write_file(&cgroup_dir.join("cpu.max"), &content)
                .context("cgroups: write cpu.max")?;
        }

        if self.config.memory_max > 0 {
            write_file(
                &cgroup_dir.join("memory.max"),
                &self.config.memory_max.to_string(),
            )
            .context("cgroups: write memory.max")?;
        }

        if self.config.pids_max > 0 {
            write_file(
                &cgroup_dir.join("pids.max"),
                &self.config.pids_max.to_string(),
            )
            .context("cgroups: write pids.max")?;
        }

        Ok(())
    }

    /**
     * Places a process into this cgroup. Must happen before the child is
     * released from its config-pipe read so that no user code runs outside
     * the limits; a failure here breaks the resource boundary and is fatal
     * to the whole start sequence.
     */
    pub fn add_process(&self, pid: Pid) -> Result<()> {
        let state = self.state.lock().expect("cgroup state lock");

        if !state.setup_done {
            return Err(anyhow!("cgroups: not set up"));
        }

        let procs_path = state.cgroup_dir.join("cgroup.procs");
        write_file(&procs_path, &pid.as_raw().to_string()).context(
            format!("cgroups: add pid {} to {}", pid, procs_path.display()),
        )?;

        info!("cgroup {}: added pid {}", state.id, pid);
        Ok(())
    }

    /**
     * Migrates any residual processes back to the parent cgroup, then
     * removes the directory. A zombie that has not been reaped yet makes
     * rmdir fail with EBUSY, so that case gets one 10ms retry. Idempotent
     * after success; ENOENT counts as success.
     */
    pub fn cleanup(&self) -> Result<()> {
        let mut state = self.state.lock().expect("cgroup state lock");
        if !state.setup_done {
            return Ok(());
        }

        info!("cgroup {} cleanup", state.id);

        let parent_procs = self.config.base_dir.join("cgroup.procs");
        let residual = read_pids(&state.cgroup_dir);
        if !residual.is_empty() {
            debug!(
                "cgroup {}: migrating {} residual pids",
                state.id,
                residual.len()
            );
        }
        for pid in residual {
            /* The process may already be gone; individual failures don't
             * block the teardown */
            let _ = write_file(&parent_procs, &pid.to_string());
        }

        let result = remove_cgroup_dir(&state.cgroup_dir);
        state.setup_done = false;
        result
    }

    pub fn id(&self) -> Option<String> {
        let state = self.state.lock().expect("cgroup state lock");
        state.setup_done.then(|| state.id.clone())
    }

    pub fn cgroup_dir(&self) -> Option<PathBuf> {
        let state = self.state.lock().expect("cgroup state lock");
        state.setup_done.then(|| state.cgroup_dir.clone())
    }
}

fn remove_cgroup_dir(dir: &Path) -> Result<()> {
    match std::fs::remove_dir(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(_) => {
            std::thread::sleep(Duration::from_millis(10));
            match std::fs::remove_dir(dir) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => {
                    Err(e).context(format!("cgroups: rmdir {}", dir.display()))
                }
            }
        }
    }
}

/* Writes "+cpu +memory +pids" (only the requested ones) so the children of
 * the hierarchy root can carry those controllers. */
fn enable_controllers(base_dir: &Path, controllers: &[&str]) -> Result<()> {
    let content = controllers
        .iter()
        .map(|c| format!("+{}", c))
        .collect::<Vec<_>>()
        .join(" ");
    write_file(&base_dir.join("cgroup.subtree_control"), &content)
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    std::fs::write(path, content)
        .context(format!("failed to write {}", path.display()))
}

fn read_pids(cgroup_dir: &Path) -> Vec<i32> {
    let data =
        match std::fs::read_to_string(cgroup_dir.join("cgroup.procs")) {
            Ok(data) => data,
            Err(_) => return Vec::new(),
        };
    data.lines()
        .filter_map(|line| line.trim().parse::<i32>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Uid;

    fn skip_unless_cgroups() -> bool {
        if !Uid::effective().is_root() {
            eprintln!("skipping: requires root privileges");
            return true;
        }
        if !cgroups_v2_available() {
            eprintln!("skipping: requires cgroups v2");
            return true;
        }
        false
    }

    #[test]
    fn test_default_config() {
        let config = CgroupsConfig::default();
        assert!(config.enabled);
        assert_eq!(config.cpu_quota, 100_000);
        assert_eq!(config.cpu_period, 100_000);
        assert_eq!(config.memory_max, 536_870_912);
        assert_eq!(config.pids_max, 512);
        assert_eq!(config.base_dir, PathBuf::from("/sys/fs/cgroup"));
    }

    #[test]
    fn test_setup_validation() {
        let cases = [
            CgroupsConfig {
                enabled: false,
                ..CgroupsConfig::default()
            },
            CgroupsConfig {
                cpu_quota: -1,
                ..CgroupsConfig::default()
            },
            CgroupsConfig {
                cpu_period: -1,
                ..CgroupsConfig::default()
            },
            CgroupsConfig {
                memory_max: -1,
                ..CgroupsConfig::default()
            },
            CgroupsConfig {
                pids_max: -1,
                ..CgroupsConfig::default()
            },
        ];
        for config in cases {
            let cg = CgroupsV2::new(config);
            assert!(cg.setup().is_err());
        }
    }

    #[test]
    fn test_accessors_before_setup() {
        let cg = CgroupsV2::new(CgroupsConfig::default());
        assert!(cg.id().is_none());
        assert!(cg.cgroup_dir().is_none());
    }

    #[test]
    fn test_add_process_before_setup() {
        let cg = CgroupsV2::new(CgroupsConfig::default());
        assert!(cg.add_process(Pid::from_raw(1)).is_err());
    }

    #[test]
    fn test_setup_and_cleanup() {
        if skip_unless_cgroups() {
            return;
        }

        let cg = CgroupsV2::new(CgroupsConfig::default());
        cg.setup().expect("setup failed");

        let dir = cg.cgroup_dir().expect("dir after setup");
        assert!(dir.is_dir());

        let cpu_max = std::fs::read_to_string(dir.join("cpu.max"))
            .expect("cpu.max readable");
        assert_eq!(cpu_max.trim(), "100000 100000");
        let memory_max = std::fs::read_to_string(dir.join("memory.max"))
            .expect("memory.max readable");
        assert_eq!(memory_max.trim(), "536870912");
        let pids_max = std::fs::read_to_string(dir.join("pids.max"))
            .expect("pids.max readable");
        assert_eq!(pids_max.trim(), "512");

        /* Second setup must fail while the first is live */
        assert!(cg.setup().is_err());

        cg.cleanup().expect("cleanup failed");
        assert!(!dir.exists());

        /* Cleanup is idempotent */
        cg.cleanup().expect("second cleanup should be a no-op");
    }

    #[test]
    fn test_zero_limit_stays_unlimited() {
        if skip_unless_cgroups() {
            return;
        }

        /* Only pids is limited; cpu and memory stay at their defaults */
        let cg = CgroupsV2::new(CgroupsConfig {
            cpu_quota: 0,
            memory_max: 0,
            pids_max: 64,
            ..CgroupsConfig::default()
        });
        cg.setup().expect("setup failed");

        let dir = cg.cgroup_dir().expect("dir after setup");
        let pids_max = std::fs::read_to_string(dir.join("pids.max"))
            .expect("pids.max readable");
        assert_eq!(pids_max.trim(), "64");

        cg.cleanup().expect("cleanup failed");
    }
}
