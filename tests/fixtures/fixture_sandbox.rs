use rand::Rng;
use std::path::PathBuf;
use std::process::Command;

pub fn rid() -> String {
    let mut rng = rand::rng();
    (0..10)
        .map(|_| rng.sample(rand::distr::Alphanumeric) as char)
        .collect()
}

pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

pub fn cgroups_v2_available() -> bool {
    PathBuf::from("/sys/fs/cgroup/cgroup.controllers").exists()
}

/* Root-gated tests print why they were skipped instead of failing */
pub fn skip_if_not_root() -> bool {
    if !is_root() {
        eprintln!("skipping: requires root privileges");
        return true;
    }
    false
}

pub fn skip_unless_cgroups() -> bool {
    if skip_if_not_root() {
        return true;
    }
    if !cgroups_v2_available() {
        eprintln!("skipping: requires cgroups v2");
        return true;
    }
    false
}

/**
 * Drives the compiled launcher binary and keeps the output of the last
 * invocation around for assertions.
 */
pub struct Launcher {
    pub log_dir: PathBuf,
    pub last_stdout: String,
    pub last_stderr: String,
    pub last_code: i32,
    _log_dir_guard: tempfile::TempDir,
}

impl Launcher {
    pub fn new() -> Self {
        let log_dir = tempfile::TempDir::with_prefix("warden-test-logs-")
            .expect("failed to create log dir");
        Self {
            log_dir: log_dir.path().to_path_buf(),
            last_stdout: String::new(),
            last_stderr: String::new(),
            last_code: -1,
            _log_dir_guard: log_dir,
        }
    }

    pub fn bin() -> &'static str {
        env!("CARGO_BIN_EXE_warden")
    }

    /* Runs the launcher with a writable log dir prepended, recording the
     * outcome. Returns the exit code. */
    pub fn run(&mut self, args: &[&str]) -> i32 {
        let log_dir = self.log_dir.to_string_lossy().into_owned();
        let mut full_args = vec!["--log-dir", log_dir.as_str()];
        full_args.extend_from_slice(args);

        let output = Command::new(Self::bin())
            .args(&full_args)
            .output()
            .expect("failed to run warden binary");

        self.last_stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        self.last_stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        self.last_code = output.status.code().unwrap_or(-1);
        self.last_code
    }

    /* Runs without injecting any default flags */
    pub fn run_raw(&mut self, args: &[&str]) -> i32 {
        let output = Command::new(Self::bin())
            .args(args)
            .output()
            .expect("failed to run warden binary");

        self.last_stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        self.last_stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        self.last_code = output.status.code().unwrap_or(-1);
        self.last_code
    }

    pub fn pass(&mut self, args: &[&str]) -> bool {
        self.run(args) == 0
    }

    pub fn xfail(&mut self, args: &[&str]) -> bool {
        self.run(args) != 0
    }
}
