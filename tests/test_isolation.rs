mod fixtures;

use anyhow::Result;
use fixtures::*;
use rstest::*;

#[rstest]
fn test_pid_isolation(mut launcher: Launcher) -> Result<()> {
    if skip_if_not_root() {
        return Ok(());
    }

    /* The shell is PID 1 inside the fresh PID namespace */
    assert!(launcher.pass(&["--no-cgroup", "sh", "-c", "echo $$"]));
    assert_eq!(launcher.last_stdout, "1\n");
    Ok(())
}

#[rstest]
fn test_uts_isolation(mut launcher: Launcher) -> Result<()> {
    if skip_if_not_root() {
        return Ok(());
    }

    assert!(launcher.pass(&[
        "--no-cgroup",
        "--hostname",
        "test-sandbox",
        "sh",
        "-c",
        "uname -n",
    ]));
    assert_eq!(launcher.last_stdout, "test-sandbox\n");

    /* The host hostname is untouched */
    let host = host_hostname()?;
    assert_ne!(host, "test-sandbox");
    Ok(())
}

#[rstest]
fn test_overlay_write_isolation(mut launcher: Launcher) -> Result<()> {
    if skip_if_not_root() {
        return Ok(());
    }

    let lower = tempfile::TempDir::with_prefix("warden-test-lower-")?;
    std::fs::write(lower.path().join("original.txt"), b"untouched")?;

    let scratch = tempfile::TempDir::with_prefix("warden-test-merge-")?;
    let merge = scratch.path().join("merged");
    let merge_str = merge.to_string_lossy().into_owned();
    let lower_str = lower.path().to_string_lossy().into_owned();

    let script = format!(
        "echo modified > {m}/original.txt && echo newfile > {m}/created.txt",
        m = merge_str
    );
    assert!(launcher.pass(&[
        "--no-cgroup",
        "--overlay",
        "--overlay-lower",
        lower_str.as_str(),
        "--overlay-merge",
        merge_str.as_str(),
        "sh",
        "-c",
        script.as_str(),
    ]));

    /* Writes went to the overlay upper layer, never the lower dir */
    let original = std::fs::read_to_string(lower.path().join("original.txt"))?;
    assert_eq!(original, "untouched");
    assert!(!lower.path().join("created.txt").exists());

    Ok(())
}

#[rstest]
fn test_overlay_scratch_reclaimed(mut launcher: Launcher) -> Result<()> {
    if skip_if_not_root() {
        return Ok(());
    }

    let before = overlay_scratch_dirs()?;
    assert!(launcher.pass(&[
        "--no-cgroup",
        "--overlay",
        "sh",
        "-c",
        "true",
    ]));
    let after = overlay_scratch_dirs()?;

    /* Every scratch dir the run created is gone again */
    let leaked: Vec<_> =
        after.iter().filter(|d| !before.contains(*d)).collect();
    assert!(leaked.is_empty(), "leaked overlay scratch dirs: {:?}", leaked);
    Ok(())
}

#[rstest]
fn test_overlay_pivot(mut launcher: Launcher) -> Result<()> {
    if skip_if_not_root() {
        return Ok(());
    }

    /* Pivoted into the merged overlay of /, with a fresh /proc and a
     * minimal /dev */
    assert!(launcher.pass(&[
        "--no-cgroup",
        "--overlay",
        "--pivot",
        "sh",
        "-c",
        "test -e /dev/null && test -c /dev/null && cat /proc/self/status > /dev/null",
    ]));
    Ok(())
}

#[rstest]
fn test_memory_cap(mut launcher: Launcher) -> Result<()> {
    if skip_unless_cgroups() {
        return Ok(());
    }

    let bigfile = format!("/dev/shm/warden-test-{}", rid());
    let script = format!(
        "dd if=/dev/zero of={f} bs=1M count=32 2>&1; rm -f {f}",
        f = bigfile
    );
    let code =
        launcher.run(&["--memory-max", "16m", "sh", "-c", script.as_str()]);

    /* The OOM killer may take the shell before its rm runs; the file is
     * on the host's /dev/shm, so sweep it from here too */
    let _ = std::fs::remove_file(&bigfile);

    let output =
        format!("{}{}", launcher.last_stdout, launcher.last_stderr);
    assert!(
        code != 0
            || output.contains("Killed")
            || output.contains("Cannot allocate")
            || output.contains("No space left"),
        "expected the 32M write to hit the 16M cap, got code={} output={}",
        code,
        output
    );
    Ok(())
}

#[rstest]
fn test_seccomp_blocks_mount(mut launcher: Launcher) -> Result<()> {
    if skip_if_not_root() {
        return Ok(());
    }

    /* mount(2) is on the default blocklist; the mount binary dies under
     * the filter */
    assert!(launcher.xfail(&[
        "--no-cgroup",
        "sh",
        "-c",
        "exec mount -t tmpfs none /tmp",
    ]));
    Ok(())
}

#[rstest]
fn test_seccomp_allows_normal_work(mut launcher: Launcher) -> Result<()> {
    if skip_if_not_root() {
        return Ok(());
    }

    assert!(launcher.pass(&[
        "--no-cgroup",
        "sh",
        "-c",
        "echo ok && ls / > /dev/null && cat /proc/self/status > /dev/null",
    ]));
    assert!(launcher.last_stdout.contains("ok"));
    Ok(())
}

#[rstest]
fn test_no_seccomp_allows_mount_syscall(mut launcher: Launcher) -> Result<()> {
    if skip_if_not_root() {
        return Ok(());
    }

    /* Same privileged mount, filter disabled: inside its own mount
     * namespace, as root, the mount succeeds */
    assert!(launcher.pass(&[
        "--no-cgroup",
        "--no-seccomp",
        "sh",
        "-c",
        "mount -t tmpfs none /mnt",
    ]));
    Ok(())
}

#[rstest]
fn test_exit_code_transparency(mut launcher: Launcher) -> Result<()> {
    if skip_if_not_root() {
        return Ok(());
    }

    assert_eq!(launcher.run(&["--no-cgroup", "sh", "-c", "exit 42"]), 42);
    Ok(())
}

#[rstest]
fn test_cgroup_dir_reclaimed(mut launcher: Launcher) -> Result<()> {
    if skip_unless_cgroups() {
        return Ok(());
    }

    let before = cgroup_sandbox_dirs()?;
    assert!(launcher.pass(&["sh", "-c", "true"]));
    let after = cgroup_sandbox_dirs()?;

    let leaked: Vec<_> =
        after.iter().filter(|d| !before.contains(*d)).collect();
    assert!(leaked.is_empty(), "leaked cgroup dirs: {:?}", leaked);
    Ok(())
}

#[rstest]
fn test_net_isolation(mut launcher: Launcher) -> Result<()> {
    if skip_if_not_root() {
        return Ok(());
    }

    /* Only loopback exists inside the fresh network namespace. /proc/net
     * reflects the reader's namespace, and /proc was remounted fresh. */
    assert!(launcher.pass(&[
        "--no-cgroup",
        "sh",
        "-c",
        "tail -n +3 /proc/net/dev | wc -l",
    ]));
    assert_eq!(launcher.last_stdout.trim(), "1");
    Ok(())
}

fn host_hostname() -> Result<String> {
    let output = std::process::Command::new("uname").arg("-n").output()?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn overlay_scratch_dirs() -> Result<Vec<String>> {
    list_prefixed("/tmp", "sandbox-overlay-")
}

fn cgroup_sandbox_dirs() -> Result<Vec<String>> {
    list_prefixed("/sys/fs/cgroup", "sandbox-")
}

fn list_prefixed(dir: &str, prefix: &str) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(prefix) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}
