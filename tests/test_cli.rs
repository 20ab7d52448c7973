mod fixtures;

use anyhow::Result;
use fixtures::*;
use rstest::*;

#[rstest]
fn test_cli_surface(mut launcher: Launcher) -> Result<()> {
    /* --version and --help short-circuit before any setup */
    assert_eq!(launcher.run_raw(&["--version"]), 0);
    assert!(launcher.last_stdout.contains("warden"));
    assert_eq!(launcher.run_raw(&["--help"]), 0);

    /* A command is mandatory */
    assert_ne!(launcher.run_raw(&[]), 0);

    /* Unknown flags are rejected */
    assert_ne!(launcher.run_raw(&["--bad-option", "true"]), 0);

    /* Bad flag values are rejected */
    assert_ne!(launcher.run_raw(&["--log-level", "loud", "true"]), 0);

    Ok(())
}

#[rstest]
fn test_cli_bad_memory_max(mut launcher: Launcher) -> Result<()> {
    /* Size parsing fails before any privileged work, so this behaves the
     * same with and without root */
    assert_ne!(launcher.run_raw(&["--memory-max", "plenty", "true"]), 0);
    assert!(launcher.last_stderr.contains("memory-max"));
    Ok(())
}

#[rstest]
fn test_cli_requires_root(mut launcher: Launcher) -> Result<()> {
    if is_root() {
        eprintln!("skipping: test requires running as a regular user");
        return Ok(());
    }

    assert!(launcher.xfail(&["sh", "-c", "true"]));
    assert!(launcher.last_stderr.contains("sudo"));
    Ok(())
}

#[rstest]
fn test_cli_pivot_requires_overlay(mut launcher: Launcher) -> Result<()> {
    if skip_if_not_root() {
        return Ok(());
    }

    assert!(launcher.xfail(&["--pivot", "sh", "-c", "true"]));
    assert!(launcher.last_stderr.contains("--overlay"));
    Ok(())
}

#[rstest]
fn test_cli_writes_log_file(mut launcher: Launcher) -> Result<()> {
    if skip_if_not_root() {
        return Ok(());
    }

    assert!(launcher.pass(&["--no-cgroup", "sh", "-c", "true"]));

    /* One append-only JSON log file per sandbox, named after its ID */
    let entries: Vec<_> = std::fs::read_dir(&launcher.log_dir)?
        .filter_map(Result::ok)
        .filter(|e| {
            e.file_name().to_string_lossy().starts_with("sandbox-")
        })
        .collect();
    assert_eq!(entries.len(), 1);

    let contents = std::fs::read_to_string(entries[0].path())?;
    let first_line = contents.lines().next().expect("log not empty");
    let record: serde_json::Value = serde_json::from_str(first_line)?;
    assert!(record.get("level").is_some());
    assert!(record.get("sandbox_id").is_some());

    Ok(())
}
