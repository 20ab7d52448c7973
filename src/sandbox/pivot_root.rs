use crate::util::mount;
use anyhow::{Context, Result};
use nix::mount::{MntFlags, MsFlags, umount2};
use serde::{Deserialize, Serialize};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, symlink};
use std::path::{Path, PathBuf};

/**
 * Parent-side pivot_root configuration. When `root_dir` is unset the
 * orchestrator substitutes the overlay's merged mountpoint.
 */
#[derive(Debug, Clone)]
pub struct PivotRootConfig {
    pub enabled: bool,
    pub root_dir: Option<PathBuf>,
}

impl Default for PivotRootConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root_dir: None,
        }
    }
}

/* The resolved root path as it travels over the config pipe */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PivotSpec {
    pub root_dir: String,
}

/**
 * Swaps the root filesystem for `new_root` and drops the old one.
 *
 * Sequence (per pivot_root(2)): bind-mount new_root onto itself so it is a
 * mount point distinct from its parent, park the old root in
 * `.pivot_old`, pivot, chdir to the new `/`, lazily unmount the old root
 * and remove the parking directory.
 */
pub(crate) fn do_pivot_root(new_root: &str) -> Result<()> {
    let null: Option<&str> = None;
    mount(
        Some(new_root),
        new_root,
        null,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        null,
    )
    .context(format!("bind mount {}", new_root))?;

    let pivot_dir = Path::new(new_root).join(".pivot_old");
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true).mode(0o700);
    builder
        .create(&pivot_dir)
        .context(format!("mkdir {}", pivot_dir.display()))?;

    nix::unistd::pivot_root(new_root, &pivot_dir).context(format!(
        "pivot_root({}, {})",
        new_root,
        pivot_dir.display()
    ))?;

    nix::unistd::chdir("/").context("chdir to new root")?;

    /* MNT_DETACH so busy files in the old root cannot block the unmount */
    umount2("/.pivot_old", MntFlags::MNT_DETACH)
        .context("unmount old root")?;

    /* The directory may already be gone after the unmount */
    let _ = std::fs::remove_dir("/.pivot_old");

    Ok(())
}

/**
 * Populates `<root>/dev` with the handful of device nodes a typical
 * command expects: bind mounts of null/zero/urandom plus the fd/stdin/
 * stdout/stderr symlinks into /proc/self/fd.
 *
 * Must run while the host /dev is still reachable, i.e. before the pivot
 * detaches the old root. The symlinks only start resolving once a fresh
 * /proc is mounted.
 */
pub(crate) fn setup_minimal_dev(root: &str) -> Result<()> {
    let dev_dir = Path::new(root).join("dev");
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true).mode(0o755);
    builder
        .create(&dev_dir)
        .context(format!("mkdir {}", dev_dir.display()))?;

    for name in ["null", "zero", "urandom"] {
        let src = format!("/dev/{}", name);
        let dst = dev_dir.join(name);

        /* bind mounts need an existing target */
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .mode(0o666)
            .open(&dst)
            .context(format!("create {}", dst.display()))?;

        let null: Option<&str> = None;
        mount(Some(&src), &dst, Some("bind"), MsFlags::MS_BIND, null)
            .context(format!(
                "bind mount {} -> {}",
                src,
                dst.display()
            ))?;
    }

    for (target, link) in [
        ("/proc/self/fd", "fd"),
        ("/proc/self/fd/0", "stdin"),
        ("/proc/self/fd/1", "stdout"),
        ("/proc/self/fd/2", "stderr"),
    ] {
        let link = dev_dir.join(link);
        if std::fs::symlink_metadata(&link).is_ok() {
            continue;
        }
        symlink(target, &link).context(format!(
            "symlink {} -> {}",
            link.display(),
            target
        ))?;
    }

    Ok(())
}
