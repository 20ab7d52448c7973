use crate::sandbox::generate_id;
use crate::util::{check_path_for_mount_option_compatibility, mount};
use anyhow::{Context, Result, anyhow};
use log::{debug, info};
use nix::mount::{MntFlags, MsFlags, umount2};
use serde::{Deserialize, Serialize};
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct OverlayConfig {
    pub enabled: bool,
    /* Read-only lower layers, highest priority first. Never written. */
    pub lower_dirs: Vec<PathBuf>,
    /* Merged mountpoint; defaults to <scratch>/merged when unset. */
    pub merge_dir: Option<PathBuf>,
    /* tmpfs size cap, passed through to the kernel ("64m", "1g", bytes). */
    pub tmpfs_size: String,
    /* Parent directory for the scratch tree. */
    pub base_dir: PathBuf,
    /* No upper layer; the merged tree is fully read-only. */
    pub read_only: bool,
}

impl OverlayConfig {
    pub fn with_lower(lower: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            lower_dirs: vec![lower.into()],
            merge_dir: None,
            tmpfs_size: "64m".to_string(),
            base_dir: PathBuf::from("/tmp"),
            read_only: false,
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self::with_lower("/")
    }
}

/**
 * The overlay mount parameters that travel over the config pipe. The child
 * mounts the overlay inside its own mount namespace from these paths alone.
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayMountSpec {
    pub lower_dirs: Vec<String>,
    #[serde(default)]
    pub upper_dir: String,
    #[serde(default)]
    pub work_dir: String,
    pub merge_dir: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Default)]
struct OverlayState {
    id: String,
    base_dir: PathBuf,
    upper_dir: PathBuf,
    work_dir: PathBuf,
    merge_dir: PathBuf,
    setup_done: bool,
}

/**
 * Manages the lifetime of one overlay scratch volume: a size-capped tmpfs
 * at `<base>/sandbox-overlay-<id>/` holding `upper/`, `work/` and `merged/`.
 *
 * `setup()` runs on the parent side; the overlay itself is mounted by the
 * child (see `mount_overlay`), so the merged tree never appears in the
 * host mount namespace.
 */
pub struct OverlayFs {
    config: OverlayConfig,
    state: Mutex<OverlayState>,
}

impl OverlayFs {
    pub fn new(config: OverlayConfig) -> Self {
        Self {
            config,
            state: Mutex::new(OverlayState::default()),
        }
    }

    /**
     * Allocates the scratch tree. Not idempotent: a second call fails.
     * Any failure after the tmpfs mount rolls the volume back.
     */
    pub fn setup(&self) -> Result<()> {
        let mut state = self.state.lock().expect("overlay state lock");

        if state.setup_done {
            return Err(anyhow!("overlayfs: already set up"));
        }
        if !self.config.enabled {
            return Err(anyhow!("overlayfs: not enabled"));
        }
        if self.config.lower_dirs.is_empty() {
            return Err(anyhow!("overlayfs: no lower dirs specified"));
        }
        for dir in &self.config.lower_dirs {
            if !dir.is_dir() {
                return Err(anyhow!(
                    "overlayfs: lower dir {} does not exist",
                    dir.display()
                ));
            }
            check_path_for_mount_option_compatibility(dir)?;
        }

        let id = generate_id();
        let base_dir = self
            .config
            .base_dir
            .join(format!("sandbox-overlay-{}", id));

        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true).mode(0o700);
        builder.create(&base_dir).context(format!(
            "overlayfs: failed to create {}",
            base_dir.display()
        ))?;

        let size = if self.config.tmpfs_size.is_empty() {
            "64m"
        } else {
            self.config.tmpfs_size.as_str()
        };
        if let Err(e) = mount(
            Some("tmpfs"),
            &base_dir,
            Some("tmpfs"),
            MsFlags::empty(),
            Some(format!("size={},mode=0700", size)),
        ) {
            let _ = std::fs::remove_dir(&base_dir);
            return Err(e).context("overlayfs: mount tmpfs");
        }

        let upper_dir = base_dir.join("upper");
        let work_dir = base_dir.join("work");
        let merge_dir = match &self.config.merge_dir {
            Some(dir) => dir.clone(),
            None => base_dir.join("merged"),
        };

        for dir in [&upper_dir, &work_dir, &merge_dir] {
            let mut builder = std::fs::DirBuilder::new();
            builder.recursive(true).mode(0o700);
            if let Err(e) = builder.create(dir) {
                /* Roll back the tmpfs so a half-built volume never leaks */
                let _ = umount2(&base_dir, MntFlags::MNT_DETACH);
                let _ = std::fs::remove_dir_all(&base_dir);
                return Err(e).context(format!(
                    "overlayfs: failed to create {}",
                    dir.display()
                ));
            }
        }

        info!(
            "overlay {} ready: lower={:?} size={} base={}",
            id,
            self.config.lower_dirs,
            size,
            base_dir.display()
        );

        state.id = id;
        state.base_dir = base_dir;
        state.upper_dir = upper_dir;
        state.work_dir = work_dir;
        state.merge_dir = merge_dir;
        state.setup_done = true;

        Ok(())
    }

    /**
     * Snapshot of the mount parameters for the config pipe. None before
     * `setup()` has succeeded.
     */
    pub fn init_spec(&self) -> Option<OverlayMountSpec> {
        let state = self.state.lock().expect("overlay state lock");
        if !state.setup_done {
            return None;
        }
        Some(OverlayMountSpec {
            lower_dirs: self
                .config
                .lower_dirs
                .iter()
                .map(|d| d.to_string_lossy().into_owned())
                .collect(),
            upper_dir: state.upper_dir.to_string_lossy().into_owned(),
            work_dir: state.work_dir.to_string_lossy().into_owned(),
            merge_dir: state.merge_dir.to_string_lossy().into_owned(),
            read_only: self.config.read_only,
        })
    }

    /**
     * Releases the scratch volume. Idempotent: calling again after success
     * is a no-op. Unmount errors on the merged tree are tolerated (the
     * child usually mounted it only in its own namespace); tmpfs unmount
     * and removal errors are collected and surfaced.
     */
    pub fn cleanup(&self) -> Result<()> {
        let mut state = self.state.lock().expect("overlay state lock");
        if !state.setup_done {
            return Ok(());
        }

        info!("overlay {} cleanup", state.id);

        let mut errs: Vec<String> = Vec::new();

        /* Usually only mounted in the child's namespace, so "not mounted"
         * here is the normal case */
        debug!("unmounting merged tree at {}", state.merge_dir.display());
        let _ = umount2(&state.merge_dir, MntFlags::MNT_DETACH);

        if let Err(e) = umount2(&state.base_dir, MntFlags::MNT_DETACH) {
            errs.push(format!(
                "unmount tmpfs {}: {}",
                state.base_dir.display(),
                e
            ));
        }
        if let Err(e) = std::fs::remove_dir_all(&state.base_dir) {
            errs.push(format!("remove {}: {}", state.base_dir.display(), e));
        }

        state.setup_done = false;

        if errs.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("overlayfs cleanup errors: {}", errs.join("; ")))
        }
    }

    pub fn id(&self) -> Option<String> {
        let state = self.state.lock().expect("overlay state lock");
        state.setup_done.then(|| state.id.clone())
    }

    pub fn merge_dir(&self) -> Option<PathBuf> {
        let state = self.state.lock().expect("overlay state lock");
        state.setup_done.then(|| state.merge_dir.clone())
    }

    #[allow(dead_code)]
    pub fn upper_dir(&self) -> Option<PathBuf> {
        let state = self.state.lock().expect("overlay state lock");
        state.setup_done.then(|| state.upper_dir.clone())
    }
}

/**
 * Builds the overlayfs mount option string:
 * `lowerdir=dir1:dir2,upperdir=...,workdir=...`, with the writable layers
 * omitted for a read-only overlay.
 */
pub(crate) fn build_overlay_options(spec: &OverlayMountSpec) -> String {
    let mut opts = format!("lowerdir={}", spec.lower_dirs.join(":"));
    if !spec.read_only {
        opts.push_str(&format!(",upperdir={}", spec.upper_dir));
        opts.push_str(&format!(",workdir={}", spec.work_dir));
    }
    opts
}

/**
 * Mounts the overlay onto the merge dir. Runs inside the child's private
 * mount namespace. A failure here means the filesystem boundary does not
 * exist, so the caller treats it as fatal.
 */
pub(crate) fn mount_overlay(spec: &OverlayMountSpec) -> Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true).mode(0o700);
    builder.create(&spec.merge_dir).context(format!(
        "failed to create merge dir {}",
        spec.merge_dir
    ))?;

    let opts = build_overlay_options(spec);
    mount(
        Some("overlay"),
        &spec.merge_dir,
        Some("overlay"),
        MsFlags::empty(),
        Some(opts),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Uid;

    fn skip_if_not_root() -> bool {
        if !Uid::effective().is_root() {
            eprintln!("skipping: requires root privileges");
            return true;
        }
        false
    }

    #[test]
    fn test_build_overlay_options_single_lower() {
        let spec = OverlayMountSpec {
            lower_dirs: vec!["/lower".to_string()],
            upper_dir: "/upper".to_string(),
            work_dir: "/work".to_string(),
            merge_dir: "/merged".to_string(),
            read_only: false,
        };
        assert_eq!(
            build_overlay_options(&spec),
            "lowerdir=/lower,upperdir=/upper,workdir=/work"
        );
    }

    #[test]
    fn test_build_overlay_options_multiple_lowers() {
        let spec = OverlayMountSpec {
            lower_dirs: vec![
                "/lower1".to_string(),
                "/lower2".to_string(),
                "/lower3".to_string(),
            ],
            upper_dir: "/upper".to_string(),
            work_dir: "/work".to_string(),
            merge_dir: "/merged".to_string(),
            read_only: false,
        };
        assert_eq!(
            build_overlay_options(&spec),
            "lowerdir=/lower1:/lower2:/lower3,upperdir=/upper,workdir=/work"
        );
    }

    #[test]
    fn test_build_overlay_options_read_only() {
        let spec = OverlayMountSpec {
            lower_dirs: vec!["/lower".to_string()],
            upper_dir: String::new(),
            work_dir: String::new(),
            merge_dir: "/merged".to_string(),
            read_only: true,
        };
        assert_eq!(build_overlay_options(&spec), "lowerdir=/lower");
    }

    #[test]
    fn test_setup_validation() {
        let ov = OverlayFs::new(OverlayConfig {
            enabled: false,
            ..OverlayConfig::default()
        });
        assert!(ov.setup().is_err());

        let ov = OverlayFs::new(OverlayConfig {
            lower_dirs: vec![],
            ..OverlayConfig::default()
        });
        assert!(ov.setup().is_err());

        let ov = OverlayFs::new(OverlayConfig::with_lower(
            "/nonexistent-dir-12345",
        ));
        assert!(ov.setup().is_err());
    }

    #[test]
    fn test_accessors_before_setup() {
        let ov = OverlayFs::new(OverlayConfig::default());
        assert!(ov.id().is_none());
        assert!(ov.merge_dir().is_none());
        assert!(ov.upper_dir().is_none());
        assert!(ov.init_spec().is_none());
    }

    #[test]
    fn test_setup_and_cleanup() {
        if skip_if_not_root() {
            return;
        }

        let ov = OverlayFs::new(OverlayConfig::default());
        ov.setup().expect("setup failed");

        let id = ov.id().expect("id after setup");
        let base = PathBuf::from(format!("/tmp/sandbox-overlay-{}", id));
        assert!(base.join("upper").is_dir());
        assert!(base.join("work").is_dir());
        assert!(base.join("merged").is_dir());

        let spec = ov.init_spec().expect("spec after setup");
        assert_eq!(spec.lower_dirs, vec!["/".to_string()]);

        /* Second setup must fail while the first is live */
        assert!(ov.setup().is_err());

        ov.cleanup().expect("cleanup failed");
        assert!(!base.exists());

        /* Cleanup is idempotent */
        ov.cleanup().expect("second cleanup should be a no-op");
    }

    #[test]
    fn test_concurrent_overlays() {
        if skip_if_not_root() {
            return;
        }

        let lower = tempfile::tempdir().expect("tempdir");
        std::fs::write(lower.path().join("seed.txt"), b"seed")
            .expect("write seed");

        let mut handles = Vec::new();
        for _ in 0..10 {
            let lower_path = lower.path().to_path_buf();
            handles.push(std::thread::spawn(move || {
                let ov = OverlayFs::new(OverlayConfig::with_lower(lower_path));
                ov.setup().expect("setup failed");
                let id = ov.id().expect("id");
                assert!(
                    PathBuf::from(format!("/tmp/sandbox-overlay-{}", id))
                        .exists()
                );
                ov.cleanup().expect("cleanup failed");
                id
            }));
        }

        let mut ids: Vec<String> = handles
            .into_iter()
            .map(|h| h.join().expect("thread panicked"))
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 10, "overlay IDs must not collide");

        /* Lower dir contents are untouched */
        let seed = std::fs::read(lower.path().join("seed.txt"))
            .expect("seed readable");
        assert_eq!(seed, b"seed");
    }
}
