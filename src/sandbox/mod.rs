mod cgroups;
mod id;
mod init;
mod namespace;
mod overlayfs;
mod pivot_root;
mod seccomp;

pub use cgroups::{CgroupsConfig, CgroupsV2, cgroups_v2_available};
pub use id::generate_id;
pub use init::maybe_run_init;
pub use namespace::{ExecResult, Namespace, NamespaceConfig};
pub use overlayfs::{OverlayConfig, OverlayFs};
pub use pivot_root::PivotRootConfig;
pub use seccomp::SeccompConfig;
