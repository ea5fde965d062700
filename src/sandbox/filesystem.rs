//! Filesystem confinement
//!
//! chroot is the confinement mechanism: unprivileged `pivot_root` +
//! `umount` of the old root are forbidden in most deployment environments,
//! so full mount-namespace isolation is out of reach and the chroot
//! directory is expected to live on a filesystem distinct from `/`. That
//! precondition belongs to the caller and is not verified here.

use std::path::Path;

use nix::unistd::{chdir, chroot};

use super::SandboxError;

/// Change the root directory to `dir` and move the working directory under
/// the new root. Runs inside the child's fresh user namespace, where the
/// mapped root uid holds CAP_SYS_CHROOT.
pub fn confine(dir: &Path) -> Result<(), SandboxError> {
    chroot(dir).map_err(|e| SandboxError::Syscall(format!("chroot to {dir:?} failed: {e}")))?;
    // Without this, "." would still point outside the new root
    chdir("/").map_err(|e| SandboxError::Syscall(format!("chdir to new root failed: {e}")))?;
    Ok(())
}
