//! Namespace creation and user namespace UID/GID mapping
//!
//! All six namespaces are created by one unshare(2) call; the caller enters
//! the new user namespace immediately, while the new PID namespace applies
//! to its next child. The process then writes its own /proc/self maps: a
//! single entry mapping inner root to the outer unprivileged id. setgroups
//! must be disabled before an unprivileged process may write gid_map.

use std::fs;

use nix::sched::{CloneFlags, unshare};

use super::SandboxError;
use crate::utils;

/// The effective uid/gid outside the user namespace.
///
/// Captured before unshare(2): once inside the namespace, geteuid() reports
/// the overflow id until the maps are written, so the outer identity has to
/// travel in.
#[derive(Debug, Clone, Copy)]
pub struct OuterIdentity {
    pub uid: u32,
    pub gid: u32,
}

impl OuterIdentity {
    pub fn current() -> Self {
        Self {
            uid: utils::get_euid(),
            gid: utils::get_egid(),
        }
    }
}

/// The namespaces every child gets, created atomically by one unshare call.
pub fn namespace_flags() -> CloneFlags {
    CloneFlags::CLONE_NEWUSER
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWNET
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWUTS
}

/// Create all six namespaces in one call.
///
/// Seccomp-confined outer containers (Docker's default profile among them)
/// reject the combined user+PID unshare; that case gets its own message so
/// the operator knows to relax the outer profile rather than chase a
/// permissions bug.
pub fn unshare_all() -> Result<(), SandboxError> {
    unshare(namespace_flags()).map_err(|errno| match errno {
        nix::errno::Errno::EPERM => SandboxError::Namespace(
            "combined user+PID unshare rejected; if running inside a seccomp-confined \
             container, the outer profile must permit unshare and clone with new \
             namespaces"
                .to_string(),
        ),
        other => SandboxError::Namespace(format!("unshare failed: {other}")),
    })
}

/// Map inner uid/gid 0 to the outer identity for the calling process.
pub fn write_id_maps(outer: OuterIdentity) -> Result<(), SandboxError> {
    let uid_map = format!("0 {} 1\n", outer.uid);
    fs::write("/proc/self/uid_map", &uid_map)
        .map_err(|e| SandboxError::Namespace(format!("failed to write uid_map: {e}")))?;

    // Required before an unprivileged process may write gid_map
    fs::write("/proc/self/setgroups", "deny\n")
        .map_err(|e| SandboxError::Namespace(format!("failed to write setgroups: {e}")))?;

    let gid_map = format!("0 {} 1\n", outer.gid);
    fs::write("/proc/self/gid_map", &gid_map)
        .map_err(|e| SandboxError::Namespace(format!("failed to write gid_map: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outer_identity_matches_libc() {
        let outer = OuterIdentity::current();
        assert_eq!(outer.uid, unsafe { libc::geteuid() });
        assert_eq!(outer.gid, unsafe { libc::getegid() });
    }

    #[test]
    fn test_namespace_flags_cover_all_six_namespaces() {
        let flags = namespace_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWUSER));
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(flags.contains(CloneFlags::CLONE_NEWNS));
        assert!(flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(flags.contains(CloneFlags::CLONE_NEWIPC));
        assert!(flags.contains(CloneFlags::CLONE_NEWUTS));
    }

    #[test]
    fn test_write_id_maps_outside_new_namespace_fails() {
        // Without a freshly unshared user namespace the maps are already
        // set, so writing again is rejected by the kernel.
        let result = write_id_maps(OuterIdentity::current());
        assert!(result.is_err());
    }
}
