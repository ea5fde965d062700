//! Capability drop
//!
//! Inside the user namespace the child's mapped root uid starts with a full
//! capability set over the namespace. Dropping order matters: emptying the
//! bounding set needs CAP_SETPCAP in the effective set, so bounding goes
//! first and permitted last. no_new_privs then pins the state across any
//! later execve.

use caps::CapSet;

use super::SandboxError;

/// Empty every capability set of the calling process and set no_new_privs.
pub fn drop_all() -> Result<(), SandboxError> {
    for set in [
        CapSet::Bounding,
        CapSet::Ambient,
        CapSet::Inheritable,
        CapSet::Effective,
        CapSet::Permitted,
    ] {
        caps::clear(None, set)
            .map_err(|e| SandboxError::Capability(format!("failed to clear {set:?} set: {e}")))?;
    }
    set_no_new_privs()
}

/// Forbid privilege gain through setuid/setgid/file-capability binaries.
pub fn set_no_new_privs() -> Result<(), SandboxError> {
    let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if ret != 0 {
        return Err(SandboxError::Capability(format!(
            "failed to set PR_SET_NO_NEW_PRIVS: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Whether no_new_privs is set for the calling process
pub fn no_new_privs() -> bool {
    unsafe { libc::prctl(libc::PR_GET_NO_NEW_PRIVS, 0, 0, 0, 0) == 1 }
}
