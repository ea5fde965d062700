//! Resource limits applied to each child before user code runs

use super::SandboxError;

const GIB: u64 = 1024 * 1024 * 1024;

/// The sandbox resource policy. Values are part of the sandbox contract
/// rather than per-spawn configuration; only core dumps are switchable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RlimitPolicy {
    /// RLIMIT_AS in bytes
    pub max_address_space: u64,
    /// RLIMIT_NPROC
    pub max_processes: u64,
    /// RLIMIT_FSIZE in bytes
    pub max_file_size: u64,
    /// RLIMIT_NOFILE
    pub max_open_files: u64,
    /// Leave RLIMIT_CORE untouched instead of zeroing it
    pub allow_coredumps: bool,
}

impl Default for RlimitPolicy {
    fn default() -> Self {
        Self {
            max_address_space: GIB,
            max_processes: 100,
            max_file_size: GIB,
            max_open_files: 1024,
            allow_coredumps: false,
        }
    }
}

impl RlimitPolicy {
    pub fn new(allow_coredumps: bool) -> Self {
        Self {
            allow_coredumps,
            ..Default::default()
        }
    }

    /// Apply the policy to the current process. Called in the child after
    /// capability drop; lowering limits needs no privilege.
    pub fn apply(&self) -> Result<(), SandboxError> {
        if !self.allow_coredumps {
            set_rlimit(libc::RLIMIT_CORE, 0)?;
        }
        set_rlimit(libc::RLIMIT_AS, self.max_address_space)?;
        set_rlimit(libc::RLIMIT_NPROC, self.max_processes)?;
        set_rlimit(libc::RLIMIT_FSIZE, self.max_file_size)?;
        set_rlimit(libc::RLIMIT_NOFILE, self.max_open_files)?;
        Ok(())
    }
}

fn set_rlimit(resource: libc::__rlimit_resource_t, limit: u64) -> Result<(), SandboxError> {
    let rlim = libc::rlimit {
        rlim_cur: limit,
        rlim_max: limit,
    };

    let ret = unsafe { libc::setrlimit(resource, &rlim) };
    if ret != 0 {
        let resource_name = match resource {
            libc::RLIMIT_AS => "RLIMIT_AS",
            libc::RLIMIT_CORE => "RLIMIT_CORE",
            libc::RLIMIT_NPROC => "RLIMIT_NPROC",
            libc::RLIMIT_FSIZE => "RLIMIT_FSIZE",
            libc::RLIMIT_NOFILE => "RLIMIT_NOFILE",
            _ => "UNKNOWN",
        };
        return Err(SandboxError::Syscall(format!(
            "setrlimit({}) failed: {}",
            resource_name,
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_values() {
        let policy = RlimitPolicy::default();
        assert_eq!(policy.max_address_space, GIB);
        assert_eq!(policy.max_processes, 100);
        assert_eq!(policy.max_file_size, GIB);
        assert_eq!(policy.max_open_files, 1024);
        assert!(!policy.allow_coredumps);
    }

    #[test]
    fn test_new_toggles_only_coredumps() {
        let policy = RlimitPolicy::new(true);
        assert!(policy.allow_coredumps);
        assert_eq!(policy.max_open_files, RlimitPolicy::default().max_open_files);
    }

    // apply() permanently lowers the test process's own limits, so the
    // integration tests exercise it inside spawned children.
}
