//! Sandbox construction applied to each spawned child
//!
//! The steps form a strict sequence: every step consumes privileges that a
//! later step still needs, so the order is load-bearing. Namespace creation
//! happens first (as clone(2) flags, before this module runs in the child),
//! then ID maps, network, filesystem confinement, capability drop, resource
//! limits, and finally seccomp — last because installing the filter forbids
//! syscalls every earlier step depends on.
//!
//! A failed step aborts the child with exit code `64 + step` before any user
//! code runs. The parent maps the code back with
//! [`SandboxStep::from_exit_code`].

pub mod capabilities;
pub mod filesystem;
pub mod namespace;
pub mod netlink;
pub mod network;
pub mod rlimit;
pub mod seccomp;

use std::io;

use thiserror::Error;

use crate::protocol::SandboxConfig;
pub use namespace::OuterIdentity;
pub use rlimit::RlimitPolicy;

/// Exit codes for failed setup steps start here: step N exits `64 + N`.
pub const SETUP_EXIT_BASE: i32 = 64;

/// Errors raised by the sandbox primitives
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("syscall error: {0}")]
    Syscall(String),

    #[error("namespace error: {0}")]
    Namespace(String),

    #[error("netlink error: {0}")]
    Netlink(String),

    #[error("capability error: {0}")]
    Capability(String),

    #[error("seccomp error: {0}")]
    Seccomp(String),

    #[error("feature not available: {0}")]
    FeatureNotAvailable(String),
}

/// The ordered construction steps. Discriminants are the step indices used
/// for exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SandboxStep {
    /// Atomic namespace creation (performed as clone flags)
    Unshare = 1,
    /// /proc/self uid_map, setgroups, gid_map
    IdMap = 2,
    /// Loopback and optional veth configuration
    Network = 3,
    /// chroot + chdir confinement
    Filesystem = 4,
    /// Empty all capability sets, set no_new_privs
    Capabilities = 5,
    /// Resource limits
    Rlimits = 6,
    /// Deny-by-default syscall filter
    Seccomp = 7,
}

impl SandboxStep {
    /// Exit code the child uses when this step fails
    pub fn exit_code(self) -> i32 {
        SETUP_EXIT_BASE + self as i32
    }

    /// Map a child exit code back to the step that failed
    pub fn from_exit_code(code: i32) -> Option<Self> {
        match code - SETUP_EXIT_BASE {
            1 => Some(SandboxStep::Unshare),
            2 => Some(SandboxStep::IdMap),
            3 => Some(SandboxStep::Network),
            4 => Some(SandboxStep::Filesystem),
            5 => Some(SandboxStep::Capabilities),
            6 => Some(SandboxStep::Rlimits),
            7 => Some(SandboxStep::Seccomp),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SandboxStep::Unshare => "namespace unshare",
            SandboxStep::IdMap => "uid/gid mapping",
            SandboxStep::Network => "network setup",
            SandboxStep::Filesystem => "filesystem confinement",
            SandboxStep::Capabilities => "capability drop",
            SandboxStep::Rlimits => "resource limits",
            SandboxStep::Seccomp => "seccomp filter",
        }
    }
}

impl std::fmt::Display for SandboxStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A setup failure tagged with the step it happened in
#[derive(Error, Debug)]
#[error("sandbox step '{step}' failed: {source}")]
pub struct SetupError {
    pub step: SandboxStep,
    #[source]
    pub source: SandboxError,
}

impl SetupError {
    pub fn exit_code(&self) -> i32 {
        self.step.exit_code()
    }
}

/// Run the child-side construction sequence, steps 2 through 7.
///
/// Namespaces already exist (step 1 is the clone call in the spawner);
/// `outer` carries the euid/egid captured before that clone, which the child
/// can no longer observe from inside the user namespace.
pub fn apply(config: &SandboxConfig, outer: OuterIdentity) -> Result<(), SetupError> {
    let step = |step, result: Result<(), SandboxError>| {
        result.map_err(|source| SetupError { step, source })
    };

    step(SandboxStep::IdMap, namespace::write_id_maps(outer))?;

    step(
        SandboxStep::Network,
        match &config.network {
            Some(net) => network::configure_child_side(net),
            None => network::loopback_only(),
        },
    )?;

    if let Some(dir) = &config.chroot_dir {
        step(SandboxStep::Filesystem, filesystem::confine(dir))?;
    }

    if config.drop_capabilities {
        step(SandboxStep::Capabilities, capabilities::drop_all())?;
    }

    step(
        SandboxStep::Rlimits,
        RlimitPolicy::new(config.enable_coredumps).apply(),
    )?;

    if !config.skip_sandbox_seccomp {
        step(SandboxStep::Seccomp, seccomp::install())?;
    }

    Ok(())
}
