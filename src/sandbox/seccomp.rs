//! Deny-by-default seccomp filter for sandboxed children
//!
//! The allowlist covers what a managed runtime needs after sandbox setup:
//! memory management, file and descriptor I/O, signals, timers, process
//! management bounded by RLIMIT_NPROC, and sockets (network reachability is
//! the network namespace's job, not the filter's). Identity- and
//! privilege-changing syscalls, mounts, and tracing are absent, so invoking
//! them kills the child with SIGSYS.
//!
//! Installation is the last construction step: every earlier step uses
//! syscalls this filter would kill.

use std::collections::BTreeMap;

use seccompiler::{BpfProgram, SeccompAction, SeccompFilter, TargetArch, apply_filter};

use super::SandboxError;

#[cfg(target_arch = "x86_64")]
const TARGET_ARCH: TargetArch = TargetArch::x86_64;
#[cfg(target_arch = "aarch64")]
const TARGET_ARCH: TargetArch = TargetArch::aarch64;

/// Syscalls available on every supported architecture
fn common_syscalls() -> Vec<libc::c_long> {
    vec![
        // Lifecycle
        libc::SYS_exit,
        libc::SYS_exit_group,
        // Memory
        libc::SYS_brk,
        libc::SYS_mmap,
        libc::SYS_munmap,
        libc::SYS_mremap,
        libc::SYS_mprotect,
        libc::SYS_madvise,
        libc::SYS_mlock,
        libc::SYS_munlock,
        libc::SYS_msync,
        libc::SYS_membarrier,
        // Files
        libc::SYS_openat,
        libc::SYS_read,
        libc::SYS_write,
        libc::SYS_readv,
        libc::SYS_writev,
        libc::SYS_pread64,
        libc::SYS_pwrite64,
        libc::SYS_lseek,
        libc::SYS_close,
        libc::SYS_close_range,
        libc::SYS_fstat,
        libc::SYS_newfstatat,
        libc::SYS_statx,
        libc::SYS_statfs,
        libc::SYS_fstatfs,
        libc::SYS_faccessat,
        libc::SYS_faccessat2,
        libc::SYS_readlinkat,
        libc::SYS_getdents64,
        libc::SYS_mkdirat,
        libc::SYS_unlinkat,
        libc::SYS_renameat2,
        libc::SYS_symlinkat,
        libc::SYS_linkat,
        libc::SYS_fchmod,
        libc::SYS_fchmodat,
        libc::SYS_fchown,
        libc::SYS_fchownat,
        libc::SYS_utimensat,
        libc::SYS_ftruncate,
        libc::SYS_fallocate,
        libc::SYS_fadvise64,
        libc::SYS_flock,
        libc::SYS_fsync,
        libc::SYS_fdatasync,
        libc::SYS_sync,
        libc::SYS_syncfs,
        libc::SYS_copy_file_range,
        libc::SYS_sendfile,
        libc::SYS_splice,
        libc::SYS_tee,
        libc::SYS_vmsplice,
        libc::SYS_memfd_create,
        // Descriptors
        libc::SYS_dup,
        libc::SYS_dup3,
        libc::SYS_pipe2,
        libc::SYS_fcntl,
        libc::SYS_ioctl,
        libc::SYS_eventfd2,
        libc::SYS_signalfd4,
        libc::SYS_timerfd_create,
        libc::SYS_timerfd_settime,
        libc::SYS_timerfd_gettime,
        // Polling
        libc::SYS_epoll_create1,
        libc::SYS_epoll_ctl,
        libc::SYS_epoll_pwait,
        libc::SYS_ppoll,
        libc::SYS_pselect6,
        // Working directory
        libc::SYS_getcwd,
        libc::SYS_chdir,
        libc::SYS_fchdir,
        // Signals
        libc::SYS_rt_sigaction,
        libc::SYS_rt_sigprocmask,
        libc::SYS_rt_sigreturn,
        libc::SYS_rt_sigpending,
        libc::SYS_rt_sigsuspend,
        libc::SYS_rt_sigtimedwait,
        libc::SYS_rt_sigqueueinfo,
        libc::SYS_sigaltstack,
        libc::SYS_kill,
        libc::SYS_tkill,
        libc::SYS_tgkill,
        // Processes and threads, bounded by RLIMIT_NPROC
        libc::SYS_clone,
        libc::SYS_clone3,
        libc::SYS_execve,
        libc::SYS_execveat,
        libc::SYS_wait4,
        libc::SYS_waitid,
        libc::SYS_set_tid_address,
        libc::SYS_set_robust_list,
        libc::SYS_get_robust_list,
        libc::SYS_futex,
        libc::SYS_sched_yield,
        libc::SYS_sched_getaffinity,
        // Identity reads (writes are absent on purpose)
        libc::SYS_getpid,
        libc::SYS_gettid,
        libc::SYS_getppid,
        libc::SYS_getuid,
        libc::SYS_geteuid,
        libc::SYS_getgid,
        libc::SYS_getegid,
        libc::SYS_getresuid,
        libc::SYS_getresgid,
        libc::SYS_getgroups,
        libc::SYS_getpgid,
        libc::SYS_getsid,
        libc::SYS_setpgid,
        libc::SYS_setsid,
        libc::SYS_capget,
        // System information
        libc::SYS_uname,
        libc::SYS_sysinfo,
        libc::SYS_getcpu,
        libc::SYS_umask,
        libc::SYS_getrusage,
        libc::SYS_getrlimit,
        libc::SYS_setrlimit,
        libc::SYS_prlimit64,
        libc::SYS_prctl,
        // Time
        libc::SYS_clock_gettime,
        libc::SYS_clock_getres,
        libc::SYS_clock_nanosleep,
        libc::SYS_nanosleep,
        libc::SYS_gettimeofday,
        // Entropy and per-thread setup
        libc::SYS_getrandom,
        libc::SYS_rseq,
        // Sockets; reachability is constrained by the network namespace
        libc::SYS_socket,
        libc::SYS_socketpair,
        libc::SYS_bind,
        libc::SYS_listen,
        libc::SYS_accept,
        libc::SYS_accept4,
        libc::SYS_connect,
        libc::SYS_shutdown,
        libc::SYS_getsockname,
        libc::SYS_getpeername,
        libc::SYS_sendto,
        libc::SYS_recvfrom,
        libc::SYS_sendmsg,
        libc::SYS_recvmsg,
        libc::SYS_sendmmsg,
        libc::SYS_recvmmsg,
        libc::SYS_setsockopt,
        libc::SYS_getsockopt,
    ]
}

/// Legacy syscalls still emitted by libc wrappers on x86_64
#[cfg(target_arch = "x86_64")]
fn arch_syscalls() -> Vec<libc::c_long> {
    vec![
        libc::SYS_open,
        libc::SYS_stat,
        libc::SYS_lstat,
        libc::SYS_access,
        libc::SYS_readlink,
        libc::SYS_unlink,
        libc::SYS_mkdir,
        libc::SYS_rmdir,
        libc::SYS_rename,
        libc::SYS_renameat,
        libc::SYS_chmod,
        libc::SYS_chown,
        libc::SYS_lchown,
        libc::SYS_symlink,
        libc::SYS_link,
        libc::SYS_dup2,
        libc::SYS_pipe,
        libc::SYS_fork,
        libc::SYS_vfork,
        libc::SYS_poll,
        libc::SYS_select,
        libc::SYS_epoll_create,
        libc::SYS_epoll_wait,
        libc::SYS_getdents,
        libc::SYS_getpgrp,
        libc::SYS_time,
        libc::SYS_utimes,
        libc::SYS_alarm,
        libc::SYS_pause,
        libc::SYS_arch_prctl,
    ]
}

#[cfg(not(target_arch = "x86_64"))]
fn arch_syscalls() -> Vec<libc::c_long> {
    Vec::new()
}

/// The full allowlist for the current architecture
pub fn allowed_syscalls() -> Vec<libc::c_long> {
    let mut syscalls = common_syscalls();
    syscalls.extend(arch_syscalls());
    syscalls
}

/// Compile the allowlist into a loadable BPF program
pub fn compile() -> Result<BpfProgram, SandboxError> {
    let rules: BTreeMap<i64, Vec<seccompiler::SeccompRule>> = allowed_syscalls()
        .into_iter()
        .map(|num| (num as i64, Vec::new()))
        .collect();

    let filter = SeccompFilter::new(
        rules,
        SeccompAction::KillProcess,
        SeccompAction::Allow,
        TARGET_ARCH,
    )
    .map_err(|e| SandboxError::Seccomp(format!("failed to build filter: {e}")))?;

    let program: BpfProgram = filter
        .try_into()
        .map_err(|e| SandboxError::Seccomp(format!("failed to compile filter: {e}")))?;
    Ok(program)
}

/// Compile and install the filter for the calling process.
///
/// Loading an unprivileged filter requires no_new_privs; the capability
/// step usually set it already, but seccomp must not depend on that step
/// having run.
pub fn install() -> Result<(), SandboxError> {
    let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if ret != 0 {
        return Err(SandboxError::Seccomp(format!(
            "failed to set PR_SET_NO_NEW_PRIVS: {}",
            std::io::Error::last_os_error()
        )));
    }

    let program = compile()?;
    apply_filter(&program)
        .map_err(|e| SandboxError::Seccomp(format!("failed to apply filter: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_produces_nonempty_program() {
        let program = compile().unwrap();
        assert!(!program.is_empty());
    }

    #[test]
    fn test_allowlist_has_no_duplicates() {
        let mut syscalls = allowed_syscalls();
        let before = syscalls.len();
        syscalls.sort_unstable();
        syscalls.dedup();
        assert_eq!(syscalls.len(), before);
    }

    #[test]
    fn test_identity_changing_syscalls_are_denied() {
        let allowed = allowed_syscalls();
        for forbidden in [
            libc::SYS_setuid,
            libc::SYS_setgid,
            libc::SYS_setresuid,
            libc::SYS_setresgid,
            libc::SYS_setgroups,
            libc::SYS_capset,
            libc::SYS_chroot,
            libc::SYS_mount,
            libc::SYS_pivot_root,
            libc::SYS_ptrace,
            libc::SYS_bpf,
            libc::SYS_seccomp,
        ] {
            assert!(
                !allowed.contains(&forbidden),
                "syscall {forbidden} must not be allowed"
            );
        }
    }

    #[test]
    fn test_runtime_essentials_are_allowed() {
        let allowed = allowed_syscalls();
        for required in [
            libc::SYS_read,
            libc::SYS_write,
            libc::SYS_mmap,
            libc::SYS_exit_group,
            libc::SYS_futex,
            libc::SYS_connect,
        ] {
            assert!(allowed.contains(&required));
        }
    }

    // install() is a one-way door for the calling process and is exercised
    // inside spawned children by the integration tests.
}
