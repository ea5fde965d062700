//! One spawn: clone, sandbox, dispatch
//!
//! Three processes cooperate here. The spawner clones a subspawner with
//! CLONE_PARENT, so the new process is a direct child of the original
//! parent, which owns the waitpid. The subspawner unshares its namespaces,
//! sandboxes itself, then forks once more: the grandchild becomes PID 1 of
//! the new PID namespace and runs the user entry point, while the
//! subspawner stays behind as a short-lived supervisor that mirrors the
//! grandchild's exit status.
//!
//! PID 1 arms PR_SET_PDEATHSIG with SIGKILL, so killing the PID the parent
//! holds (the subspawner) collapses the PID namespace: PID 1 dies by
//! pdeathsig and the kernel kills every remaining process in the namespace.
//!
//! Two sync pipes order the spawner and the subspawner around the namespace
//! boundary: the subspawner signals once its namespaces exist (the spawner
//! needs the new network namespace to exist before it can push a veth into
//! it), and the spawner signals back once host-side setup is done and the
//! reply is about to go out.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::panic::{AssertUnwindSafe, catch_unwind};

use log::{debug, error};
use nix::errno::Errno;
use nix::sched::{CloneFlags, clone};
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork, pipe};

use crate::errors::{Result, SpawnerError};
use crate::protocol::{ArgValue, FrameSocket, SpawnReply, SpawnRequest};
use crate::registry::EntryFn;
use crate::sandbox::{self, OuterIdentity, SandboxStep, namespace, network};
use crate::utils;

/// Stack for the cloned subspawner. The user entry point runs in a fresh
/// fork off this stack, so it only has to fit sandbox setup.
const SUBSPAWNER_STACK_SIZE: usize = 1024 * 1024;

/// Descriptors the subspawner needs, captured as raw fds before clone.
struct ChildFds {
    stdin: RawFd,
    stdout: RawFd,
    stderr: RawFd,
    ready_write: RawFd,
    done_read: RawFd,
}

/// Serve one spawn request: fork the subspawner, run spawner-side setup,
/// reply with the pid and pipe ends. Only transport failures are fatal to
/// the spawner; a failed clone is answered in-protocol and the loop goes
/// on.
pub fn spawn_child(sock: &FrameSocket, entry: EntryFn, request: SpawnRequest) -> Result<()> {
    // Pipe ends named from the parent's perspective
    let (stdin_read, stdin_write) = pipe_pair()?;
    let (stdout_read, stdout_write) = pipe_pair()?;
    let (stderr_read, stderr_write) = pipe_pair()?;
    // Subspawner -> spawner: namespaces exist
    let (ready_read, ready_write) = pipe_pair()?;
    // Spawner -> subspawner: host-side setup done
    let (done_read, done_write) = pipe_pair()?;

    let outer = OuterIdentity::current();
    let child_fds = ChildFds {
        stdin: stdin_read.as_raw_fd(),
        stdout: stdout_write.as_raw_fd(),
        stderr: stderr_write.as_raw_fd(),
        ready_write: ready_write.as_raw_fd(),
        done_read: done_read.as_raw_fd(),
    };

    let mut stack = vec![0u8; SUBSPAWNER_STACK_SIZE];
    let clone_result = unsafe {
        clone(
            Box::new(|| run_subspawner(&request, entry, outer, &child_fds)),
            &mut stack,
            CloneFlags::CLONE_PARENT,
            Some(Signal::SIGCHLD as i32),
        )
    };

    let child_pid = match clone_result {
        Ok(pid) => pid,
        Err(errno) => {
            if errno == Errno::EPERM {
                error!(
                    "clone() was refused by the kernel; if running under a \
                     seccomp-confined container runtime, its profile must \
                     permit clone with CLONE_PARENT"
                );
            }
            sock.send_frame(&SpawnReply::fork_failed().encode(), &[])
                .map_err(SpawnerError::Transport)?;
            return Ok(());
        }
    };

    // Spawner-side copies of the child's ends go away first; the sync pipes
    // below rely on EOF, which only works once ours are closed.
    drop(stdin_read);
    drop(stdout_write);
    drop(stderr_write);
    drop(ready_write);
    drop(done_read);

    // Wait for the subspawner to have its namespaces; a dead subspawner
    // (EOF without the byte) skips host-side setup, and the parent learns
    // the rest from the exit status it already owns.
    let namespaces_ready = read_ready_byte(ready_read);
    if namespaces_ready && let Some(net) = &request.sandbox_config.network {
        // Host-side sandboxing happens before the pid is revealed, so the
        // parent can never kill a child that is still half-built.
        if let Err(e) = network::configure_host_side(child_pid.as_raw(), net) {
            error!("host-side network setup failed: {e}");
            let _ = nix::sys::signal::kill(child_pid, Signal::SIGKILL);
            return Err(SpawnerError::Io(io::Error::other(e.to_string())));
        }
    }
    drop(done_write); // open the gate

    let reply = SpawnReply::ok(child_pid.as_raw());
    sock.send_frame(
        &reply.encode(),
        &[
            stdin_write.as_raw_fd(),
            stdout_read.as_raw_fd(),
            stderr_read.as_raw_fd(),
        ],
    )
    .map_err(SpawnerError::Transport)?;
    debug!("child {} handed to parent", child_pid);

    // The spawner retains nothing of the child: the remaining OwnedFds drop
    // here, leaving the parent as sole owner of the pipe ends.
    Ok(())
}

fn pipe_pair() -> Result<(OwnedFd, OwnedFd)> {
    pipe().map_err(|errno| SpawnerError::Io(io::Error::from_raw_os_error(errno as i32)))
}

/// Block until the subspawner reports its namespaces, or dies.
fn read_ready_byte(ready_read: OwnedFd) -> bool {
    let mut file = std::fs::File::from(ready_read);
    let mut byte = [0u8; 1];
    matches!(file.read(&mut byte), Ok(1))
}

/// Everything the subspawner does, from clone to _exit. Runs on the clone
/// stack with a copied address space; it never returns.
fn run_subspawner(
    request: &SpawnRequest,
    entry: EntryFn,
    outer: OuterIdentity,
    fds: &ChildFds,
) -> isize {
    // Wire the pipe ends onto stdio, then drop every other descriptor in
    // the process: the control socket above all, or the child could read
    // the parent's spawn traffic.
    for (fd, target) in [(fds.stdin, 0), (fds.stdout, 1), (fds.stderr, 2)] {
        if unsafe { libc::dup2(fd, target) } < 0 {
            unsafe { libc::_exit(1) };
        }
    }
    utils::close_fds_except(&[fds.ready_write, fds.done_read]);

    if !request.process_name.is_empty() {
        // Best effort; a bad name must not kill the spawn before stderr is
        // even connected to the parent
        let _ = utils::set_process_name(&request.process_name);
    }

    // Step 1: all six namespaces in one call
    if let Err(e) = namespace::unshare_all() {
        eprintln!("sandbox step '{}' failed: {e}", SandboxStep::Unshare);
        unsafe { libc::_exit(SandboxStep::Unshare.exit_code()) };
    }

    // Tell the spawner the namespaces exist, then wait for host-side setup
    let ready = unsafe { libc::write(fds.ready_write, [1u8].as_ptr().cast(), 1) };
    if ready != 1 {
        unsafe { libc::_exit(1) };
    }
    unsafe { libc::close(fds.ready_write) };
    wait_for_eof(fds.done_read);
    unsafe { libc::close(fds.done_read) };

    // Steps 2..7
    if let Err(e) = sandbox::apply(&request.sandbox_config, outer) {
        eprintln!("{e}");
        unsafe { libc::_exit(e.exit_code()) };
    }

    // The subspawner is still in the old PID namespace; only its children
    // enter the new one. Fork so the user code runs as PID 1, and stay
    // behind to mirror its exit status.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => run_entry(request, entry),
        Ok(ForkResult::Parent { child }) => supervise(child),
        Err(e) => {
            eprintln!("fork into PID namespace failed: {e}");
            unsafe { libc::_exit(1) };
        }
    }
}

fn wait_for_eof(fd: RawFd) {
    let mut byte = [0u8; 1];
    loop {
        let n = unsafe { libc::read(fd, byte.as_mut_ptr().cast(), 1) };
        if n == 0 {
            return;
        }
        if n < 0 && io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
            return;
        }
    }
}

/// PID 1 of the new namespace: arm the kill switch, decode the arguments,
/// run the entry point.
fn run_entry(request: &SpawnRequest, entry: EntryFn) -> ! {
    // If the supervisor dies, so does this process, and with PID 1 gone the
    // kernel kills the entire namespace
    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0);
    }

    let args = match ArgValue::decode_all(&request.args) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("failed to decode entry arguments: {e}");
            unsafe { libc::_exit(1) };
        }
    };

    let outcome = catch_unwind(AssertUnwindSafe(|| entry(args)));
    let code = match outcome {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            eprintln!("{e}");
            1
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "entry point panicked".to_string());
            eprintln!("{message}");
            1
        }
    };
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
    unsafe { libc::_exit(code) };
}

/// The subspawner's afterlife: wait for PID 1 and exit with its status.
fn supervise(child: Pid) -> ! {
    loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => unsafe { libc::_exit(code) },
            Ok(WaitStatus::Signaled(_, signal, _)) => unsafe {
                libc::_exit(128 + signal as i32)
            },
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(_) => unsafe { libc::_exit(1) },
        }
    }
}
