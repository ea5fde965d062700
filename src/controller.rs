//! Parent-side spawner handle
//!
//! [`SpawnerBuilder`] forks the long-lived spawner process;
//! [`Spawner::spawn`] asks it for one sandboxed child at a time. The handle
//! serializes requests: one SPAWN in flight, one SPAWN_REPLY per SPAWN, in
//! order. Parents that want parallel spawning open several handles.
//!
//! The returned children are direct children of *this* process, not of the
//! spawner; every [`ChildProcess`] must be waited on or it stays a zombie.

use std::fs::File;
use std::io;

use log::{debug, warn};
use nix::sys::signal::{Signal, kill};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};

use crate::errors::{Result, SpawnerError};
use crate::forkserver;
use crate::protocol::{ArgValue, FrameSocket, SandboxConfig, SpawnReply, SpawnRequest, frame};
use crate::registry::Registry;
use crate::sandbox::SandboxStep;

/// A handle for the parent to interact with one spawned child.
///
/// The parent owns all three pipes; dropping them closes the child's stdio.
/// The child sees its own PID as 1.
#[derive(Debug)]
pub struct ChildProcess {
    /// Child process ID as seen from the parent
    pub pid: Pid,
    /// Writable pipe, readable in the child as fd 0
    pub stdin: Option<File>,
    /// Readable pipe, written in the child as fd 1
    pub stdout: Option<File>,
    /// Readable pipe, written in the child as fd 2
    pub stderr: Option<File>,
}

impl ChildProcess {
    /// Terminate the child with SIGKILL. PID-namespace semantics guarantee
    /// every descendant dies with it.
    pub fn kill(&self) -> Result<()> {
        kill(self.pid, Signal::SIGKILL).map_err(errno_to_io)?;
        Ok(())
    }

    /// Wait for the child to exit. Must be called for every child, or it
    /// remains a zombie.
    pub fn wait(&self) -> Result<WaitStatus> {
        let status = waitpid(self.pid, None).map_err(errno_to_io)?;
        Ok(status)
    }

    /// If the status is a sandbox-setup abort, the step that failed.
    pub fn sandbox_failure(status: &WaitStatus) -> Option<SandboxStep> {
        match status {
            WaitStatus::Exited(_, code) => SandboxStep::from_exit_code(*code),
            _ => None,
        }
    }
}

/// Configures and starts a spawner process.
///
/// The registry must contain every entry point and preload the spawner will
/// ever need: the spawner is a fork, and functions registered after
/// [`SpawnerBuilder::open`] do not exist in its copy of the map.
#[derive(Debug)]
pub struct SpawnerBuilder {
    registry: Registry,
    entry_point: String,
    env: Vec<(String, String)>,
    preloads: Vec<String>,
}

impl SpawnerBuilder {
    pub fn new(registry: Registry, entry_point: &str) -> Self {
        Self {
            registry,
            entry_point: entry_point.to_string(),
            env: Vec::new(),
            preloads: Vec::new(),
        }
    }

    /// Add one environment variable for the spawner and all children. The
    /// spawner's inherited environment is discarded entirely.
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// Add many environment variables
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Append a preload to run at spawner startup, in call order
    pub fn preload(mut self, name: &str) -> Self {
        self.preloads.push(name.to_string());
        self
    }

    /// Fork the spawner and return the handle.
    ///
    /// Call this early, while the process is still single-threaded: the
    /// spawner is a fork with no exec, and forking a multi-threaded process
    /// copies whatever lock state other threads happen to hold.
    pub fn open(self) -> Result<Spawner> {
        if self.registry.lookup_entry(&self.entry_point).is_none() {
            return Err(SpawnerError::InvalidConfig(format!(
                "entry point '{}' is not registered",
                self.entry_point
            )));
        }
        for name in &self.preloads {
            if self.registry.lookup_preload(name).is_none() {
                return Err(SpawnerError::InvalidConfig(format!(
                    "preload '{name}' is not registered"
                )));
            }
        }

        let (parent_sock, spawner_sock) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(errno_to_io)?;

        match unsafe { fork() }.map_err(errno_to_io)? {
            ForkResult::Child => {
                drop(parent_sock);
                forkserver::forkserver_main(
                    self.registry,
                    &self.entry_point,
                    &self.env,
                    &self.preloads,
                    spawner_sock,
                )
            }
            ForkResult::Parent { child } => {
                drop(spawner_sock);
                debug!("spawner started as pid {child}");
                Ok(Spawner {
                    pid: child,
                    sock: Some(FrameSocket::new(parent_sock)),
                    poisoned: false,
                    ever_replied: false,
                    reaped: false,
                })
            }
        }
    }
}

/// Handle to a running spawner process.
///
/// Healthy or poisoned: after a protocol or transport error every further
/// operation fails immediately without touching the socket.
#[derive(Debug)]
pub struct Spawner {
    pid: Pid,
    sock: Option<FrameSocket>,
    poisoned: bool,
    ever_replied: bool,
    reaped: bool,
}

impl Spawner {
    /// The spawner's process id
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Ask the spawner for one sandboxed child running the configured entry
    /// point with `args`.
    pub fn spawn(
        &mut self,
        args: &[ArgValue],
        process_name: &str,
        sandbox_config: &SandboxConfig,
    ) -> Result<ChildProcess> {
        if self.poisoned {
            return Err(SpawnerError::Poisoned);
        }
        if process_name.contains('\0') {
            return Err(SpawnerError::InvalidConfig(
                "process name contains NUL byte".to_string(),
            ));
        }
        if let Some(net) = &sandbox_config.network {
            net.validate().map_err(SpawnerError::InvalidConfig)?;
        }

        let request = SpawnRequest {
            process_name: process_name.to_string(),
            sandbox_config: sandbox_config.clone(),
            args: ArgValue::encode_all(args),
        };

        let sock = self.sock.as_ref().expect("socket present until close");
        if let Err(e) = sock.send_frame(&request.encode(), &[]) {
            self.poisoned = true;
            // A broken pipe before the first reply means the spawner died
            // during startup, same as EOF on the receive side
            return Err(
                if !self.ever_replied && e.kind() == io::ErrorKind::BrokenPipe {
                    SpawnerError::Startup(
                        "spawner exited before accepting requests; a preload or \
                         entry-point resolution failed (see its stderr)"
                            .to_string(),
                    )
                } else {
                    SpawnerError::Transport(e)
                },
            );
        }

        let frame = match sock.recv_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                self.poisoned = true;
                return Err(if self.ever_replied {
                    SpawnerError::Protocol("spawner closed the socket mid-session".to_string())
                } else {
                    // EOF before the first reply: the spawner never came up
                    SpawnerError::Startup(
                        "spawner exited before replying; a preload or entry-point \
                         resolution failed (see its stderr)"
                            .to_string(),
                    )
                });
            }
            Err(e) => {
                self.poisoned = true;
                return Err(match e.kind() {
                    io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData => {
                        SpawnerError::Protocol(e.to_string())
                    }
                    _ => SpawnerError::Transport(e),
                });
            }
        };

        let reply = match SpawnReply::decode(&frame.payload) {
            Ok(reply) => reply,
            Err(e) => {
                self.poisoned = true;
                return Err(SpawnerError::Protocol(e.to_string()));
            }
        };
        self.ever_replied = true;

        if !reply.is_ok() {
            if !frame.fds.is_empty() {
                self.poisoned = true;
                return Err(SpawnerError::Protocol(
                    "descriptors attached to an error reply".to_string(),
                ));
            }
            return Err(SpawnerError::SpawnFork(
                "clone failed in the spawner; the next spawn may succeed".to_string(),
            ));
        }

        let (stdin, stdout, stderr) = match frame::expect_stdio_fds(frame.fds) {
            Ok(fds) => fds,
            Err(count) => {
                self.poisoned = true;
                return Err(SpawnerError::Protocol(format!(
                    "success reply carried {count} descriptors instead of 3"
                )));
            }
        };

        debug!("spawned '{}' as pid {}", process_name, reply.pid);
        Ok(ChildProcess {
            pid: Pid::from_raw(reply.pid),
            stdin: Some(File::from(stdin)),
            stdout: Some(File::from(stdout)),
            stderr: Some(File::from(stderr)),
        })
    }

    /// Shut the spawner down and reap it.
    ///
    /// Spawned children keep running: they are children of this process,
    /// entirely disconnected from their spawner.
    pub fn close(mut self) -> Result<()> {
        self.sock.take();
        self.reaped = true;
        let status = waitpid(self.pid, None).map_err(errno_to_io)?;
        if let WaitStatus::Exited(_, code) = status
            && code != 0
        {
            warn!("spawner exited with status {code}");
        }
        Ok(())
    }
}

impl Drop for Spawner {
    fn drop(&mut self) {
        if !self.reaped {
            self.sock.take();
            let _ = waitpid(self.pid, None);
        }
    }
}

fn errno_to_io(errno: nix::errno::Errno) -> SpawnerError {
    SpawnerError::Io(io::Error::from_raw_os_error(errno as i32))
}
