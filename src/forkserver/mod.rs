//! The long-lived spawner process
//!
//! The spawner is a fork of the parent with no exec: it inherits the
//! program image, including the entry registry, and runs the preloads once
//! so that every child it clones gets the post-preload heap copy-on-write.
//! It is strictly single-threaded and serves one request at a time; fork
//! semantics stay tractable only because nothing else runs concurrently.
//!
//! Startup order: reset the environment, resolve the entry point, run the
//! preloads, then serve. Any startup failure exits nonzero before the first
//! frame is read, which the parent observes as EOF. In the control loop,
//! EOF means the parent closed the handle (orderly exit); a malformed frame
//! means the peer is broken and the spawner exits immediately rather than
//! trying to resync a byte stream it no longer trusts.

pub mod spawn;

use std::os::fd::{AsRawFd, OwnedFd};
use std::process;

use log::{debug, error};

use crate::protocol::{FrameSocket, SpawnRequest};
use crate::registry::Registry;
use crate::utils;

/// Exit code for startup failures (unknown entry, failed preload).
const EXIT_STARTUP_FAILURE: i32 = 1;
/// Exit code for protocol violations observed by the spawner.
const EXIT_PROTOCOL_FAILURE: i32 = 1;

/// Run the spawner in the current process. Never returns.
///
/// `env` replaces the inherited environment completely: children must see
/// exactly what the caller configured, nothing from the parent's shell.
pub fn forkserver_main(
    registry: Registry,
    entry_point: &str,
    env: &[(String, String)],
    preloads: &[String],
    sock: OwnedFd,
) -> ! {
    reset_environment(env);

    if let Err(e) = utils::devnull_stdin() {
        error!("spawner could not detach stdin: {e}");
        process::exit(EXIT_STARTUP_FAILURE);
    }
    // stdio stays pointed at the parent's stdout/stderr; everything else
    // inherited from the parent is not ours to keep
    utils::close_fds_except(&[sock.as_raw_fd()]);

    let Some(entry) = registry.lookup_entry(entry_point) else {
        error!(
            "unknown entry point '{entry_point}' (registered: {:?})",
            registry.entry_names().collect::<Vec<_>>()
        );
        process::exit(EXIT_STARTUP_FAILURE);
    };

    for name in preloads {
        let Some(preload) = registry.lookup_preload(name) else {
            error!("unknown preload '{name}'");
            process::exit(EXIT_STARTUP_FAILURE);
        };
        if let Err(e) = preload() {
            error!("preload '{name}' failed: {e}");
            process::exit(EXIT_STARTUP_FAILURE);
        }
        debug!("preload '{name}' done");
    }

    let sock = FrameSocket::new(sock);
    loop {
        let frame = match sock.recv_frame() {
            // Parent closed its end: orderly shutdown
            Ok(None) => process::exit(0),
            Ok(Some(frame)) => frame,
            Err(e) => {
                error!("control socket read failed: {e}");
                process::exit(EXIT_PROTOCOL_FAILURE);
            }
        };
        if !frame.fds.is_empty() {
            error!("unexpected descriptors on a request frame");
            process::exit(EXIT_PROTOCOL_FAILURE);
        }

        let request = match SpawnRequest::decode(&frame.payload) {
            Ok(request) => request,
            Err(e) => {
                error!("malformed spawn request: {e}");
                process::exit(EXIT_PROTOCOL_FAILURE);
            }
        };

        debug!("spawning child '{}'", request.process_name);
        if let Err(e) = spawn::spawn_child(&sock, entry, request) {
            error!("spawn failed fatally: {e}");
            process::exit(EXIT_PROTOCOL_FAILURE);
        }
    }
}

/// Replace the whole environment with `env`.
///
/// Sound here because the spawner is single-threaded from fork to exit;
/// nothing reads the environment concurrently.
fn reset_environment(env: &[(String, String)]) {
    let current: Vec<_> = std::env::vars_os().map(|(key, _)| key).collect();
    for key in current {
        unsafe { std::env::remove_var(key) };
    }
    for (key, value) in env {
        unsafe { std::env::set_var(key, value) };
    }
}
