//! spawner-rs: fast sandboxed children from a long-lived forkserver
//!
//! Starting a fully-initialized process is expensive; clone(2) is not. This
//! crate pays the initialization cost once, in a dedicated spawner process,
//! and then serves sandboxed children from it on demand: each child is a
//! fork of the preloaded image, confined by fresh namespaces, a UID/GID
//! remap, optional chroot and veth networking, a capability drop, resource
//! limits, and a seccomp filter, before a registered entry point runs.
//!
//! # Modules
//!
//! - **registry**: Entry points and preloads, registered before the fork
//! - **controller**: Parent-side handle, spawn/close operations
//! - **forkserver**: The spawner process and its control loop
//! - **protocol**: Wire format and SCM_RIGHTS descriptor passing
//! - **sandbox**: Namespace, network, filesystem, capability, rlimit and
//!   seccomp primitives
//!
//! # Example
//!
//! ```ignore
//! use spawner_rs::{ArgValue, Registry, SandboxConfig, SpawnerBuilder};
//!
//! fn greet(args: Vec<ArgValue>) -> Result<(), Box<dyn std::error::Error>> {
//!     for arg in args {
//!         if let ArgValue::Text(text) = arg {
//!             println!("{text}");
//!         }
//!     }
//!     Ok(())
//! }
//!
//! let registry = Registry::new().entry("greet", greet);
//! // Opening is slow (runs the preloads); do it once at startup.
//! let mut spawner = SpawnerBuilder::new(registry, "greet")
//!     .env("LC_ALL", "C.UTF-8")
//!     .open()?;
//!
//! // Spawning is fast; call it as many times as you like.
//! let mut child = spawner.spawn(
//!     &[ArgValue::from("hello")],
//!     "greeter-1",
//!     &SandboxConfig::default(),
//! )?;
//!
//! // Read stdout/stderr to EOF, then wait, for every child.
//! let mut output = String::new();
//! std::io::Read::read_to_string(&mut child.stdout.take().unwrap(), &mut output)?;
//! child.wait()?;
//! spawner.close()?;
//! ```
//!
//! Linux-only. Spawning with networking requires CAP_NET_ADMIN in the
//! parent's namespace; everything else works unprivileged wherever
//! unprivileged user namespaces are enabled.

// Core modules
pub mod errors;
mod utils;

// Wire protocol and registry
pub mod protocol;
pub mod registry;

// Process machinery
pub mod forkserver;
pub mod sandbox;

// Parent-facing handle
pub mod controller;

// Public API
pub use controller::{ChildProcess, Spawner, SpawnerBuilder};
pub use errors::{Result, SpawnerError};
pub use protocol::{ArgValue, NetworkConfig, SandboxConfig};
pub use registry::{EntryFn, PreloadFn, Registry};
pub use sandbox::{RlimitPolicy, SandboxStep};

#[cfg(test)]
mod tests {
    use crate::Registry;

    #[test]
    fn test_module_imports() {
        // Verify core API is accessible
        let _registry = Registry::new();
    }
}

#[cfg(test)]
pub mod test_support {
    use std::sync::{Mutex, MutexGuard, OnceLock};

    /// Fork-sensitive tests take this to avoid interleaving with each other
    pub fn serial_guard() -> MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}
