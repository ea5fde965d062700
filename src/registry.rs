//! Entry-point and preload registry
//!
//! The spawner never exec()s: every child is a fork of the spawner's address
//! space, and the entry point is looked up by name in a map of function
//! symbols. The map must be fully populated before [`SpawnerBuilder::open`]
//! forks the spawner; children then inherit the same map copy-on-write.
//! Registering anything after open has no effect on an already-running
//! spawner.
//!
//! [`SpawnerBuilder::open`]: crate::controller::SpawnerBuilder::open

use std::collections::HashMap;
use std::error::Error;

use crate::protocol::ArgValue;

/// Function run inside a sandboxed child, with the decoded spawn arguments.
///
/// Returning `Err` (or panicking) makes the child exit 1 with the message on
/// its stderr pipe; the spawner keeps serving.
pub type EntryFn = fn(Vec<ArgValue>) -> Result<(), Box<dyn Error>>;

/// Function run once in the spawner before it accepts requests. The work it
/// does (loading models, warming caches, opening read-only data) is what
/// every child inherits for free.
pub type PreloadFn = fn() -> Result<(), Box<dyn Error>>;

/// Named entry points and preloads available to a spawner.
#[derive(Default, Clone)]
pub struct Registry {
    entries: HashMap<String, EntryFn>,
    preloads: HashMap<String, PreloadFn>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry point under `name`. Later registrations under the
    /// same name replace earlier ones.
    pub fn entry(mut self, name: &str, f: EntryFn) -> Self {
        self.entries.insert(name.to_string(), f);
        self
    }

    /// Register a preload under `name`.
    pub fn preload(mut self, name: &str, f: PreloadFn) -> Self {
        self.preloads.insert(name.to_string(), f);
        self
    }

    pub fn lookup_entry(&self, name: &str) -> Option<EntryFn> {
        self.entries.get(name).copied()
    }

    pub fn lookup_preload(&self, name: &str) -> Option<PreloadFn> {
        self.preloads.get(name).copied()
    }

    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("entries", &self.entries.keys().collect::<Vec<_>>())
            .field("preloads", &self.preloads.keys().collect::<Vec<_>>())
            .finish()
    }
}
