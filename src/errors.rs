//! Error types for spawner operations

use std::io;
use thiserror::Error;

/// Result type for spawner operations
pub type Result<T> = std::result::Result<T, SpawnerError>;

/// Errors surfaced to the parent process holding a [`Spawner`] handle.
///
/// Protocol and transport errors poison the handle: once one is observed,
/// every later operation fails with [`SpawnerError::Poisoned`] without
/// touching the socket. A fork failure inside the spawner is reported per
/// request and does not poison the handle.
///
/// [`Spawner`]: crate::controller::Spawner
#[derive(Error, Debug)]
pub enum SpawnerError {
    #[error("spawner startup failed: {0}")]
    Startup(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("spawner could not fork a child: {0}")]
    SpawnFork(String),

    #[error("spawner handle is poisoned by an earlier error")]
    Poisoned,

    #[error("transport error on control socket: {0}")]
    Transport(#[source] io::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SpawnerError {
    /// Whether observing this error must poison the handle.
    pub fn poisons(&self) -> bool {
        matches!(
            self,
            SpawnerError::Protocol(_) | SpawnerError::Transport(_) | SpawnerError::Startup(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SpawnerError::Poisoned;
        assert_eq!(
            err.to_string(),
            "spawner handle is poisoned by an earlier error"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "no such pipe");
        let err = SpawnerError::from(io_err);
        assert!(err.to_string().contains("IO error"));
    }

    #[test]
    fn test_poisoning_classification() {
        assert!(SpawnerError::Protocol("short read".into()).poisons());
        assert!(SpawnerError::Transport(io::Error::other("x")).poisons());
        assert!(SpawnerError::Startup("preload failed".into()).poisons());
        assert!(!SpawnerError::SpawnFork("EAGAIN".into()).poisons());
        assert!(!SpawnerError::InvalidConfig("bad name".into()).poisons());
    }

    #[test]
    fn test_result_type() {
        fn returns_result() -> Result<i32> {
            Ok(42)
        }
        assert_eq!(returns_result().unwrap(), 42);
    }
}
