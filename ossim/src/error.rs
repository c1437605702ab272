//! Top-level worker error.

use std::io;

use thiserror::Error;

use crate::channel::ChannelError;
use crate::config::ConfigError;
use crate::ipc::shmem::ShmError;

/// Every way a worker run can fail.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("shared memory error: {0}")]
    Shm(#[from] ShmError),
    #[error("message channel error: {0}")]
    Channel(#[from] ChannelError),
    /// Installing the SIGTERM handler failed.
    #[error("failed to install signal handler: {0}")]
    Signal(io::Error),
    /// Writing the stdout report failed.
    #[error("failed to write report: {0}")]
    Report(#[from] io::Error),
}

impl WorkerError {
    /// Process exit status for this error.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_error_exits_one() {
        let errors = [
            WorkerError::from(ConfigError::ZeroInterval),
            WorkerError::from(ChannelError::Closed),
            WorkerError::Signal(io::Error::other("denied")),
        ];
        for err in errors {
            assert_eq!(err.exit_code(), 1, "{err}");
        }
    }

    #[test]
    fn test_display_names_layer() {
        let err = WorkerError::from(ChannelError::Interrupted);
        assert_eq!(err.to_string(), "message channel error: interrupted by signal");
    }
}
