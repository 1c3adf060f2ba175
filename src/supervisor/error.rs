use std::io;

use thiserror::Error;

use crate::state_file::StateFileError;

/// Failures inside the supervisor. Control operations fold these into a
/// `failed` status rather than returning them to the caller.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] io::Error),

    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("process {0} does not exist")]
    NoSuchProcess(u32),

    #[error("cannot locate the jobpilot executable: {0}")]
    CurrentExe(#[source] io::Error),

    #[error(transparent)]
    StateFile(#[from] StateFileError),
}
