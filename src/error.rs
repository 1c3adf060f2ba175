use thiserror::Error;

use crate::store::StoreError;
use crate::supervisor::SupervisorError;

#[derive(Debug, Error)]
pub enum PilotError {
    #[error("No API key configured. Set ANTHROPIC_API_KEY or `api_key` in jobpilot.toml.")]
    MissingApiKey,

    #[error("No work store configured. Set DATABASE_URL or `database_url` in jobpilot.toml.")]
    MissingDatabase,

    #[error("Work store error: {0}")]
    Store(#[from] StoreError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),
}
