//! Worker heartbeat: the status file the dispatcher writes after every poll
//! cycle and the supervisor reads to tell "alive" from "making progress".

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::CycleSummary;
use crate::state_file::{self, StateFileError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownRecord {
    pub at: DateTime<Utc>,
    pub clean: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub last_poll_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cycles: u64,
    #[serde(default)]
    pub last_cycle: Option<CycleSummary>,
    #[serde(default)]
    pub shutdown: Option<ShutdownRecord>,
}

impl Heartbeat {
    pub fn new(pid: u32, started_at: DateTime<Utc>) -> Self {
        Self {
            pid,
            started_at,
            last_poll_at: None,
            cycles: 0,
            last_cycle: None,
            shutdown: None,
        }
    }

    /// True when `pid` exited through its own shutdown path.
    pub fn is_clean_exit_of(&self, pid: u32) -> bool {
        self.pid == pid && self.shutdown.as_ref().is_some_and(|s| s.clean)
    }
}

#[derive(Debug, Clone)]
pub struct HeartbeatFile {
    path: PathBuf,
}

impl HeartbeatFile {
    pub const FILE_NAME: &'static str = "worker_status.json";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join(Self::FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Result<Option<Heartbeat>, StateFileError> {
        state_file::read_json(&self.path)
    }

    pub fn write(&self, heartbeat: &Heartbeat) -> Result<(), StateFileError> {
        state_file::write_json(&self.path, heartbeat)
    }
}
