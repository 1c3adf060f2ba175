//! The PID marker: the supervisor's persisted view of the worker, so a
//! fresh `jobpilot` invocation picks up where the last one left off.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::process::LaunchSpec;
use crate::state_file::{self, StateFileError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

/// The managed worker process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerProcess {
    #[serde(default)]
    pub state: WorkerState,
    /// Set while a worker is believed to exist; cleared by stop.
    #[serde(default)]
    pub pid: Option<u32>,
    /// Identity of the process at `pid` when it was spawned. A live pid
    /// with a different identity belongs to someone else.
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Last launch configuration. Survives stop so restart can reuse it.
    #[serde(default)]
    pub launch: Option<LaunchSpec>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    /// Automatic restarts inside the current rate-limit window.
    #[serde(default)]
    pub restarts: Vec<DateTime<Utc>>,
    #[serde(default)]
    pub requires_manual_intervention: bool,
}

impl WorkerProcess {
    pub fn mark_stopped(&mut self, at: DateTime<Utc>) {
        self.state = WorkerState::Stopped;
        self.pid = None;
        self.identity = None;
        self.stopped_at = Some(at);
    }
}

#[derive(Debug, Clone)]
pub struct MarkerFile {
    path: PathBuf,
}

impl MarkerFile {
    pub const FILE_NAME: &'static str = "worker.pid";

    pub fn in_dir(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(Self::FILE_NAME),
        }
    }

    /// A missing marker means nothing was ever started.
    pub fn load(&self) -> Result<WorkerProcess, StateFileError> {
        Ok(state_file::read_json(&self.path)?.unwrap_or_default())
    }

    pub fn save(&self, worker: &WorkerProcess) -> Result<(), StateFileError> {
        state_file::write_json(&self.path, worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_marker_is_a_stopped_worker() {
        let dir = TempDir::new().unwrap();
        let worker = MarkerFile::in_dir(dir.path()).load().unwrap();
        assert_eq!(worker.state, WorkerState::Stopped);
        assert!(worker.pid.is_none());
        assert!(!worker.requires_manual_intervention);
    }

    #[test]
    fn stop_keeps_the_launch_spec() {
        let dir = TempDir::new().unwrap();
        let marker = MarkerFile::in_dir(dir.path());
        let launch = LaunchSpec {
            interval_secs: 60,
            headless: false,
        };
        let mut worker = WorkerProcess {
            state: WorkerState::Running,
            pid: Some(4242),
            identity: Some("boot+987654".into()),
            started_at: Some(Utc::now()),
            launch: Some(launch),
            ..Default::default()
        };
        worker.mark_stopped(Utc::now());
        marker.save(&worker).unwrap();

        let back = marker.load().unwrap();
        assert!(back.pid.is_none());
        assert!(back.identity.is_none());
        assert_eq!(back.launch, Some(launch));
        assert!(back.stopped_at.is_some());
    }

    #[test]
    fn marker_json_uses_snake_case_state() {
        let worker = WorkerProcess {
            state: WorkerState::Crashed,
            ..Default::default()
        };
        let json = serde_json::to_value(&worker).unwrap();
        assert_eq!(json["state"], "crashed");
    }
}
