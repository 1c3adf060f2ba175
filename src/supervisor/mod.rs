//! Process supervisor for the background worker.
//!
//! The supervisor and the worker are separate OS processes. They share two
//! files under the state directory: the PID marker (owned here) and the
//! heartbeat (owned by the worker). Every control operation re-reads the
//! marker, so any `jobpilot` invocation sees the same worker.

mod error;
mod limiter;
mod marker;
mod process;

pub use error::SupervisorError;
pub use limiter::RestartLimiter;
pub use marker::{MarkerFile, WorkerProcess, WorkerState};
pub use process::{LaunchSpec, OsProcessSpawner, ProcessSpawner, Signal};

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::SupervisorConfig;
use crate::heartbeat::HeartbeatFile;
use crate::pipeline::CycleSummary;

const EXIT_POLL: Duration = Duration::from_millis(100);
/// How long to wait for the kernel to tear a process down after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub grace_period: Duration,
    pub startup_probe: Duration,
    pub monitor_interval: Duration,
    pub max_restarts: u32,
    pub restart_window: Duration,
    pub max_cpu_percent: f64,
    pub max_memory_mb: f64,
    pub heartbeat_stale: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from(&SupervisorConfig::default())
    }
}

impl From<&SupervisorConfig> for SupervisorSettings {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            grace_period: Duration::from_secs(config.grace_period_secs),
            startup_probe: Duration::from_millis(config.startup_probe_ms),
            monitor_interval: Duration::from_secs(config.monitor_interval_secs),
            max_restarts: config.max_restarts,
            restart_window: Duration::from_secs(config.restart_window_secs),
            max_cpu_percent: config.max_cpu_percent,
            max_memory_mb: config.max_memory_mb as f64,
            heartbeat_stale: Duration::from_secs(config.heartbeat_stale_secs),
        }
    }
}

/// Response of a control operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ControlStatus {
    Started { pid: u32 },
    AlreadyRunning { pid: u32 },
    Stopped { pid: u32, forced: bool },
    NotRunning,
    Restarted { pid: u32 },
    Failed { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthChecks {
    pub process_running: bool,
    pub cpu_normal: bool,
    pub memory_normal: bool,
    pub heartbeat_fresh: bool,
}

/// Point-in-time view of the worker. "Alive" and "making progress" are
/// reported separately.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub state: WorkerState,
    pub alive: bool,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub heartbeat_stale: bool,
    pub last_cycle: Option<CycleSummary>,
    pub cpu_percent: Option<f64>,
    pub memory_mb: Option<f64>,
    pub checks: HealthChecks,
    pub healthy: bool,
    pub requires_manual_intervention: bool,
}

/// What one monitor check did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorAction {
    Nothing,
    /// Crash seen but auto-restart is off.
    CrashDetected,
    Restarted { pid: u32 },
    RestartFailed { message: String },
    /// Restart budget exhausted; waiting for an operator.
    GaveUp,
}

pub struct Supervisor<P> {
    spawner: P,
    marker: MarkerFile,
    heartbeat: HeartbeatFile,
    settings: SupervisorSettings,
    limiter: RestartLimiter,
    /// Used by restart when no launch was ever recorded.
    default_launch: LaunchSpec,
}

impl<P: ProcessSpawner> Supervisor<P> {
    pub fn new(
        spawner: P,
        state_dir: &Path,
        settings: SupervisorSettings,
        default_launch: LaunchSpec,
    ) -> Self {
        let limiter = RestartLimiter::new(settings.max_restarts, settings.restart_window);
        Self {
            spawner,
            marker: MarkerFile::in_dir(state_dir),
            heartbeat: HeartbeatFile::in_dir(state_dir),
            settings,
            limiter,
            default_launch,
        }
    }

    pub async fn start(&self, launch: LaunchSpec) -> ControlStatus {
        self.try_start(launch, true)
            .await
            .unwrap_or_else(|e| failed("start", e))
    }

    pub async fn stop(&self, force: bool) -> ControlStatus {
        self.try_stop(force)
            .await
            .unwrap_or_else(|e| failed("stop", e))
    }

    /// Stop, then start again with the last recorded launch.
    pub async fn restart(&self) -> ControlStatus {
        let launch = match self.marker.load() {
            Ok(worker) => worker.launch.unwrap_or(self.default_launch),
            Err(e) => return failed("restart", e.into()),
        };
        match self.stop(false).await {
            ControlStatus::Failed { message } => return ControlStatus::Failed { message },
            status => tracing::debug!(?status, "Restart: stop phase done"),
        }
        match self.start(launch).await {
            ControlStatus::Started { pid } => ControlStatus::Restarted { pid },
            other => other,
        }
    }

    /// Never fails: unreadable state files read as empty.
    pub async fn health(&self) -> HealthReport {
        let worker = self.marker.load().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Unreadable PID marker");
            WorkerProcess::default()
        });
        let heartbeat = self
            .heartbeat
            .read()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Unreadable heartbeat file");
                None
            })
            // A heartbeat from an earlier worker says nothing about this one.
            .filter(|hb| worker.pid.is_none_or(|pid| hb.pid == pid));

        let alive = self.running_pid(&worker).is_some();
        let state = match worker.pid {
            None => WorkerState::Stopped,
            Some(_) if alive => match worker.state {
                WorkerState::Starting | WorkerState::Stopping => worker.state,
                _ => WorkerState::Running,
            },
            // A stop was requested; a killed worker leaves no shutdown record.
            Some(_) if worker.state == WorkerState::Stopping => WorkerState::Stopped,
            Some(pid) if heartbeat.as_ref().is_some_and(|hb| hb.is_clean_exit_of(pid)) => {
                WorkerState::Stopped
            }
            Some(_) => WorkerState::Crashed,
        };

        let sample = match worker.pid {
            Some(pid) if alive => self.spawner.sample(pid).await,
            _ => None,
        };

        let now = Utc::now();
        let last_poll_at = heartbeat.as_ref().and_then(|hb| hb.last_poll_at);
        let stale_after = TimeDelta::from_std(self.settings.heartbeat_stale).unwrap_or(TimeDelta::MAX);
        let heartbeat_stale = alive
            && last_poll_at
                .or(worker.started_at)
                .is_some_and(|at| now.signed_duration_since(at) > stale_after);

        let checks = HealthChecks {
            process_running: alive,
            cpu_normal: sample.is_none_or(|s| s.cpu_percent <= self.settings.max_cpu_percent),
            memory_normal: sample.is_none_or(|s| s.memory_mb <= self.settings.max_memory_mb),
            heartbeat_fresh: !heartbeat_stale,
        };
        let healthy =
            checks.process_running && checks.cpu_normal && checks.memory_normal && checks.heartbeat_fresh;

        HealthReport {
            state,
            alive,
            pid: worker.pid,
            started_at: worker.started_at,
            last_poll_at,
            heartbeat_stale,
            last_cycle: heartbeat.and_then(|hb| hb.last_cycle),
            cpu_percent: sample.map(|s| s.cpu_percent),
            memory_mb: sample.map(|s| s.memory_mb),
            checks,
            healthy,
            requires_manual_intervention: worker.requires_manual_intervention,
        }
    }

    /// Check health every `monitor_interval` until cancelled.
    pub async fn monitor(&self, cancel: CancellationToken, auto_restart: bool) {
        tracing::info!(
            interval_secs = self.settings.monitor_interval.as_secs(),
            auto_restart,
            max_restarts = self.settings.max_restarts,
            "Monitoring worker",
        );
        loop {
            self.check_once(auto_restart).await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.monitor_interval) => {}
            }
        }
        tracing::info!("Monitor stopped");
    }

    /// One monitor pass: restart a crashed worker if the budget allows.
    pub async fn check_once(&self, auto_restart: bool) -> MonitorAction {
        let report = self.health().await;
        match report.state {
            WorkerState::Crashed => {
                tracing::warn!(pid = ?report.pid, "Worker exited without a clean shutdown");
                if !auto_restart {
                    return MonitorAction::CrashDetected;
                }
                match self.restart_crashed().await {
                    Ok(action) => action,
                    Err(e) => {
                        tracing::error!(error = %e, "Automatic restart failed");
                        MonitorAction::RestartFailed {
                            message: e.to_string(),
                        }
                    }
                }
            }
            WorkerState::Running if !report.healthy => {
                tracing::warn!(
                    pid = ?report.pid,
                    cpu_normal = report.checks.cpu_normal,
                    memory_normal = report.checks.memory_normal,
                    heartbeat_fresh = report.checks.heartbeat_fresh,
                    "Worker is running but unhealthy",
                );
                MonitorAction::Nothing
            }
            _ => {
                tracing::debug!(state = ?report.state, "Worker check");
                MonitorAction::Nothing
            }
        }
    }

    /// The recorded pid while it still names our worker.
    fn running_pid(&self, worker: &WorkerProcess) -> Option<u32> {
        let pid = worker.pid?;
        self.is_worker(pid, worker.identity.as_deref()).then_some(pid)
    }

    /// `pid` is alive and is the process that was spawned under it. A pid
    /// recorded without an identity cannot be told apart from a reused one.
    fn is_worker(&self, pid: u32, identity: Option<&str>) -> bool {
        let Some(expected) = identity else {
            return false;
        };
        if !self.spawner.is_alive(pid) {
            return false;
        }
        if self.spawner.identity(pid).as_deref() == Some(expected) {
            return true;
        }
        tracing::warn!(pid, "Recorded pid now belongs to another process");
        false
    }

    async fn restart_crashed(&self) -> Result<MonitorAction, SupervisorError> {
        let mut worker = self.marker.load()?;
        let now = Utc::now();

        if !self.limiter.try_record(&mut worker.restarts, now) {
            tracing::error!(
                max_restarts = self.settings.max_restarts,
                window_secs = self.settings.restart_window.as_secs(),
                "Restart limit reached; manual intervention required",
            );
            worker.mark_stopped(now);
            worker.requires_manual_intervention = true;
            self.marker.save(&worker)?;
            return Ok(MonitorAction::GaveUp);
        }
        worker.state = WorkerState::Crashed;
        self.marker.save(&worker)?;

        let launch = worker.launch.unwrap_or(self.default_launch);
        tracing::info!(
            attempt = worker.restarts.len(),
            max_restarts = self.settings.max_restarts,
            "Restarting crashed worker",
        );
        Ok(match self.try_start(launch, false).await? {
            ControlStatus::Started { pid } => MonitorAction::Restarted { pid },
            ControlStatus::Failed { message } => MonitorAction::RestartFailed { message },
            _ => MonitorAction::Nothing,
        })
    }

    async fn try_start(
        &self,
        launch: LaunchSpec,
        manual: bool,
    ) -> Result<ControlStatus, SupervisorError> {
        let mut worker = self.marker.load()?;
        if let Some(pid) = self.running_pid(&worker) {
            tracing::info!(pid, "Worker already running");
            return Ok(ControlStatus::AlreadyRunning { pid });
        }

        if manual {
            // An operator start resets the crash-loop guard.
            worker.requires_manual_intervention = false;
            worker.restarts.clear();
        }
        worker.state = WorkerState::Starting;

        let pid = match self.spawner.spawn(&launch) {
            Ok(pid) => pid,
            Err(e) => {
                if manual {
                    worker.mark_stopped(Utc::now());
                } else {
                    // Still crashed: the next check retries under the limiter.
                    worker.state = WorkerState::Crashed;
                }
                self.marker.save(&worker)?;
                return Err(e);
            }
        };
        worker.pid = Some(pid);
        worker.identity = self.spawner.identity(pid);
        if worker.identity.is_none() {
            tracing::warn!(pid, "Could not read the worker's process identity");
        }
        worker.started_at = Some(Utc::now());
        worker.stopped_at = None;
        worker.launch = Some(launch);
        self.marker.save(&worker)?;

        if !self.settings.startup_probe.is_zero() {
            tokio::time::sleep(self.settings.startup_probe).await;
        }
        if !self.is_worker(pid, worker.identity.as_deref()) {
            worker.state = WorkerState::Crashed;
            self.marker.save(&worker)?;
            tracing::error!(pid, "Worker exited during startup");
            return Ok(ControlStatus::Failed {
                message: format!("worker {pid} exited during startup; check the worker log"),
            });
        }

        worker.state = WorkerState::Running;
        self.marker.save(&worker)?;
        tracing::info!(
            pid,
            interval_secs = launch.interval_secs,
            headless = launch.headless,
            "Worker started",
        );
        Ok(ControlStatus::Started { pid })
    }

    async fn try_stop(&self, force: bool) -> Result<ControlStatus, SupervisorError> {
        let mut worker = self.marker.load()?;
        let Some(pid) = self.running_pid(&worker) else {
            if worker.pid.is_some() {
                // Dead worker left behind, or its pid now belongs to another
                // process; forget it.
                worker.mark_stopped(Utc::now());
                self.marker.save(&worker)?;
            }
            return Ok(ControlStatus::NotRunning);
        };
        let identity = worker.identity.clone();
        let identity = identity.as_deref();

        worker.state = WorkerState::Stopping;
        self.marker.save(&worker)?;

        let forced = if force {
            tracing::info!(pid, "Killing worker");
            self.kill(pid, identity).await?;
            true
        } else {
            tracing::info!(
                pid,
                grace_secs = self.settings.grace_period.as_secs(),
                "Stopping worker",
            );
            match self.spawner.signal(pid, Signal::Terminate) {
                Ok(()) | Err(SupervisorError::NoSuchProcess(_)) => {}
                Err(e) => return Err(e),
            }
            if self.wait_for_exit(pid, identity, self.settings.grace_period).await {
                false
            } else {
                tracing::warn!(pid, "Worker ignored SIGTERM within the grace period; killing");
                self.kill(pid, identity).await?;
                true
            }
        };

        worker.mark_stopped(Utc::now());
        self.marker.save(&worker)?;
        tracing::info!(pid, forced, "Worker stopped");
        Ok(ControlStatus::Stopped { pid, forced })
    }

    async fn kill(&self, pid: u32, identity: Option<&str>) -> Result<(), SupervisorError> {
        if !self.is_worker(pid, identity) {
            return Ok(());
        }
        match self.spawner.signal(pid, Signal::Kill) {
            Ok(()) | Err(SupervisorError::NoSuchProcess(_)) => {}
            Err(e) => return Err(e),
        }
        if !self.wait_for_exit(pid, identity, KILL_WAIT).await {
            tracing::warn!(pid, "Worker still visible after SIGKILL");
        }
        Ok(())
    }

    async fn wait_for_exit(&self, pid: u32, identity: Option<&str>, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        loop {
            if !self.is_worker(pid, identity) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(EXIT_POLL).await;
        }
    }
}

fn failed(operation: &str, error: SupervisorError) -> ControlStatus {
    tracing::error!(operation, error = %error, "Control operation failed");
    ControlStatus::Failed {
        message: error.to_string(),
    }
}
