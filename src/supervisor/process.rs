//! OS process control behind the [`ProcessSpawner`] seam.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::SupervisorError;

const SAMPLE_TIMEOUT: Duration = Duration::from_secs(5);

/// How the worker is launched. Persisted so a restart reuses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub interval_secs: u64,
    pub headless: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Cooperative shutdown (SIGTERM).
    Terminate,
    /// Immediate kill (SIGKILL).
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

pub trait ProcessSpawner {
    /// Launch a worker and return its pid.
    fn spawn(&self, launch: &LaunchSpec) -> Result<u32, SupervisorError>;

    fn signal(&self, pid: u32, signal: Signal) -> Result<(), SupervisorError>;

    fn is_alive(&self, pid: u32) -> bool;

    /// Tells the process behind `pid` apart from a later one that reuses
    /// the pid. `None` when the pid is gone or cannot be inspected.
    fn identity(&self, pid: u32) -> Option<String>;

    /// CPU and memory of `pid`, or `None` when it cannot be sampled.
    async fn sample(&self, pid: u32) -> Option<ResourceSample>;
}

/// Runs the worker as `jobpilot work ...` in its own process group, with
/// output appended to a log file.
pub struct OsProcessSpawner {
    program: PathBuf,
    config_path: Option<PathBuf>,
    log_path: PathBuf,
    /// Children spawned by this process, kept so exits get reaped.
    children: Mutex<HashMap<u32, Child>>,
}

impl OsProcessSpawner {
    pub fn new(program: impl Into<PathBuf>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            config_path: None,
            log_path: log_path.into(),
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Re-execute the running binary.
    pub fn current_exe(log_path: impl Into<PathBuf>) -> Result<Self, SupervisorError> {
        let program = std::env::current_exe().map_err(SupervisorError::CurrentExe)?;
        Ok(Self::new(program, log_path))
    }

    /// Pass `--config <path>` through to the worker.
    pub fn with_config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    fn children(&self) -> MutexGuard<'_, HashMap<u32, Child>> {
        self.children.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// True when `pid` is a child of ours that has exited. Reaping it keeps
    /// a zombie from answering the liveness probe.
    fn reap(&self, pid: u32) -> bool {
        let mut children = self.children();
        let Some(child) = children.get_mut(&pid) else {
            return false;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(pid, %status, "Reaped worker");
                children.remove(&pid);
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(pid, error = %e, "Could not poll worker exit status");
                false
            }
        }
    }

    fn worker_args(&self, launch: &LaunchSpec) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(path) = &self.config_path {
            args.push("--config".to_string());
            args.push(path.display().to_string());
        }
        args.push("work".to_string());
        args.push("--interval".to_string());
        args.push(launch.interval_secs.to_string());
        if launch.headless {
            args.push("--headless".to_string());
        }
        args
    }
}

fn pid_t(pid: u32) -> Option<libc::pid_t> {
    // pid 0 would address our own process group.
    libc::pid_t::try_from(pid).ok().filter(|&p| p > 0)
}

impl ProcessSpawner for OsProcessSpawner {
    fn spawn(&self, launch: &LaunchSpec) -> Result<u32, SupervisorError> {
        if let Some(dir) = self.log_path.parent() {
            fs::create_dir_all(dir).map_err(SupervisorError::Spawn)?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(SupervisorError::Spawn)?;
        let stderr = log.try_clone().map_err(SupervisorError::Spawn)?;

        let child = Command::new(&self.program)
            .args(self.worker_args(launch))
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(stderr)
            .process_group(0)
            .spawn()
            .map_err(SupervisorError::Spawn)?;

        let pid = child.id();
        tracing::info!(
            pid,
            program = %self.program.display(),
            log = %self.log_path.display(),
            "Spawned worker",
        );
        self.children().insert(pid, child);
        Ok(pid)
    }

    fn signal(&self, pid: u32, signal: Signal) -> Result<(), SupervisorError> {
        let target = pid_t(pid).ok_or(SupervisorError::NoSuchProcess(pid))?;
        let signo = match signal {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        // Safety: kill(2) takes plain integers; a bad pid is reported via errno.
        let ret = unsafe { libc::kill(target, signo) };
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Err(SupervisorError::NoSuchProcess(pid))
        } else {
            Err(SupervisorError::Signal { pid, source: err })
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        let Some(target) = pid_t(pid) else {
            return false;
        };
        if self.reap(pid) {
            return false;
        }
        // Safety: signal 0 performs the permission and existence checks only.
        let ret = unsafe { libc::kill(target, 0) };
        // EPERM: the process exists but belongs to someone else.
        ret == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    /// The kernel start time: from procfs where it exists, else from `ps`.
    fn identity(&self, pid: u32) -> Option<String> {
        pid_t(pid)?;
        if let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) {
            return parse_proc_start_time(&stat);
        }
        let output = Command::new("ps")
            .args(["-o", "lstart=", "-p", &pid.to_string()])
            .stderr(Stdio::null())
            .output()
            .ok()?;
        let started = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (output.status.success() && !started.is_empty()).then(|| format!("lstart {started}"))
    }

    async fn sample(&self, pid: u32) -> Option<ResourceSample> {
        let output = tokio::time::timeout(
            SAMPLE_TIMEOUT,
            tokio::process::Command::new("ps")
                .args(["-o", "%cpu=,rss=", "-p", &pid.to_string()])
                .output(),
        )
        .await;

        match output {
            Ok(Ok(output)) if output.status.success() => {
                parse_ps_line(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(Ok(_)) => None,
            Ok(Err(e)) => {
                tracing::warn!(pid, error = %e, "Failed to run ps");
                None
            }
            Err(_) => {
                tracing::warn!(pid, "Timed out sampling worker resources");
                None
            }
        }
    }
}

/// Field 22 of `/proc/<pid>/stat`, in clock ticks since boot. The command
/// name may contain spaces and parens, so fields are counted from the last `)`.
fn parse_proc_start_time(stat: &str) -> Option<String> {
    let (_, fields) = stat.rsplit_once(')')?;
    let ticks = fields.split_whitespace().nth(19)?;
    ticks.parse::<u64>().ok()?;
    Some(format!("boot+{ticks}"))
}

/// Parse `ps -o %cpu=,rss=` output: CPU percent and resident set in KiB.
fn parse_ps_line(output: &str) -> Option<ResourceSample> {
    let mut fields = output.split_whitespace();
    let cpu_percent = fields.next()?.parse::<f64>().ok()?;
    let rss_kib = fields.next()?.parse::<f64>().ok()?;
    Some(ResourceSample {
        cpu_percent,
        memory_mb: rss_kib / 1024.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ps_output() {
        let sample = parse_ps_line("  3.5 20480\n").unwrap();
        assert_eq!(sample.cpu_percent, 3.5);
        assert_eq!(sample.memory_mb, 20.0);
        assert!(parse_ps_line("").is_none());
        assert!(parse_ps_line("abc 12").is_none());
    }

    #[test]
    fn parses_start_time_past_odd_command_names() {
        let stat = "4242 (my (odd) worker) S 1 4242 4242 0 -1 4194560 120 0 0 0 \
                    3 1 0 0 20 0 1 0 987654 12345678 300 18446744073709551615";
        assert_eq!(parse_proc_start_time(stat).as_deref(), Some("boot+987654"));
        assert!(parse_proc_start_time("4242 (short) S 1").is_none());
        assert!(parse_proc_start_time("garbage").is_none());
    }

    #[test]
    fn identity_is_stable_and_per_process() {
        let spawner = OsProcessSpawner::new("jobpilot", "w.log");
        let own = spawner.identity(std::process::id());
        assert!(own.is_some());
        assert_eq!(spawner.identity(std::process::id()), own);
        assert!(spawner.identity(0).is_none());

        let mut child = Command::new("sleep").arg("5").spawn().unwrap();
        let theirs = spawner.identity(child.id());
        child.kill().unwrap();
        child.wait().unwrap();
        assert!(theirs.is_some());
    }

    #[test]
    fn worker_args_carry_launch_and_config() {
        let spawner = OsProcessSpawner::new("/usr/bin/jobpilot", "/tmp/worker.log")
            .with_config_path(Some(PathBuf::from("/etc/jobpilot.toml")));
        let args = spawner.worker_args(&LaunchSpec {
            interval_secs: 120,
            headless: true,
        });
        assert_eq!(
            args,
            vec![
                "--config",
                "/etc/jobpilot.toml",
                "work",
                "--interval",
                "120",
                "--headless"
            ]
        );

        let args = OsProcessSpawner::new("jobpilot", "w.log").worker_args(&LaunchSpec {
            interval_secs: 300,
            headless: false,
        });
        assert_eq!(args, vec!["work", "--interval", "300"]);
    }

    #[test]
    fn pid_zero_is_never_alive() {
        let spawner = OsProcessSpawner::new("jobpilot", "w.log");
        assert!(!spawner.is_alive(0));
        assert!(matches!(
            spawner.signal(0, Signal::Terminate),
            Err(SupervisorError::NoSuchProcess(0))
        ));
    }

    #[test]
    fn own_process_is_alive() {
        let spawner = OsProcessSpawner::new("jobpilot", "w.log");
        assert!(spawner.is_alive(std::process::id()));
    }

    #[tokio::test]
    async fn exited_child_is_reaped_and_reported_dead() {
        let dir = tempfile::TempDir::new().unwrap();
        let spawner = OsProcessSpawner::new("true", dir.path().join("logs").join("worker.log"));
        let pid = spawner
            .spawn(&LaunchSpec {
                interval_secs: 1,
                headless: true,
            })
            .unwrap();

        let mut alive = true;
        for _ in 0..50 {
            if !spawner.is_alive(pid) {
                alive = false;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!alive, "exited child still reported alive");
        assert!(dir.path().join("logs").join("worker.log").exists());
    }
}
