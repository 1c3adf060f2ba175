//! Command-line interface.
//!
//! `work` runs the dispatcher in the foreground; it is also what the
//! supervisor spawns. The remaining commands drive the supervisor.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Background application pipeline and its process supervisor.
#[derive(Debug, Parser)]
#[command(name = "jobpilot", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the configuration file (default: $JOBPILOT_CONFIG, then jobpilot.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the dispatcher poll loop in the foreground.
    Work {
        /// Seconds between poll cycles.
        #[arg(long)]
        interval: Option<u64>,

        /// Emit JSON log lines instead of human-readable output.
        #[arg(long)]
        headless: bool,

        /// Run a single poll cycle and exit.
        #[arg(long)]
        once: bool,
    },

    /// Start the worker in the background.
    Start {
        /// Seconds between poll cycles.
        #[arg(long)]
        interval: Option<u64>,

        /// Launch the worker with human-readable logs.
        #[arg(long)]
        interactive: bool,
    },

    /// Stop the background worker.
    Stop {
        /// Kill immediately instead of waiting for in-flight work.
        #[arg(long)]
        force: bool,
    },

    /// Stop and start the worker with its last launch settings.
    Restart,

    /// Report worker health. Exits 1 when the worker is not running.
    Status,

    /// Watch the worker and restart it after a crash.
    Monitor {
        /// Only report crashes.
        #[arg(long)]
        no_auto_restart: bool,
    },

    /// Run the two reference scenarios against an in-memory store.
    Demo,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_work_subcommand() {
        let cli = Cli::parse_from(["jobpilot", "work", "--interval", "60", "--headless"]);
        match cli.command {
            Command::Work {
                interval,
                headless,
                once,
            } => {
                assert_eq!(interval, Some(60));
                assert!(headless);
                assert!(!once);
            }
            _ => panic!("expected Work command"),
        }
    }

    #[test]
    fn cli_parses_control_subcommands() {
        let cli = Cli::parse_from(["jobpilot", "stop", "--force"]);
        assert!(matches!(cli.command, Command::Stop { force: true }));

        let cli = Cli::parse_from(["jobpilot", "start", "--interactive"]);
        assert!(matches!(
            cli.command,
            Command::Start {
                interval: None,
                interactive: true
            }
        ));

        let cli = Cli::parse_from(["jobpilot", "monitor", "--no-auto-restart"]);
        assert!(matches!(
            cli.command,
            Command::Monitor {
                no_auto_restart: true
            }
        ));
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from(["jobpilot", "--config", "/etc/jobpilot.toml", "-v", "status"]);
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/jobpilot.toml")));
        assert!(matches!(cli.command, Command::Status));
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
