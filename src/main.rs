mod anthropic;
mod cli;
mod collaborator;
mod config;
mod error;
mod heartbeat;
mod pipeline;
mod state_file;
mod state_machine;
mod store;
mod supervisor;
mod ui;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use anthropic::AnthropicClient;
use cli::{Cli, Command};
use collaborator::LlmCollaborator;
use config::AppConfig;
use error::PilotError;
use heartbeat::HeartbeatFile;
use pipeline::{DispatchConfig, Dispatcher};
use store::{MemoryStore, PgStore, WorkStore};
use supervisor::{ControlStatus, LaunchSpec, OsProcessSpawner, Supervisor, SupervisorSettings};

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env is normal.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let json_logs = matches!(cli.command, Command::Work { headless: true, .. });
    init_tracing(cli.verbose, json_logs);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::debug!(error = ?e, "Command failed");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// JSON lines for the headless worker (its output goes to a log file),
/// human-readable output otherwise. Logs go to stderr so command output
/// on stdout stays machine-readable.
fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose { "jobpilot=debug" } else { "jobpilot=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = AppConfig::load(cli.config.as_deref())?;
    tracing::debug!(state_dir = %config.state_dir.display(), model = %config.model, "Loaded configuration");

    match cli.command {
        Command::Work { interval, once, .. } => work(&config, interval, once).await,
        Command::Start {
            interval,
            interactive,
        } => {
            let launch = LaunchSpec {
                interval_secs: interval.unwrap_or(config.worker.poll_interval_secs),
                headless: config.worker.headless && !interactive,
            };
            let sup = supervisor(&config, cli.config)?;
            let spinner = ui::Spinner::start("Starting worker...");
            let status = sup.start(launch).await;
            spinner.finish();
            Ok(report_control(&status))
        }
        Command::Stop { force } => {
            let sup = supervisor(&config, cli.config)?;
            let spinner = ui::Spinner::start("Stopping worker...");
            let status = sup.stop(force).await;
            spinner.finish();
            Ok(report_control(&status))
        }
        Command::Restart => {
            let sup = supervisor(&config, cli.config)?;
            let spinner = ui::Spinner::start("Restarting worker...");
            let status = sup.restart().await;
            spinner.finish();
            Ok(report_control(&status))
        }
        Command::Status => {
            let report = supervisor(&config, cli.config)?.health().await;
            ui::print_health(&report);
            Ok(if report.alive {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Monitor { no_auto_restart } => {
            let sup = supervisor(&config, cli.config)?;
            let cancel = cancel_on_signal();
            sup.monitor(cancel, !no_auto_restart).await;
            Ok(ExitCode::SUCCESS)
        }
        Command::Demo => demo(&config).await,
    }
}

fn report_control(status: &ControlStatus) -> ExitCode {
    ui::print_control(status);
    match status {
        ControlStatus::Failed { .. } => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    }
}

fn collaborator(config: &AppConfig) -> Result<LlmCollaborator<AnthropicClient>, PilotError> {
    if config.api_key.is_empty() {
        return Err(PilotError::MissingApiKey);
    }
    let client = AnthropicClient::new(config.api_key.clone());
    Ok(LlmCollaborator::new(client, config.model.clone()))
}

fn supervisor(
    config: &AppConfig,
    config_path: Option<PathBuf>,
) -> Result<Supervisor<OsProcessSpawner>, PilotError> {
    let log_path = config.state_dir.join("logs").join("worker.log");
    let spawner = OsProcessSpawner::current_exe(log_path)?.with_config_path(config_path);
    let default_launch = LaunchSpec {
        interval_secs: config.worker.poll_interval_secs,
        headless: config.worker.headless,
    };
    Ok(Supervisor::new(
        spawner,
        &config.state_dir,
        SupervisorSettings::from(&config.supervisor),
        default_launch,
    ))
}

async fn work(config: &AppConfig, interval: Option<u64>, once: bool) -> Result<ExitCode> {
    let mut dispatch = DispatchConfig::from(&config.worker);
    if let Some(secs) = interval {
        dispatch.poll_interval = Duration::from_secs(secs);
    }

    let collaborator = collaborator(config)?;
    let database_url = config
        .database_url
        .as_deref()
        .ok_or(PilotError::MissingDatabase)?;
    let pool_size = u32::try_from(dispatch.concurrency).unwrap_or(u32::MAX).saturating_add(1);
    let store = PgStore::connect(database_url, pool_size)
        .await
        .map_err(PilotError::from)?;

    let dispatcher = Dispatcher::new(store, collaborator, dispatch)
        .with_heartbeat(HeartbeatFile::in_dir(&config.state_dir));

    if once {
        let summary = dispatcher
            .run_cycle(&CancellationToken::new())
            .await
            .map_err(PilotError::from)?;
        ui::print_cycle(&summary);
        return Ok(ExitCode::SUCCESS);
    }

    dispatcher.run(cancel_on_signal()).await;
    Ok(ExitCode::SUCCESS)
}

/// Seed an in-memory store with a strong and a weak pairing and run one
/// cycle against the configured collaborator.
async fn demo(config: &AppConfig) -> Result<ExitCode> {
    let store = MemoryStore::new();
    store.insert_content(
        "resume/python-react",
        "Software engineer, 5 years. Python (Django, FastAPI), React and TypeScript. \
         Built and ran a multi-tenant SaaS billing platform on Postgres.",
    );
    store.insert_content(
        "posting/python-react",
        "Full-stack engineer. Required: Python, React, SQL. Nice to have: Kubernetes.",
    );
    store.insert_content(
        "resume/no-experience",
        "Recent hospitality graduate with no experience in software development.",
    );
    store.insert_content(
        "posting/senior-architect",
        "Principal architect. 10 years of senior distributed-systems experience required.",
    );
    let scenarios = [
        (
            "Python/React match",
            store.enqueue("resume/python-react", "posting/python-react"),
        ),
        (
            "Senior role, no experience",
            store.enqueue("resume/no-experience", "posting/senior-architect"),
        ),
    ];

    let mut dispatch = DispatchConfig::from(&config.worker);
    dispatch.batch_size = dispatch.batch_size.max(scenarios.len());
    let dispatcher = Dispatcher::new(store.clone(), collaborator(config)?, dispatch);

    let spinner = ui::Spinner::start("Processing demo applications...");
    let summary = dispatcher.run_cycle(&CancellationToken::new()).await;
    spinner.finish();
    ui::print_cycle(&summary.map_err(PilotError::from)?);

    for (label, id) in scenarios {
        if let Some(item) = dispatcher.store().get(id).await.map_err(PilotError::from)? {
            ui::print_item(label, &item);
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// A token cancelled on Ctrl-C or SIGTERM.
fn cancel_on_signal() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });
    cancel
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT, shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
