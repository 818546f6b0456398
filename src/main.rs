//! # Shepherd - Background Worker Control Plane
//!
//! Starts, stops and monitors long-running worker processes (news collection,
//! upload monitoring, row deletion) and keeps their credentials out of sight.
//!
//! ## Features
//!
//! - **Per-worker lifecycle**: independent start/stop with no global lock
//! - **Graceful shutdown**: SIGTERM first, SIGKILL after a grace period
//! - **Crash detection**: dead or recycled PIDs are noticed on the next status check
//! - **Restart safe**: state survives a control-plane restart and live workers are reattached
//! - **Masked configuration**: secrets are never shown and never put on a command line
//!
//! ## Usage
//!
//! ```bash
//! # Start workers and stream their output until Ctrl-C
//! shepherd run news_collection upload_monitor
//!
//! # Inspect and stop from another terminal
//! shepherd status
//! shepherd stop upload_monitor
//! shepherd logs news_collection -n 50
//!
//! # Re-launch news collection every `news_schedule.interval_hours`
//! shepherd schedule
//!
//! # Configuration, secrets masked
//! shepherd config show news_collection
//! shepherd config set news_collection naver_client_secret s3cr3t
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shepherd::commands::{
    config::{ConfigAction, ConfigCommand},
    logs::LogsCommand,
    run::RunCommand,
    schedule::ScheduleCommand,
    status::StatusCommand,
    stop::StopCommand,
};
use shepherd::OrchestratorError;

/// Shepherd - control plane for long-running background workers
#[derive(Parser)]
#[command(
    name = "shepherd",
    about = "Start, stop, monitor and configure background workers",
    long_about = "Supervises the news collection, upload monitor and row deletion workers, with graceful shutdown, crash detection and masked credentials.",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available commands
#[derive(Subcommand)]
enum Commands {
    /// Start workers and supervise them until they exit or Ctrl-C
    Run {
        /// Workers to start (defaults to all)
        names: Vec<String>,
        /// JSON object of per-worker config overrides, keyed by worker name
        #[arg(long, short = 'c')]
        config: Option<String>,
    },
    /// Show worker status
    Status {
        /// Worker name (defaults to all)
        name: Option<String>,
    },
    /// Stop a worker
    Stop {
        name: String,
    },
    /// Stop every active worker
    StopAll,
    /// Print the most recent lines of a worker's log
    Logs {
        name: String,
        /// Number of lines (1-1000)
        #[arg(long, short = 'n', default_value_t = 100)]
        lines: usize,
        /// Delete the log files instead of printing them
        #[arg(long)]
        clear: bool,
    },
    /// Launch news collection on the configured schedule until Ctrl-C
    Schedule {
        /// Seconds between schedule checks
        #[arg(long, default_value_t = 60)]
        check_secs: u64,
    },
    /// Inspect or edit worker configuration
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show configuration with secrets masked
    Show { section: Option<String> },
    /// Show one section in clear text
    Reveal { section: String },
    /// Set a single field; VALUE is parsed as JSON, falling back to a string
    Set {
        section: String,
        /// Dotted field path, e.g. platforms.golftimes.site_pw
        path: String,
        value: String,
    },
    /// Overlay a JSON object on a section
    Apply { section: String, json: String },
}

impl From<ConfigCommands> for ConfigAction {
    fn from(command: ConfigCommands) -> Self {
        match command {
            ConfigCommands::Show { section } => ConfigAction::Show { section },
            ConfigCommands::Reveal { section } => ConfigAction::Reveal { section },
            ConfigCommands::Set {
                section,
                path,
                value,
            } => ConfigAction::Set {
                section,
                path,
                value,
            },
            ConfigCommands::Apply { section, json } => ConfigAction::Apply { section, json },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing; stdout is reserved for command output
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shepherd=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { names, config } => {
            info!("Starting run command for workers: {:?}", names);
            RunCommand::new(names, config).execute().await
        }
        Commands::Status { name } => StatusCommand::new(name).execute().await,
        Commands::Stop { name } => {
            info!("Starting stop command for worker: {}", name);
            StopCommand::new(name).execute().await
        }
        Commands::StopAll => StopCommand::all().execute().await,
        Commands::Logs { name, lines, clear } => {
            LogsCommand::new(name, lines, clear).execute().await
        }
        Commands::Schedule { check_secs } => ScheduleCommand::new(check_secs).execute().await,
        Commands::Config { action } => ConfigCommand::new(action.into()).execute().await,
    };

    if let Err(e) = result {
        match e.downcast_ref::<OrchestratorError>() {
            Some(err) => {
                let body = err.to_body();
                error!("Command failed: {}", body.message);
                eprintln!("{}", serde_json::to_string(&body)?);
            }
            None => error!("Command failed: {}", e),
        }
        std::process::exit(1);
    }

    Ok(())
}
