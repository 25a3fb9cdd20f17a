//! queuectl: a persistent background job queue
//!
//! Main binary with subcommands:
//! - `enqueue`: Add a job from a JSON description
//! - `worker`: Start, stop, or run worker processes
//! - `status` / `list`: Inspect the queue
//! - `dlq`: List and requeue dead-lettered jobs
//! - `config`: Set and show queue defaults

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use queuectl_core::{JobState, JobStore};
use queuectl_store::SqliteJobStore;
use queuectl_worker::WorkerConfig;

use crate::supervisor::{PidFile, ProcessSupervisor, WorkerSupervisor, start_workers, stop_workers};

mod commands;
mod format;
mod supervisor;
mod worker;

#[derive(Parser)]
#[command(name = "queuectl")]
#[command(about = "A CLI for managing a background job queue", long_about = None)]
struct Cli {
    /// Path to the job database
    #[arg(long, env = "QUEUECTL_DB", default_value = "queuectl.db", global = true)]
    db: PathBuf,

    /// Where started worker pids are recorded
    #[arg(
        long,
        env = "QUEUECTL_PID_FILE",
        default_value = ".queuectl-pids.json",
        global = true
    )]
    pid_file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a new job, e.g. '{"id":"job1","command":"sleep 2"}'
    Enqueue {
        /// Job description as JSON
        json: String,
    },

    /// Manage worker processes
    Worker {
        #[command(subcommand)]
        command: WorkerCommand,
    },

    /// Show job counts per state and recorded workers
    Status,

    /// List jobs by state (newest first, at most 20)
    List {
        /// State to list
        #[arg(short, long, default_value = "pending")]
        state: JobState,
    },

    /// Manage the dead-letter queue
    Dlq {
        #[command(subcommand)]
        command: DlqCommand,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum WorkerCommand {
    /// Start one or more workers in the background
    Start {
        /// Number of workers to start
        #[arg(short, long, default_value = "1", value_parser = clap::value_parser!(u32).range(1..))]
        count: u32,

        /// File that receives the workers' output
        #[arg(long, default_value = supervisor::DEFAULT_LOG_FILE)]
        log_file: PathBuf,
    },

    /// Stop all recorded workers gracefully (SIGTERM)
    Stop,

    /// Run a worker in the foreground
    Run {
        /// Milliseconds to sleep when no job is ready
        #[arg(long, default_value = "2000")]
        idle_interval_ms: u64,

        /// Milliseconds to sleep after a store error
        #[arg(long, default_value = "5000")]
        error_backoff_ms: u64,

        /// Milliseconds to wait after shutdown before exiting
        #[arg(long, default_value = "1000")]
        shutdown_grace_ms: u64,
    },
}

#[derive(Subcommand)]
enum DlqCommand {
    /// List dead-lettered jobs
    List,

    /// Requeue a dead-lettered job with a fresh retry budget
    Retry {
        /// Job id
        job_id: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Set a configuration value, e.g. `default_max_retries 3`
    Set { key: String, value: String },

    /// Show the defaults new jobs receive
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "queuectl=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let pid_file = PidFile::new(&cli.pid_file);

    match cli.command {
        Commands::Enqueue { json } => {
            let store = open_store(&cli.db)?;
            let out = commands::enqueue_json(&store, &json)
                .await
                .map_err(|e| miette::miette!("error enqueuing job: {}", e))?;
            println!("{out}");
        }

        Commands::Worker { command } => match command {
            WorkerCommand::Start { count, log_file } => {
                let supervisor = ProcessSupervisor::new(&cli.db)
                    .map_err(|e| miette::miette!("{}", e))?
                    .with_log_file(log_file);
                println!("Starting {count} worker(s)...");
                let report = start_workers(&supervisor, &pid_file, count)
                    .map_err(|e| miette::miette!("{}", e))?;
                for handle in &report.started {
                    println!("Started worker with PID: {}", handle.pid);
                }
                if let Some(e) = report.failure {
                    return Err(miette::miette!(
                        "started {} of {} worker(s): {}",
                        report.started.len(),
                        count,
                        e
                    ));
                }
                println!("All workers started. They will run in the background.");
            }

            WorkerCommand::Stop => {
                let supervisor = ProcessSupervisor::new(&cli.db)
                    .map_err(|e| miette::miette!("{}", e))?;
                let report =
                    stop_workers(&supervisor, &pid_file).map_err(|e| miette::miette!("{}", e))?;

                if report.signalled == 0 && report.failures.is_empty() {
                    println!("No active workers found in pid file.");
                } else {
                    for failure in &report.failures {
                        eprintln!("warning: {failure} (may already be stopped)");
                    }
                    println!(
                        "Sent SIGTERM to {} worker(s). Cleared pid file.",
                        report.signalled
                    );
                }
            }

            WorkerCommand::Run {
                idle_interval_ms,
                error_backoff_ms,
                shutdown_grace_ms,
            } => {
                let config = WorkerConfig {
                    idle_interval: Duration::from_millis(idle_interval_ms),
                    error_backoff: Duration::from_millis(error_backoff_ms),
                    shutdown_grace: Duration::from_millis(shutdown_grace_ms),
                };
                worker::run(&cli.db, config).await?;
            }
        },

        Commands::Status => {
            let store = open_store(&cli.db)?;
            let counts = store
                .counts_by_state()
                .await
                .map_err(|e| miette::miette!("error fetching status: {}", e))?;

            let workers = pid_file.load().map_err(|e| miette::miette!("{}", e))?;
            let supervisor = ProcessSupervisor::new(&cli.db)
                .map_err(|e| miette::miette!("{}", e))?;
            let alive = workers.iter().filter(|w| supervisor.is_alive(**w)).count();

            print!("{}", format::render_status(&counts, &workers, alive));
        }

        Commands::List { state } => {
            let store = open_store(&cli.db)?;
            print_listing(&store, state).await?;
        }

        Commands::Dlq { command } => {
            let store = open_store(&cli.db)?;
            match command {
                DlqCommand::List => print_listing(&store, JobState::Dead).await?,
                DlqCommand::Retry { job_id } => {
                    let out = commands::retry_from_dlq(&store, &job_id)
                        .await
                        .map_err(|e| miette::miette!("error retrying job: {}", e))?;
                    println!("{out}");
                }
            }
        }

        Commands::Config { command } => {
            let store = open_store(&cli.db)?;
            match command {
                ConfigCommand::Set { key, value } => {
                    let out = commands::config_set(&store, &key, &value)
                        .await
                        .map_err(|e| miette::miette!("error setting config: {}", e))?;
                    println!("{out}");
                }
                ConfigCommand::Show => print!("{}", commands::config_show(&store).await),
            }
        }
    }

    Ok(())
}

fn open_store(db: &Path) -> Result<SqliteJobStore> {
    SqliteJobStore::open(db).map_err(|e| miette::miette!("{}", e))
}

async fn print_listing(store: &SqliteJobStore, state: JobState) -> Result<()> {
    let out = commands::list(store, state)
        .await
        .map_err(|e| miette::miette!("error listing jobs: {}", e))?;
    print!("{out}");
    Ok(())
}
