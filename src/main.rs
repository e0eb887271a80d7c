use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use queuectl::config::{QueueConfig, WorkerConfig};
use queuectl::dashboard::{run_dashboard, DashboardState};
use queuectl::queue::{EnqueueRequest, Job, JobQueue, JobState, Run};
use queuectl::shutdown::install_shutdown_handler;
use queuectl::store::JobFilter;
use queuectl::worker::WorkerPool;
use queuectl::QueueError;

#[derive(Parser, Debug)]
#[command(name = "queuectl")]
#[command(version)]
#[command(about = "A persistent background job queue with retries and a dead letter queue")]
#[command(propagate_version = true)]
struct Args {
    /// Path to the SQLite database
    #[arg(long, global = true, default_value = "queue.db")]
    db: PathBuf,

    /// Output format
    #[arg(long, short = 'o', global = true, default_value = "table")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Enqueue a job from inline JSON or a JSON file
    ///
    /// Example: queuectl enqueue '{"command":"echo hi","max_retries":2}'
    Enqueue {
        /// Job object: {"id"?, "command", "max_retries"?, "run_at"?, "timeout"?}
        job_json: Option<String>,

        /// JSON file containing the job object
        #[arg(long, short = 'f', conflicts_with = "job_json")]
        file: Option<PathBuf>,
    },

    /// Worker management
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },

    /// Show job counts per state and metrics
    Status,

    /// List jobs, newest first
    List {
        /// Only jobs in this state
        #[arg(long)]
        state: Option<JobState>,

        #[arg(long, default_value = "100")]
        limit: usize,
    },

    /// Dead letter queue operations
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },

    /// Config management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Job run history
    Runs {
        #[command(subcommand)]
        command: RunsCommands,
    },

    /// Metrics summary
    Metrics {
        #[command(subcommand)]
        command: MetricsCommands,
    },

    /// Serve the read-only web dashboard
    Dashboard {
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: SocketAddr,
    },
}

#[derive(clap::Subcommand, Debug)]
enum WorkerCommands {
    /// Start workers in the foreground. Ctrl+C drains them gracefully.
    Start {
        /// Number of workers
        #[arg(long, short = 'c', default_value = "1", value_parser = clap::value_parser!(u16).range(1..))]
        count: u16,

        /// Seconds between polls when the queue is empty
        #[arg(long, default_value = "1.0")]
        poll_interval: f64,
    },
}

#[derive(clap::Subcommand, Debug)]
enum DlqCommands {
    /// List dead jobs
    List {
        #[arg(long, default_value = "100")]
        limit: usize,
    },
    /// Move a dead job back to pending
    Retry { job_id: String },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigCommands {
    /// Set a config key
    Set { key: String, value: String },
    /// Get a config key
    Get { key: String },
}

#[derive(clap::Subcommand, Debug)]
enum RunsCommands {
    /// List runs, newest first
    List {
        /// Only runs of this job
        #[arg(long = "job")]
        job_id: Option<String>,

        #[arg(long, default_value = "50")]
        limit: usize,
    },
}

#[derive(clap::Subcommand, Debug)]
enum MetricsCommands {
    /// Show the metrics summary
    Show,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct EnqueueOutput<'a> {
    job_id: &'a str,
    state: JobState,
}

#[derive(Serialize)]
struct ConfigOutput<'a> {
    key: &'a str,
    value: &'a str,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn print_json<T: Serialize>(value: &T) -> Result<(), QueueError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_jobs(jobs: &[Job], format: &OutputFormat) -> Result<(), QueueError> {
    if let OutputFormat::Json = format {
        return print_json(&jobs);
    }
    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }
    println!(
        "{:<38} {:<11} {:<8} {:<25} COMMAND",
        "JOB ID", "STATE", "ATTEMPTS", "RUN AT"
    );
    println!("{}", "-".repeat(100));
    for job in jobs {
        let run_at = job
            .run_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        let command = if job.command.chars().count() > 30 {
            format!("{}...", job.command.chars().take(27).collect::<String>())
        } else {
            job.command.clone()
        };
        println!(
            "{:<38} {:<11} {:<8} {:<25} {}",
            job.id,
            job.state,
            format!("{}/{}", job.attempts, job.max_attempts()),
            run_at,
            command
        );
    }
    println!();
    println!("Showing {} jobs", jobs.len());
    Ok(())
}

fn print_runs(runs: &[Run], format: &OutputFormat) -> Result<(), QueueError> {
    if let OutputFormat::Json = format {
        return print_json(&runs);
    }
    if runs.is_empty() {
        println!("No runs found.");
        return Ok(());
    }
    println!(
        "{:<38} {:<8} {:<8} {:<6} {:<20} FINISHED",
        "JOB ID", "ATTEMPT", "OUTCOME", "EXIT", "STARTED"
    );
    println!("{}", "-".repeat(100));
    for run in runs {
        println!(
            "{:<38} {:<8} {:<8} {:<6} {:<20} {}",
            run.job_id,
            run.attempt,
            run.outcome,
            run.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.finished_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

fn read_enqueue_request(job_json: Option<String>, file: Option<PathBuf>) -> Result<EnqueueRequest, QueueError> {
    let raw = match (job_json, file) {
        (_, Some(path)) => std::fs::read_to_string(path)?,
        (Some(raw), None) => raw,
        (None, None) => {
            return Err(QueueError::Validation(
                "provide job JSON as an argument or use --file".into(),
            ))
        }
    };
    serde_json::from_str(&raw).map_err(|e| QueueError::Validation(format!("invalid job JSON: {e}")))
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run_workers(queue: &JobQueue, count: u16, poll_interval: f64) -> Result<i32, QueueError> {
    let poll_interval = Duration::try_from_secs_f64(poll_interval).map_err(|_| {
        QueueError::Validation(format!("invalid poll interval: {poll_interval}"))
    })?;
    let config = WorkerConfig::default()
        .with_worker_count(usize::from(count))
        .with_poll_interval(poll_interval);

    let shutdown = install_shutdown_handler()?;
    println!("Starting {count} worker(s). Press Ctrl+C to stop gracefully.");
    let report = WorkerPool::new(queue.store(), config).run(shutdown).await;
    if report.is_clean() {
        println!("All workers stopped cleanly.");
    } else {
        eprintln!("{} of {} worker(s) stopped abnormally.", report.failed, report.workers);
    }
    Ok(report.exit_code())
}

async fn run(args: Args) -> Result<i32, QueueError> {
    let config = QueueConfig::new(&args.db);
    let queue = JobQueue::open(&config)?;
    let format = args.output;

    match args.command {
        Commands::Enqueue { job_json, file } => {
            let job = queue.enqueue(read_enqueue_request(job_json, file)?)?;
            match format {
                OutputFormat::Json => print_json(&EnqueueOutput {
                    job_id: &job.id,
                    state: job.state,
                })?,
                OutputFormat::Table => println!("Enqueued job {} ({})", job.id, job.state),
            }
        }
        Commands::Worker {
            command: WorkerCommands::Start { count, poll_interval },
        } => return run_workers(&queue, count, poll_interval).await,
        Commands::Status => {
            let status = queue.status()?;
            match format {
                OutputFormat::Json => print_json(&status)?,
                OutputFormat::Table => {
                    println!("Job counts by state:");
                    for (state, count) in &status.counts {
                        println!("  {:<11} {}", state, count);
                    }
                    let m = &status.metrics;
                    println!();
                    println!("Metrics:");
                    println!("  total_jobs            {}", m.total_jobs);
                    println!("  success_runs          {}", m.success_runs);
                    println!("  failed_runs           {}", m.failed_runs);
                    println!("  timeout_runs          {}", m.timeout_runs);
                    match m.avg_attempts_per_job {
                        Some(avg) => println!("  avg_attempts_per_job  {avg:.2}"),
                        None => println!("  avg_attempts_per_job  -"),
                    }
                }
            }
        }
        Commands::List { state, limit } => {
            let filter = JobFilter { state, limit };
            print_jobs(&queue.list(&filter)?, &format)?;
        }
        Commands::Dlq { command } => match command {
            DlqCommands::List { limit } => {
                print_jobs(&queue.dlq().list_dead_jobs(limit)?, &format)?;
            }
            DlqCommands::Retry { job_id } => {
                let job = queue.dlq().retry(&job_id)?;
                match format {
                    OutputFormat::Json => print_json(&job)?,
                    OutputFormat::Table => println!("Moved job {} from dead to pending", job.id),
                }
            }
        },
        Commands::Config { command } => match command {
            ConfigCommands::Set { key, value } => {
                queue.set_config(&key, &value)?;
                println!("Set {key} = {value}");
            }
            ConfigCommands::Get { key } => {
                let value = queue.get_config(&key)?;
                match format {
                    OutputFormat::Json => print_json(&ConfigOutput {
                        key: &key,
                        value: &value,
                    })?,
                    OutputFormat::Table => println!("{key} = {value}"),
                }
            }
        },
        Commands::Runs {
            command: RunsCommands::List { job_id, limit },
        } => {
            print_runs(&queue.runs(job_id.as_deref(), limit)?, &format)?;
        }
        Commands::Metrics {
            command: MetricsCommands::Show,
        } => print_json(&queue.metrics()?)?,
        Commands::Dashboard { addr } => {
            let shutdown = install_shutdown_handler()?;
            run_dashboard(addr, DashboardState { queue }, shutdown).await?;
        }
    }
    Ok(0)
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            match e {
                QueueError::Validation(_) => 2,
                _ => 1,
            }
        }
    };
    std::process::exit(code);
}
