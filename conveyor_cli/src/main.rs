//! Conveyor CLI — submit and inspect containerized pipeline jobs.
//!
//! `run` reads a job definition from a JSON file, registers it in the store,
//! executes it, and prints the captured log and output. The remaining
//! subcommands inspect or delete jobs other clients submitted.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use eyre::WrapErr;

use conveyor_engine::config::EngineConfig;
use conveyor_engine::models::job::Job;
use conveyor_engine::services::docker_executor::DockerStepExecutor;
use conveyor_engine::services::job_service::JobService;
use conveyor_engine::services::redis_repository::RedisJobRepository;
use conveyor_engine::services::repository::JobRepository;
use conveyor_engine::services::step_executor::StepExecutor;

#[derive(Parser)]
#[command(name = "conveyor", about = "Containerized pipeline job runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a job described by a JSON file
    Run {
        /// Path to the job definition
        file: String,
    },
    /// List known job ids
    List,
    /// Show a job's persisted state
    Show { id: String },
    /// Print a job's log
    Logs {
        id: String,
        /// First log line to print
        #[arg(long, default_value = "0")]
        index: usize,
    },
    /// Delete a job, its record, and its log
    Delete { id: String },
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    // Initialize tracing
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    }

    let cli = Cli::parse();
    let config = EngineConfig::from_env();

    let repository: Arc<dyn JobRepository> = Arc::new(
        RedisJobRepository::new(&config)
            .await
            .wrap_err("connecting to the job store")?,
    );

    match cli.command {
        Command::Run { file } => {
            conveyor_engine::metrics::init_metrics();

            // Only `run` talks to the container runtime; the other
            // subcommands stay usable when the daemon is down.
            let executor: Arc<dyn StepExecutor> = Arc::new(
                DockerStepExecutor::new(&config.docker_host).map_err(|e| eyre::eyre!(e))?,
            );
            let service = JobService::new(repository, executor, &config);

            let definition = tokio::fs::read_to_string(&file)
                .await
                .wrap_err_with(|| format!("reading job definition {file}"))?;
            let mut job: Job =
                serde_json::from_str(&definition).wrap_err("parsing job definition")?;
            if job.steps.is_empty() {
                eyre::bail!("job has no steps");
            }

            service.create(&mut job).await?;
            println!("{}", job.id);

            let result = service.execute(&mut job).await;

            let log = service.get_log(&job, 0).await?;
            for line in &log.lines {
                println!("{line}");
            }

            let stored = service.get_by_id(&job.id).await?;
            if !stored.output.is_empty() {
                print!("{}", stored.output);
            }

            result?;
        }
        Command::List => {
            for job in repository.all().await? {
                println!("{}", job.id);
            }
        }
        Command::Show { id } => {
            let job = repository.get(&id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Command::Logs { id, index } => {
            let job = repository.get(&id).await?;
            let log = repository.get_job_log(&job.id, index).await?;
            for line in &log.lines {
                println!("{line}");
            }
        }
        Command::Delete { id } => {
            let job = repository.get(&id).await?;
            repository.delete(&job.id).await?;
        }
    }

    Ok(())
}
