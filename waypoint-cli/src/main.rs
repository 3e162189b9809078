//! Waypoint CLI tool

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use waypoint_core::EntityId;

mod commands;
mod connect;
mod polling;

#[derive(Parser)]
#[command(name = "waypoint")]
#[command(author, version, about = "Attraction enrichment pipeline CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Database URL
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Control-plane redis URL
    #[arg(long, env = "REDIS_URL", global = true)]
    redis_url: Option<String>,

    /// Key prefix of the control plane
    #[arg(long, env = "WAYPOINT_CONTROL_PREFIX", default_value = "waypoint", global = true)]
    prefix: String,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending database migrations
    Migrate,

    /// Start a pipeline run
    Start {
        /// Entity ids to enrich
        #[arg(required_unless_present = "file", conflicts_with = "file")]
        entity_ids: Vec<i64>,

        /// Read entity ids from a file (JSON array, or one id per line)
        #[arg(long)]
        file: Option<PathBuf>,

        /// Run metadata (JSON object)
        #[arg(long)]
        metadata: Option<String>,

        /// Wait for the run to finish before returning
        #[arg(long)]
        wait: bool,

        /// Timeout in seconds when using --wait
        #[arg(long, default_value = "3600")]
        timeout: u64,

        /// Poll interval in seconds when using --wait
        #[arg(long, default_value = "5")]
        poll_interval: u64,
    },

    /// Show the status of a run
    Status {
        /// Run ID
        run_id: String,

        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Re-seed the incomplete entities of a run
    Resume {
        /// Run ID
        run_id: String,

        /// Also retry the failed stage of stalled entities
        #[arg(long)]
        retry_failed: bool,
    },

    /// Hard stop: discard every queued unit and lock
    Stop {
        /// Confirm the hard stop
        #[arg(long)]
        yes: bool,
    },

    /// List recent runs
    Runs {
        /// Number of runs to show
        #[arg(long, default_value = "20")]
        limit: i64,
    },

    /// Show collected item counters of a run
    Tracking {
        /// Run ID
        run_id: String,

        /// Number of top entities to show
        #[arg(long, default_value = "10")]
        top: usize,

        /// Show the counters of a single entity
        #[arg(long, conflicts_with = "empty")]
        entity: Option<i64>,

        /// List entities with nothing collected
        #[arg(long)]
        empty: bool,
    },

    /// Show the depth of every dispatch queue
    Queues,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let targets = connect::Targets {
        database_url: cli.database_url,
        redis_url: cli.redis_url,
        prefix: cli.prefix,
    };

    match cli.command {
        Commands::Migrate => {
            commands::migrate::execute(targets.database_url()?).await?;
        }
        Commands::Start {
            entity_ids,
            file,
            metadata,
            wait,
            timeout,
            poll_interval,
        } => {
            let orchestrator = targets.orchestrator().await?;
            let status = commands::start::execute(
                &orchestrator,
                commands::start::StartArgs {
                    entity_ids,
                    file,
                    metadata,
                    wait,
                    timeout,
                    poll_interval,
                },
            )
            .await?;

            // A run that finished with stalled entities exits non-zero
            if status == Some(waypoint_core::RunStatus::PartialFailure) {
                std::process::exit(1);
            }
        }
        Commands::Status { run_id, json } => {
            let orchestrator = targets.orchestrator().await?;
            commands::status::execute(&orchestrator, &run_id, json).await?;
        }
        Commands::Resume {
            run_id,
            retry_failed,
        } => {
            let orchestrator = targets.orchestrator().await?;
            commands::resume::execute(&orchestrator, &run_id, retry_failed).await?;
        }
        Commands::Stop { yes } => {
            if !yes {
                anyhow::bail!(
                    "A hard stop discards every queued unit of every run; pass --yes to confirm"
                );
            }
            let orchestrator = targets.orchestrator().await?;
            commands::stop::execute(&orchestrator).await?;
        }
        Commands::Runs { limit } => {
            let orchestrator = targets.orchestrator().await?;
            commands::runs::execute(&orchestrator, limit).await?;
        }
        Commands::Tracking {
            run_id,
            top,
            entity,
            empty,
        } => {
            let view = match (entity, empty) {
                (Some(id), _) => commands::tracking::TrackingView::Entity(EntityId(id)),
                (None, true) => commands::tracking::TrackingView::Empty,
                (None, false) => commands::tracking::TrackingView::Summary { top },
            };
            let orchestrator = targets.orchestrator().await?;
            commands::tracking::execute(&orchestrator, &run_id, view).await?;
        }
        Commands::Queues => {
            let orchestrator = targets.orchestrator().await?;
            commands::runs::queues(&orchestrator).await?;
        }
    }

    Ok(())
}
