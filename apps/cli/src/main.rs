//! Procura CLI - command-line driver for the procura workflow engine
//!
//! Provides a `procura` command that runs simulated end-to-end workflows and
//! inspects the telemetry stored in an execution database.

mod commands;
mod simulation;
mod store;

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};
use procura_core::EngineConfig;
use procura_orchestrator::ApprovalDecision;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use commands::{inspect, simulate};

/// Procura - quote-request workflow engine
#[derive(Parser, Debug)]
#[command(
    name = "procura",
    author,
    version,
    about = "Procura - quote-request workflow orchestration",
    long_about = "Procura drives quote requests from detection through supplier contact, response collection,\ndeliverable generation, human approval and delivery, with retries, circuit breakers and recovery."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error); overrides RUST_LOG
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Engine configuration file (overrides PROCURA_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Execution database selection shared by the inspection commands.
#[derive(ClapArgs, Debug, Clone)]
struct DbArgs {
    /// SQLite execution database (defaults to the configured storage path)
    #[arg(long)]
    db: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run workflows end to end against simulated collaborators
    ///
    /// Waits run on a manual clock, so a 48-hour response window
    /// completes instantly.
    Simulate {
        /// Detection confidence reported by the simulated classifier
        #[arg(long, default_value_t = 0.9)]
        confidence: f64,

        /// Treat the trigger as not matching at all
        #[arg(long)]
        no_match: bool,

        /// Number of recipients the contact phase reaches
        #[arg(long, default_value_t = 3)]
        recipients: u32,

        /// Number of recipients that reply
        #[arg(long, default_value_t = 2)]
        responders: u32,

        /// Hours after contact at which the first reply arrives
        #[arg(long, default_value_t = 1)]
        reply_after_hours: u64,

        /// Approval decision (approved, rejected, edited)
        #[arg(long, default_value = "approved")]
        decision: ApprovalDecision,

        /// Leave the workflow waiting for approval
        #[arg(long)]
        leave_pending: bool,

        /// Fail every delivery attempt
        #[arg(long)]
        fail_delivery: bool,

        /// Response window override in hours
        #[arg(long)]
        window_hours: Option<u64>,

        /// Poll interval override in minutes
        #[arg(long)]
        poll_minutes: Option<u64>,

        /// Number of independent workflows to run concurrently
        #[arg(long, default_value_t = 1)]
        runs: usize,

        /// Persist executions to this SQLite database
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Print the health summary over the trend window
    Health {
        #[command(flatten)]
        db: DbArgs,
    },

    /// Raise stuck alerts for executions without progress
    CheckStuck {
        #[command(flatten)]
        db: DbArgs,
    },

    /// Evaluate response, acceptance and failure-rate trends
    Trends {
        #[command(flatten)]
        db: DbArgs,
    },

    /// Show one execution record
    Show {
        /// Workflow id
        workflow_id: String,

        #[command(flatten)]
        db: DbArgs,
    },

    /// Record downstream acceptance of a delivered deliverable
    RecordOutcome {
        /// Workflow id
        workflow_id: String,

        /// Whether the deliverable was accepted
        #[arg(long, action = clap::ArgAction::Set)]
        accepted: bool,

        #[command(flatten)]
        db: DbArgs,
    },

    /// Clear the alert raised for an execution
    ResolveAlert {
        /// Workflow id
        workflow_id: String,

        #[command(flatten)]
        db: DbArgs,
    },
}

fn init_tracing(log_level: Option<&str>, json: bool) {
    let filter = match log_level {
        Some(level) => EnvFilter::new(format!("procura={level},procura_core={level},procura_orchestrator={level}")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("procura=info")),
    };

    // Logs go to stderr so command output on stdout stays machine-readable.
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(fmt::layer().with_target(false).with_writer(std::io::stderr)).init();
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::from_env()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_level.as_deref(), args.json_logs);

    let config = load_config(args.config.as_ref())?;

    match args.command {
        Command::Simulate {
            confidence,
            no_match,
            recipients,
            responders,
            reply_after_hours,
            decision,
            leave_pending,
            fail_delivery,
            window_hours,
            poll_minutes,
            runs,
            db,
        } => {
            let scenario = simulation::Scenario {
                is_match: !no_match,
                confidence,
                recipients,
                responders,
                reply_after_hours,
                fail_delivery,
            };
            let options = simulate::SimulateOptions {
                decision: (!leave_pending).then_some(decision),
                window_hours,
                poll_minutes,
                runs,
                db,
            };
            simulate::execute(config, scenario, options).await?;
        }
        Command::Health { db } => inspect::health(&config, db.db).await?,
        Command::CheckStuck { db } => inspect::check_stuck(&config, db.db).await?,
        Command::Trends { db } => inspect::trends(&config, db.db).await?,
        Command::Show { workflow_id, db } => inspect::show(&config, db.db, &workflow_id).await?,
        Command::RecordOutcome { workflow_id, accepted, db } => {
            inspect::record_outcome(&config, db.db, &workflow_id, accepted).await?;
        }
        Command::ResolveAlert { workflow_id, db } => inspect::resolve_alert(&config, db.db, &workflow_id).await?,
    }

    Ok(())
}
