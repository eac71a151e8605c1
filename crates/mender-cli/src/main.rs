use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use mender_core::impls::{DevFetcher, DevGenerator, DevRunner, MemoryArtifactStore};
use mender_core::ports::{HashDiff, SystemClock, UlidGenerator};
use mender_core::{
    Collaborators, ExpectedSchema, FieldKind, MenderConfig, Orchestrator, SqliteStore,
};

#[derive(Parser)]
#[command(name = "mender", about = "Self-healing scraper orchestrator")]
struct Cli {
    /// Path to the orchestration database.
    #[arg(long, default_value = "mender.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestration loop.
    Run {
        /// Process at most one task, then exit.
        #[arg(long)]
        once: bool,
    },

    /// Register a source and queue its initial ingestion.
    Add {
        name: String,
        url: String,
        /// Expected output fields, as `name:string|number|boolean`.
        #[arg(long = "field", value_name = "NAME:KIND")]
        fields: Vec<String>,
    },

    /// Queue a refresh scrape for a source.
    Refresh { source: String },

    /// Queue an urgent repair for a source.
    Repair { source: String },

    /// Quarantine a source by hand for a number of hours.
    Quarantine {
        source: String,
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },

    /// Reactivate a dead or quarantined source by hand.
    Reactivate { source: String },

    /// Print queue and health state as JSON.
    Status,
}

fn parse_schema(fields: &[String]) -> anyhow::Result<ExpectedSchema> {
    let mut parsed = Vec::with_capacity(fields.len());
    for field in fields {
        let (name, kind) = field
            .split_once(':')
            .with_context(|| format!("field '{field}' is not NAME:KIND"))?;
        let kind = match kind {
            "string" => FieldKind::String,
            "number" => FieldKind::Number,
            "boolean" => FieldKind::Boolean,
            other => bail!("unknown field kind '{other}' in '{field}'"),
        };
        parsed.push((name.to_string(), kind));
    }
    Ok(ExpectedSchema::new(parsed))
}

fn build_orchestrator(db: &PathBuf) -> anyhow::Result<Orchestrator> {
    let store = Arc::new(SqliteStore::open(db).context("opening database")?);
    let clock = Arc::new(SystemClock);
    let ids = Arc::new(UlidGenerator::new(clock.clone()));

    // Dev collaborators: real fetcher/generator backends plug in here.
    let collaborators = Collaborators {
        fetcher: Arc::new(DevFetcher::new(clock.clone())),
        differ: Arc::new(HashDiff),
        generator: Arc::new(DevGenerator::new(clock.clone())),
        artifacts: Arc::new(MemoryArtifactStore::new()),
        runner: Arc::new(DevRunner),
    };

    Ok(Orchestrator::new(
        store,
        collaborators,
        clock,
        ids,
        MenderConfig::default(),
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let orchestrator = build_orchestrator(&cli.db)?;

    match cli.command {
        Command::Run { once } => {
            let report = orchestrator.recover()?;
            if report.requeued + report.failed > 0 {
                info!(
                    requeued = report.requeued,
                    failed = report.failed,
                    "recovered in-flight tasks from previous run"
                );
            }
            if once {
                let worked = orchestrator.run_once().await?;
                info!(worked, "single iteration done");
            } else {
                let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("shutdown requested");
                        let _ = shutdown_tx.send(true);
                    }
                });
                orchestrator.run(shutdown_rx).await?;
            }
        }
        Command::Add { name, url, fields } => {
            let schema = parse_schema(&fields)?;
            let task = orchestrator.add_source(&name, &url, schema)?;
            println!("queued ingest {} for '{name}'", task.id);
        }
        Command::Refresh { source } => {
            let task = orchestrator.refresh_source(&source)?;
            println!("queued refresh {} for '{source}'", task.id);
        }
        Command::Repair { source } => {
            let task = orchestrator.force_repair(&source)?;
            println!("queued repair {} for '{source}'", task.id);
        }
        Command::Quarantine { source, hours } => {
            let health = orchestrator.health().quarantine(&source, hours)?;
            println!(
                "'{source}' quarantined until {}",
                health
                    .quarantine_until
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default()
            );
        }
        Command::Reactivate { source } => {
            let health = orchestrator.health().reactivate(&source)?;
            println!("'{source}' is now {}", health.state.as_str());
        }
        Command::Status => {
            let status = orchestrator.status()?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }
    Ok(())
}
