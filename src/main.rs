use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vanguard::gate::Decision;
use vanguard::memory_gateway::{HttpMemoryGateway, MemoryGateway, NullMemoryGateway};
use vanguard::pipeline::Coordinator;
use vanguard::settings::Settings;
use vanguard::store::{JsonStore, StateStore};
use vanguard::worker::{ProcessExecutor, WorkerExecutor};

#[derive(Parser)]
#[command(name = "vanguard")]
#[command(version, about = "Multi-agent campaign orchestrator")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the config file (default: vanguard.toml discovery)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a campaign goal; prints the campaign id
    Submit {
        goal: String,
        /// Skip Breakdown and Design; a single objective goes straight to
        /// Execute
        #[arg(long)]
        direct: bool,
        /// Drive the campaign loop right away
        #[arg(long)]
        run: bool,
    },
    /// Run (or resume after a restart) one campaign's loop
    Run { campaign_id: String },
    /// Resume every non-terminal campaign
    Resume,
    /// Show campaign state, or list campaigns when no id is given
    Status { campaign_id: Option<String> },
    /// List pending checkpoints
    Checkpoints,
    /// Approve a pending checkpoint
    Approve {
        checkpoint_id: String,
        #[arg(long)]
        feedback: Option<String>,
    },
    /// Reject a pending checkpoint
    Reject {
        checkpoint_id: String,
        #[arg(long)]
        feedback: Option<String>,
    },
    /// Abort a campaign: rejects its checkpoints, tears down its workers
    Abort { campaign_id: String },
    /// Queue guidance; consumed at the campaign's next stage boundary
    Guide { campaign_id: String, note: String },
    /// Stream the transition event feed
    Watch,
}

fn build_executor(settings: &Settings) -> Result<Arc<dyn WorkerExecutor>> {
    match settings.worker.executor.as_str() {
        "process" => Ok(Arc::new(ProcessExecutor::new(&settings.worker))),
        #[cfg(feature = "docker")]
        "docker" => Ok(Arc::new(vanguard::worker::docker::DockerExecutor::new(
            &settings.worker,
        )?)),
        #[cfg(not(feature = "docker"))]
        "docker" => bail!("docker executor requires the `docker` cargo feature"),
        other => bail!("unknown worker executor '{other}' (expected process or docker)"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;
    let store = Arc::new(JsonStore::open(&settings.store.path).context("failed to open store")?);
    let executor = build_executor(&settings)?;
    let memory: Arc<dyn MemoryGateway> = if settings.memory.enabled {
        Arc::new(HttpMemoryGateway::new(&settings.memory.url))
    } else {
        Arc::new(NullMemoryGateway)
    };
    let coordinator = Coordinator::new(store.clone(), executor, memory, settings);

    match cli.command {
        Commands::Submit { goal, direct, run } => {
            let campaign = coordinator.submit(&goal, direct).await?;
            println!("{}", campaign.id);
            if run {
                let status = coordinator.run(&campaign.id).await?;
                println!("campaign {} finished: {status}", campaign.id);
            }
        }
        Commands::Run { campaign_id } => {
            let status = coordinator.run(&campaign_id).await?;
            println!("campaign {campaign_id} finished: {status}");
        }
        Commands::Resume => {
            let resumed = coordinator.resume_all().await?;
            if resumed.is_empty() {
                println!("no active campaigns");
            }
            for (id, status) in resumed {
                println!("campaign {id} finished: {status}");
            }
        }
        Commands::Status { campaign_id } => match campaign_id {
            Some(id) => {
                let report = coordinator.status(&id).await?;
                println!(
                    "campaign {} [{}] {}",
                    report.campaign.id, report.campaign.status, report.campaign.goal
                );
                for objective in &report.objectives {
                    println!(
                        "  {} [{}] {} (review retries: {}, test retries: {})",
                        objective.id,
                        objective.state,
                        objective.title,
                        objective.review_retries,
                        objective.test_retries
                    );
                }
                for checkpoint in &report.pending_checkpoints {
                    println!(
                        "  checkpoint {} [{}] {} pending",
                        checkpoint.id, checkpoint.level, checkpoint.trigger
                    );
                }
                for run in report.runs.iter().filter(|r| !r.is_finalized()) {
                    println!("  run {} [{} {}] in flight", run.id, run.role, run.stage);
                }
            }
            None => {
                for campaign in store.list_campaigns().await? {
                    println!("{} [{}] {}", campaign.id, campaign.status, campaign.goal);
                }
            }
        },
        Commands::Checkpoints => {
            let pending = store.pending_checkpoints().await?;
            if pending.is_empty() {
                println!("no pending checkpoints");
            }
            for checkpoint in pending {
                println!(
                    "{} [{}] {} on {}",
                    checkpoint.id,
                    checkpoint.level,
                    checkpoint.trigger,
                    checkpoint.target.campaign_id()
                );
                println!("{}", checkpoint.payload);
                println!("---");
            }
        }
        Commands::Approve {
            checkpoint_id,
            feedback,
        } => {
            let checkpoint = coordinator
                .resolve_checkpoint(&checkpoint_id, Decision::Approve, feedback)
                .await?;
            println!("checkpoint {} approved", checkpoint.id);
        }
        Commands::Reject {
            checkpoint_id,
            feedback,
        } => {
            let checkpoint = coordinator
                .resolve_checkpoint(&checkpoint_id, Decision::Reject, feedback)
                .await?;
            println!("checkpoint {} rejected", checkpoint.id);
        }
        Commands::Abort { campaign_id } => {
            coordinator.abort(&campaign_id).await?;
            println!("campaign {campaign_id} aborted");
        }
        Commands::Guide { campaign_id, note } => {
            coordinator.guide(&campaign_id, &note).await?;
            println!("guidance queued for {campaign_id}");
        }
        Commands::Watch => {
            let mut events = coordinator.subscribe();
            println!("watching events (ctrl-c to stop)");
            loop {
                match events.recv().await {
                    Ok(event) => println!(
                        "{} {:?} {} {} {}",
                        event.at.format("%H:%M:%S"),
                        event.kind,
                        event.campaign_id,
                        event.subject_id,
                        event.detail
                    ),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        eprintln!("(skipped {n} events)");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    Ok(())
}
