use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use evalboard::config::SyncConfig;
use evalboard::db::queue::QueueStatus;
use evalboard::models::{EvaluationDraft, EvaluationFilter};
use evalboard::remote::HttpRemoteStore;
use evalboard::scoring::{self, Rubric};
use evalboard::services::{Connectivity, SyncClient, SyncScheduler};

/// Offline-first client for the evaluation API.
#[derive(Debug, Parser)]
#[command(name = "evalsync", version)]
struct Cli {
    /// API root, e.g. http://127.0.0.1:3000/api
    #[arg(long, env = "EVALSYNC_API_BASE")]
    api_base: Option<String>,

    /// Local cache database
    #[arg(long, env = "EVALSYNC_DATABASE_URL")]
    database: Option<String>,

    /// Do not contact the remote store
    #[arg(long)]
    offline: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the built-in rubric
    Rubric,
    /// Score a draft file without saving it
    Score { file: PathBuf },
    /// Save an evaluation draft (JSON, camelCase keys)
    Submit { file: PathBuf },
    /// List evaluations, newest first
    List {
        #[arg(long)]
        teacher: Option<String>,
        #[arg(long)]
        coordinator: Option<String>,
    },
    /// Show one evaluation
    Show { id: String },
    /// Delete an evaluation from both stores
    Delete { id: String },
    /// Replay the queue and reconcile with the remote store
    Sync {
        /// Put dead-lettered operations back in the queue first
        #[arg(long)]
        requeue_dead: bool,
    },
    /// Show sync status
    Status {
        /// Also list dead-lettered operations
        #[arg(long)]
        dead: bool,
    },
    /// Keep replaying in the background until interrupted
    Watch,
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_draft(file: &Path) -> Result<EvaluationDraft, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(file)?;
    Ok(serde_json::from_str(&raw)?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "evalboard=debug".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    // commands that need neither store
    match &cli.command {
        Command::Rubric => return print_json(&Rubric::standard()),
        Command::Score { file } => {
            let draft = read_draft(file)?;
            let rubric = draft.rubric.clone().unwrap_or_else(Rubric::standard);
            return print_json(&scoring::score(&rubric, &draft.ratings)?);
        }
        _ => {}
    }

    let mut config = SyncConfig::from_env()?;
    if let Some(api_base) = cli.api_base {
        config.api_base = api_base;
    }
    if let Some(database) = cli.database {
        config.database_url = database;
    }

    let remote = Arc::new(HttpRemoteStore::new(&config.api_base, config.timeout)?);
    let client = Arc::new(SyncClient::open(&config, remote, Connectivity::new(false)).await?);
    if cli.offline {
        info!("offline mode, remote store will not be contacted");
    } else {
        client.check_connectivity().await;
    }

    let result = run(&client, cli.command, &config, cli.offline).await;
    client.close().await;
    result
}

async fn run(
    client: &Arc<SyncClient>,
    command: Command,
    config: &SyncConfig,
    offline: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Rubric | Command::Score { .. } => Ok(()),
        Command::Submit { file } => {
            let created = client.create(read_draft(&file)?).await?;
            print_json(&created)
        }
        Command::List {
            teacher,
            coordinator,
        } => {
            let filter = EvaluationFilter {
                teacher_name: teacher,
                coordinator_name: coordinator,
            };
            let loaded = client.load(&filter).await?;
            if loaded.stale {
                warn!("showing cached evaluations, they may be out of date");
            }
            print_json(&loaded)
        }
        Command::Show { id } => print_json(&client.get(&id).await?),
        Command::Delete { id } => print_json(&client.delete(&id).await?),
        Command::Sync { requeue_dead } => {
            if requeue_dead {
                client.requeue_dead().await?;
            }
            match client.replay_queue().await? {
                Some(stats) if stats.reconciled => print_json(&stats),
                Some(stats) => {
                    // nothing replayed, still push and pull once
                    let loaded = client.reconcile().await?;
                    info!("reconciled, {} evaluations in scope", loaded.evaluations.len());
                    print_json(&stats)
                }
                None => {
                    warn!("remote store unreachable, nothing synced");
                    print_json(&client.status().await?)
                }
            }
        }
        Command::Status { dead } => {
            print_json(&client.status().await?)?;
            if dead {
                for entry in client.queued_entries(QueueStatus::Dead).await? {
                    println!(
                        "#{} {} {} attempts={} error={}",
                        entry.seq,
                        entry.operation.as_str(),
                        entry.evaluation_id,
                        entry.attempts,
                        entry.last_error.as_deref().unwrap_or("-")
                    );
                }
            }
            Ok(())
        }
        Command::Watch => {
            let handle = SyncScheduler::new(client.clone(), config.replay_interval).spawn();
            let mut probe = tokio::time::interval(config.timeout);
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = probe.tick(), if !offline => {
                        client.check_connectivity().await;
                    }
                }
            }
            handle.shutdown().await;
            Ok(())
        }
    }
}
