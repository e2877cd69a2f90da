use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use factgraph::dispatch::ExtractorLoader;
use factgraph::graph::{Extractor, PatternExtractor};
use factgraph::{Config, KnowledgeService, TenantId, WorkerPool};

#[derive(Parser, Debug)]
#[command(name = "factgraph")]
#[command(about = "Tenant-scoped knowledge graph for prompt augmentation")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply pending schema migrations
    Migrate,
    /// Run update workers until Ctrl-C
    Worker {
        /// Number of workers (defaults to dispatcher.workers)
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Queue a message for knowledge extraction
    Enqueue {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        text: String,
    },
    /// Print the facts retrieval would add to a prompt
    Retrieve {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        query: String,
    },
    /// List terminally failed tasks
    Failed {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Show task counts per status
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load()?;

    // RUST_LOG wins over the configured level
    env_logger::Builder::from_env(
        env_logger::Env::default().filter_or("RUST_LOG", config.store.log_level.as_str()),
    )
    .init();
    log::info!("Database path: {}", config.db_path().display());

    let service = KnowledgeService::from_config(&config).await?;

    match args.command {
        Command::Migrate => {
            // from_config already applied migrations
            println!("Schema is up to date at {}", config.db_path().display());
        }
        Command::Worker { workers } => run_workers(&config, &service, workers).await?,
        Command::Enqueue { tenant, text } => {
            let tenant = TenantId::new(&tenant)?;
            let task_id = service
                .dispatcher()
                .enqueue(&tenant, &text)
                .await
                .context("Failed to enqueue task")?;
            println!("{}", task_id);
        }
        Command::Retrieve { tenant, query } => {
            let tenant = TenantId::new(&tenant)?;
            let facts = service
                .retrieval()
                .retrieve_facts(&tenant, &query)
                .await
                .context("Retrieval failed")?;
            if facts.is_empty() {
                println!("No facts.");
            }
            for fact in facts {
                println!("{:.3}  {}", fact.score, fact.text);
            }
        }
        Command::Failed { limit } => {
            let failed = service.dispatcher().failed_tasks(limit).await?;
            if failed.is_empty() {
                println!("No failed tasks.");
            }
            for task in failed {
                println!(
                    "{}  tenant={}  attempts={}  error={}",
                    task.task_id,
                    task.tenant_id,
                    task.attempt_count,
                    task.last_error.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Stats => {
            let stats = service.dispatcher().stats().await?;
            println!("pending:   {}", stats.pending);
            println!("in_flight: {}", stats.in_flight);
            println!("done:      {}", stats.done);
            println!("failed:    {}", stats.failed);
        }
    }

    Ok(())
}

async fn run_workers(config: &Config, service: &KnowledgeService, workers: Option<usize>) -> Result<()> {
    let workers = workers.unwrap_or(config.dispatcher.workers);
    if workers == 0 {
        anyhow::bail!("--workers must be greater than 0");
    }
    let loader: ExtractorLoader = Arc::new(|| Ok(Box::new(PatternExtractor::new()?) as Box<dyn Extractor>));

    let pool = WorkerPool::spawn(
        workers,
        service.dispatcher().clone(),
        Arc::new(service.update_engine()),
        loader,
        config.attempt_timeout(),
        config.poll_interval(),
    )
    .context("Failed to start worker pool")?;
    log::info!("Started {} update workers", pool.len());

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    log::info!("Shutting down workers");
    pool.shutdown().await;
    Ok(())
}
