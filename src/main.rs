use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::sync::Arc;
use vaultd::core::notifications::create_notifier;
use vaultd::core::{Dumper, FakeDumper, JobKind, Orchestrator, PgDumper, Scheduler};
use vaultd::storage::{DriveStore, FileTokenStore, MemoryStore, RemoteStore};
use vaultd::{config, context, db, logging};

#[derive(Parser)]
#[command(name = "vaultd")]
#[command(about = "Offsite datastore backup and restore daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true)]
    simulation: Option<bool>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run unattended with the cron scheduler.
    Daemon(DaemonArgs),
    /// Run one backup now.
    Backup,
    /// Download a prior backup and leave the recovered archive on disk.
    Restore {
        /// Remote file id of the artifact to restore.
        file_id: String,
        /// Target database name; recorded for the operator, not interpreted.
        #[arg(long)]
        target_db: Option<String>,
    },
    /// Show the active or most recent job from the ledger.
    Status,
    /// Show the most recent jobs.
    History {
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
    /// Print the OAuth2 consent URL for the remote storage provider.
    Auth,
    /// Exchange an OAuth2 authorization code and persist the tokens.
    AuthCode { code: String },
}

#[derive(Args, Serialize)]
struct DaemonArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    temp_dir: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    schedule: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    retention_keep: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    simulation: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.command {
        Commands::Daemon(args) => config::AppConfig::new(Some(args))?,
        _ => config::AppConfig::new(None::<&DaemonArgs>)?,
    };
    if let Some(simulation) = cli.simulation {
        config.simulation = simulation;
    }

    logging::init(logging::LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
    });

    match &cli.command {
        Commands::Daemon(_) => run_daemon(config).await,
        Commands::Backup => run_backup(config).await,
        Commands::Restore { file_id, target_db } => {
            run_restore(config, file_id, target_db.as_deref()).await
        }
        Commands::Status => run_status(config).await,
        Commands::History { limit } => run_history(config, *limit).await,
        Commands::Auth => {
            let store = build_drive_store(&config)?;
            println!("Visit this URL to authorize access:\n{}", store.auth_url());
            Ok(())
        }
        Commands::AuthCode { code } => {
            let store = build_drive_store(&config)?;
            store.exchange_code(code).await?;
            println!("Tokens stored at {}", config.token_path.display());
            Ok(())
        }
    }
}

async fn build_orchestrator(config: config::AppConfig) -> Result<Arc<Orchestrator>> {
    let conn = db::init(&config.ledger_path).await?;

    let dumper: Arc<dyn Dumper> = if config.simulation {
        Arc::new(FakeDumper::default())
    } else {
        Arc::new(PgDumper::new(config.pg_dump_path.clone()))
    };

    let store: Arc<dyn RemoteStore> = if config.simulation {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(build_drive_store(&config)?)
    };

    let notifier = create_notifier(&config);
    let ctx = context::AppContext::new(config, conn);

    Ok(Arc::new(Orchestrator::new(ctx, dumper, store, notifier)))
}

fn build_drive_store(config: &config::AppConfig) -> Result<DriveStore> {
    let client_id = config
        .oauth_client_id
        .clone()
        .context("oauth_client_id must be configured")?;
    let client_secret = config
        .oauth_client_secret
        .clone()
        .context("oauth_client_secret must be configured")?;
    let redirect_uri = config
        .oauth_redirect_uri
        .clone()
        .context("oauth_redirect_uri must be configured")?;

    Ok(DriveStore::new(
        client_id,
        client_secret,
        redirect_uri,
        Arc::new(FileTokenStore::new(config.token_path.clone())),
        config.drive_folder_id.clone(),
    ))
}

async fn run_daemon(config: config::AppConfig) -> Result<()> {
    let schedule = config.schedule.clone();
    let orchestrator = build_orchestrator(config).await?;
    let scheduler = Scheduler::new(&schedule, orchestrator)?;
    scheduler.run().await;
    Ok(())
}

async fn run_backup(config: config::AppConfig) -> Result<()> {
    let orchestrator = build_orchestrator(config).await?;
    let job = orchestrator.start_backup(JobKind::Manual, None).await?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

async fn run_restore(
    config: config::AppConfig,
    file_id: &str,
    target_db: Option<&str>,
) -> Result<()> {
    if let Some(target) = target_db {
        println!("Restore target (operator-run load step): {target}");
    }
    let orchestrator = build_orchestrator(config).await?;
    let job = orchestrator.restore_backup(file_id).await?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

async fn run_status(config: config::AppConfig) -> Result<()> {
    let conn = db::init(&config.ledger_path).await?;
    match db::jobs::latest(&conn).await? {
        Some(job) => {
            if job.status.is_terminal() {
                println!("No job in flight; last run:");
            } else {
                println!("Job in flight:");
            }
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        None => println!("No jobs recorded yet"),
    }
    Ok(())
}

async fn run_history(config: config::AppConfig, limit: u32) -> Result<()> {
    let conn = db::init(&config.ledger_path).await?;
    let jobs = db::jobs::recent(&conn, limit).await?;
    println!("{}", serde_json::to_string_pretty(&jobs)?);
    Ok(())
}
