use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fieldsync_core::{Config, LocalStore};
use fieldsync_syncd::backend::RestBackend;
use fieldsync_syncd::{
    DrainOutcome, EngineSettings, NetworkMonitor, ReachabilityProbe, StatusHub, SyncService,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "fieldsync-syncd", about = "Offline operation queue and sync daemon for fieldsync")]
struct Args {
    /// Path to configuration file (defaults to ~/.config/fieldsync/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Drain the queue in the foreground until interrupted (default)
    Run,
    /// Print queue health as JSON
    Status,
    /// List queued operations, oldest first
    Pending,
    /// Discard one queued operation
    Discard {
        /// Operation id as shown by `pending`
        id: i64,
    },
    /// Discard every operation that has failed at least once
    ClearFailed,
    /// Run a single drain pass and exit
    SyncNow {
        /// Also retry operations that reached the retry ceiling
        #[arg(long)]
        retry_failed: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout is reserved for command output
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let db_path = config.database_path()?;
    let store = Arc::new(
        LocalStore::open(&db_path)
            .with_context(|| format!("Failed to open queue database: {}", db_path.display()))?,
    );

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config, store).await,
        Command::Status => {
            let online = match rest_backend(&config) {
                Ok(backend) => backend.is_reachable().await,
                Err(_) => false,
            };
            let max_retries = EngineSettings::from(&config.sync).max_retries;
            let hub = StatusHub::new(store, NetworkMonitor::new(online), max_retries);
            println!("{}", serde_json::to_string_pretty(&hub.refresh()?)?);
            Ok(())
        }
        Command::Pending => {
            let operations = store.list_operations()?;
            if operations.is_empty() {
                println!("Queue is empty");
            }
            for op in operations {
                println!(
                    "{:>6}  {:<22} {}/{}  retries={}{}",
                    op.id,
                    op.kind(),
                    op.table_name,
                    op.record_id,
                    op.retry_count,
                    op.last_error
                        .map(|e| format!("  last_error={e}"))
                        .unwrap_or_default()
                );
            }
            Ok(())
        }
        Command::Discard { id } => {
            match store.discard_operation(id)? {
                Some(op) => println!("Discarded operation {} ({})", op.id, op.kind()),
                None => println!("No queued operation with id {id}"),
            }
            Ok(())
        }
        Command::ClearFailed => {
            let count = store.clear_failed_operations()?;
            println!("Cleared {count} failed operation(s)");
            Ok(())
        }
        Command::SyncNow { retry_failed } => {
            let service = connect(&config, store).await?.0;
            let outcome = if retry_failed {
                service.retry_failed_now().await?
            } else {
                service.sync_now().await?
            };
            match outcome {
                DrainOutcome::Completed(report) => {
                    println!("{}", serde_json::to_string_pretty(&report)?)
                }
                DrainOutcome::Offline => println!("Backend unreachable, nothing was sent"),
                DrainOutcome::AlreadyRunning => println!("A drain is already in progress"),
            }
            Ok(())
        }
    }
}

fn rest_backend(config: &Config) -> Result<Arc<RestBackend>> {
    let server_url = config
        .sync
        .server_url
        .as_deref()
        .context("No server_url configured in [sync]")?;
    let backend = RestBackend::new(
        server_url,
        config.sync.api_key.clone(),
        config.sync.request_timeout(),
    )?;
    Ok(Arc::new(backend))
}

async fn connect(config: &Config, store: Arc<LocalStore>) -> Result<(Arc<SyncService>, Arc<RestBackend>)> {
    let backend = rest_backend(config)?;
    let monitor = NetworkMonitor::new(backend.is_reachable().await);
    let service = SyncService::new(store, backend.clone(), monitor, &config.sync)?;
    Ok((service, backend))
}

async fn run(config: Config, store: Arc<LocalStore>) -> Result<()> {
    let (service, backend) = connect(&config, store).await?;
    info!(
        server = config.sync.server_url.as_deref().unwrap_or_default(),
        online = service.monitor().is_online(),
        "fieldsync-syncd starting"
    );

    let probe = service
        .monitor()
        .spawn_probe(backend, config.sync.probe_interval());

    service
        .clone()
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {e}");
            }
            info!("Received shutdown signal, stopping fieldsync-syncd");
        })
        .await?;

    probe.abort();
    Ok(())
}
