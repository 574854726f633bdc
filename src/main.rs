// ABOUTME: CLI entry point for telemetry-sync
// ABOUTME: Routes commands to the engine, the planner dry run, discovery and status

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use telemetry_sync::config::{ForwarderConfig, DEFAULT_CONFIG_FILE};
use telemetry_sync::destination::{LabelRegistry, LabelSource, TelemetryClient, TelemetrySink};
use telemetry_sync::engine::SyncEngine;
use telemetry_sync::lock::{self, InstanceLock};
use telemetry_sync::scanner::SourceStructureScanner;
use telemetry_sync::source::SqliteSource;
use telemetry_sync::state::SyncStateStore;

#[derive(Parser)]
#[command(name = "telemetry-sync")]
#[command(
    about = "Forward building-automation time series to a line-protocol telemetry endpoint",
    long_about = None
)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Path to the forwarder configuration
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Telemetry endpoint password (falls back to TELEMETRY_SYNC_PASSWORD env)
    #[arg(long, env = "TELEMETRY_SYNC_PASSWORD", global = true, hide_env_values = true)]
    password: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Synchronise until the cutoff hour or Ctrl+C
    Run {
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },
    /// Show the jobs the next pass would run, without transferring
    Plan,
    /// Show the tables discovered in the source
    Scan,
    /// Show the persisted sync state
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // We need to parse CLI args early to get the log level
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let mut config = ForwarderConfig::load(&cli.config)?;
    if cli.password.is_some() {
        config.destination.password = cli.password;
    }

    match cli.command {
        Commands::Run { once } => run(&config, once).await,
        Commands::Plan => plan(&config).await,
        Commands::Scan => {
            scan(&config);
            Ok(())
        }
        Commands::Status => status(&config),
    }
}

/// Labels from a local document or from the endpoint.
enum ConfiguredLabels<'a> {
    File(LabelRegistry),
    Endpoint(&'a TelemetryClient),
}

impl<'a> ConfiguredLabels<'a> {
    fn new(config: &ForwarderConfig, client: Option<&'a TelemetryClient>) -> Result<Self> {
        if let Some(path) = &config.destination.labels_file {
            return Ok(ConfiguredLabels::File(LabelRegistry::load_file(path)?));
        }
        client
            .map(ConfiguredLabels::Endpoint)
            .context("Fetching labels requires endpoint credentials")
    }
}

impl LabelSource for ConfiguredLabels<'_> {
    async fn load_labels(&self) -> Result<LabelRegistry> {
        match self {
            ConfiguredLabels::File(registry) => Ok(registry.clone()),
            ConfiguredLabels::Endpoint(client) => client.fetch_labels().await,
        }
    }
}

/// Sink for dry runs; planning never submits.
struct DryRun;

impl TelemetrySink for DryRun {
    async fn submit(&self, records: &[String]) -> Result<()> {
        anyhow::bail!("Dry run refused to submit {} record(s)", records.len())
    }
}

fn sqlite_source(config: &ForwarderConfig) -> SqliteSource {
    SqliteSource::new(
        &config.source.root,
        &config.source.time_column,
        config.source.time_encoding,
    )
}

fn telemetry_client(config: &ForwarderConfig) -> Result<TelemetryClient> {
    let destination = &config.destination;
    TelemetryClient::new(
        &destination.base_url,
        destination.username.clone(),
        destination.password()?.to_string(),
        destination.max_records_per_call,
        destination.timeout(),
    )
}

async fn run(config: &ForwarderConfig, once: bool) -> Result<()> {
    let run_id = uuid::Uuid::new_v4();
    let state_path = config.state_path()?;
    let _lock = InstanceLock::acquire(&state_path)?;

    tracing::info!(
        "Run {} for source '{}' ({:?}), state file {:?}",
        run_id,
        config.source.name,
        config.source.root,
        state_path
    );

    let mut store = SyncStateStore::open(&state_path, &config.destination.base_url)?;
    let source = sqlite_source(config);
    let client = telemetry_client(config)?;
    let labels = ConfiguredLabels::new(config, Some(&client))?;
    let engine = SyncEngine::new(config, &source, &client, &labels)?;

    if once {
        tracing::info!("Running single pass...");
        return engine.run(&mut store, None, true).await;
    }

    tracing::info!("Press Ctrl+C to stop");

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);

    // Set up Ctrl+C handler
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received shutdown signal");
                let _ = shutdown_tx_clone.send(());
            }
            Err(e) => tracing::warn!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    engine.run(&mut store, Some(shutdown_rx), false).await
}

async fn plan(config: &ForwarderConfig) -> Result<()> {
    let state_path = config.state_path()?;
    let store = SyncStateStore::load_existing(&state_path)?
        .unwrap_or_else(|| SyncStateStore::unsaved(&state_path, &config.destination.base_url));
    let source = sqlite_source(config);
    let client = match config.destination.labels_file {
        Some(_) => None,
        None => Some(telemetry_client(config)?),
    };
    let labels = ConfiguredLabels::new(config, client.as_ref())?;
    let engine = SyncEngine::new(config, &source, &DryRun, &labels)?;

    let planned = engine.plan(&store).await?;

    println!();
    println!("========================================");
    println!("Backfill jobs: {}", planned.unsynced.len());
    println!("========================================");
    for job in &planned.unsynced {
        println!("  {}", job.describe());
    }
    println!();
    println!("========================================");
    println!("Incremental jobs: {}", planned.incremental.len());
    println!("========================================");
    for job in &planned.incremental {
        println!("  {}", job.describe());
    }
    Ok(())
}

fn scan(config: &ForwarderConfig) {
    let source = sqlite_source(config);
    let result = SourceStructureScanner::new(&source, &config.source.layout).scan();

    println!();
    println!("========================================");
    println!(
        "Discovered {} database(s), {} table(s) in {:?}",
        result.databases.len(),
        result.tables.len(),
        config.source.root
    );
    println!("========================================");
    for database in &result.databases {
        println!("{}", database);
        for table in result.tables_in(database) {
            let columns: Vec<&str> = table.all_columns.iter().map(|c| c.name.as_str()).collect();
            println!(
                "  {} controller={} columns={}",
                table.table_name,
                table.controller_id,
                columns.join(",")
            );
        }
    }
}

fn status(config: &ForwarderConfig) -> Result<()> {
    let state_path = config.state_path()?;
    let lock_status = lock::check_status(&state_path)?;

    println!();
    println!("========================================");
    println!("Sync state: {:?}", state_path);
    println!("========================================");
    match (lock_status.running, lock_status.pid) {
        (true, Some(pid)) => println!("  Forwarder running (PID: {})", pid),
        _ => println!("  Forwarder not running"),
    }

    let Some(store) = SyncStateStore::load_existing(&state_path)? else {
        println!("  No sync state yet");
        return Ok(());
    };
    println!(
        "  Driver fingerprint: {}",
        store.driver_fingerprint().unwrap_or("(none)")
    );
    println!("  Tracked tables: {}", store.len());
    for table in store.tables() {
        let columns: Vec<&str> = table.sensor_columns.iter().map(String::as_str).collect();
        println!(
            "    {} last_synced={} columns={}",
            table.key(),
            table.last_synced.to_rfc3339(),
            columns.join(",")
        );
    }
    Ok(())
}
