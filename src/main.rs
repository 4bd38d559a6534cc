// ABOUTME: CLI entry point for directory-sync
// ABOUTME: One-shot change scans, the polling daemon, and local directory edits

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use directory_sync::config::SyncConfig;
use directory_sync::directory::sqlite::{SqliteConnector, SqliteDirectory};
use directory_sync::schema::ObjectClass;
use directory_sync::sync::{
    ChangerExclusion, JsonLinesHandler, ModifyTimestampSync, SyncDaemon, SyncOptions, SyncToken,
};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "directory-sync")]
#[command(about = "Poll a directory store for created and modified entries", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Path to directory-sync.toml (falls back to DIRECTORY_SYNC_CONFIG)
    #[arg(long, env = "DIRECTORY_SYNC_CONFIG", global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the current sync token (the starting point for a first sync)
    Token {
        #[arg(long, default_value = "__ALL__")]
        object_class: ObjectClass,
    },
    /// Run one change scan and print events as JSON lines
    Sync {
        /// Object class to scan, or __ALL__
        #[arg(long)]
        object_class: ObjectClass,
        /// Resume token from a previous run (omit to only establish a resume point)
        #[arg(long)]
        token: Option<String>,
        /// Attributes to return instead of the configured ones (comma-separated)
        #[arg(long, value_delimiter = ',')]
        attributes: Option<Vec<String>>,
    },
    /// Poll continuously, persisting checkpoints between cycles
    Watch {
        /// Sync interval in seconds (overrides daemon.interval_secs)
        #[arg(long)]
        interval: Option<u64>,
        /// Checkpoint file (overrides daemon.state_path)
        #[arg(long)]
        state: Option<PathBuf>,
        /// Object classes to poll (comma-separated, default: all configured)
        #[arg(long, value_delimiter = ',')]
        object_classes: Vec<ObjectClass>,
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// Edit entries in the local directory store
    Entry {
        #[command(subcommand)]
        action: EntryAction,
    },
}

#[derive(Subcommand)]
enum EntryAction {
    /// Create an entry
    Add {
        #[arg(long)]
        dn: String,
        /// Attribute value as name=value (repeatable)
        #[arg(long = "attr")]
        attrs: Vec<String>,
        /// DN recorded as the creator
        #[arg(long)]
        by: Option<String>,
    },
    /// Replace attribute values of an entry (name= removes the attribute)
    Modify {
        #[arg(long)]
        dn: String,
        #[arg(long = "attr")]
        attrs: Vec<String>,
        /// DN recorded as the modifier
        #[arg(long)]
        by: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    // Events go to stdout, so logs stay on stderr
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config_path = SyncConfig::resolve_path(cli.config.as_deref())?;
    let config = SyncConfig::load(&config_path)?;
    tracing::debug!("Loaded config from {:?}", config_path);

    match cli.command {
        Commands::Token { object_class } => {
            let directory = SqliteDirectory::open(&config.store.path)?;
            let strategy = ModifyTimestampSync::new(
                config.settings(),
                directory,
                config.schema(),
                ChangerExclusion,
            );
            println!("{}", strategy.latest_sync_token(&object_class));
            Ok(())
        }
        Commands::Sync {
            object_class,
            token,
            attributes,
        } => sync_once(&config, object_class, token, attributes),
        Commands::Watch {
            interval,
            state,
            object_classes,
            once,
        } => watch(&config, interval, state, object_classes, once).await,
        Commands::Entry { action } => edit_entry(&config, action),
    }
}

fn sync_once(
    config: &SyncConfig,
    object_class: ObjectClass,
    token: Option<String>,
    attributes: Option<Vec<String>>,
) -> anyhow::Result<()> {
    let directory = SqliteDirectory::open(&config.store.path)?;
    let strategy = ModifyTimestampSync::new(
        config.settings(),
        directory,
        config.schema(),
        ChangerExclusion,
    );

    let token = token.map(SyncToken::Text);
    let options = SyncOptions {
        attributes_to_get: attributes,
    };
    let stdout = std::io::stdout();
    let mut handler = JsonLinesHandler::new(stdout.lock());

    let summary = strategy
        .sync(&object_class, token.as_ref(), &mut handler, &options)
        .with_context(|| format!("Change scan for {} failed", object_class))?;

    tracing::info!(
        "Scanned {}: {} found, {} delivered, {} rejected, next token {}",
        summary.object_class,
        summary.found,
        summary.delivered,
        summary.rejected(),
        summary.resume
    );
    Ok(())
}

async fn watch(
    config: &SyncConfig,
    interval: Option<u64>,
    state: Option<PathBuf>,
    object_classes: Vec<ObjectClass>,
    once: bool,
) -> anyhow::Result<()> {
    let mut daemon_config = config.daemon_config(object_classes);
    if let Some(secs) = interval {
        if secs == 0 {
            bail!("--interval must be greater than zero");
        }
        daemon_config.sync_interval = std::time::Duration::from_secs(secs);
    }
    if let Some(path) = state {
        daemon_config.state_path = path;
    }

    tracing::info!("Store: {}", config.store.path.display());
    tracing::info!("Base context: {}", config.base_context);
    tracing::info!("Checkpoints: {:?}", daemon_config.state_path);

    let daemon = SyncDaemon::new(
        SqliteConnector::new(config.store.path.clone()),
        config.schema(),
        config.settings(),
        JsonLinesHandler::new(std::io::stdout()),
        daemon_config,
    );

    if once {
        let stats = daemon.run_sync_cycle().await?;
        tracing::info!(
            "Sync completed: {} classes, {} found, {} delivered in {}ms",
            stats.classes_synced,
            stats.entries_found,
            stats.events_delivered,
            stats.duration_ms
        );
        if !stats.is_success() {
            for error in &stats.errors {
                tracing::error!("{}", error);
            }
            bail!("Sync cycle had {} errors", stats.errors.len());
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);

    // Set up Ctrl+C handler
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Received shutdown signal");
        let _ = shutdown_tx_clone.send(());
    });

    daemon.run(shutdown_rx).await
}

fn edit_entry(config: &SyncConfig, action: EntryAction) -> anyhow::Result<()> {
    let directory = SqliteDirectory::open(&config.store.path)?;
    let store = directory.store();
    let entry = match action {
        EntryAction::Add { dn, attrs, by } => {
            let attributes = parse_attrs(&attrs)?;
            store
                .add(&dn, attributes, by.as_deref())
                .with_context(|| format!("Failed to add {}", dn))?
        }
        EntryAction::Modify { dn, attrs, by } => {
            let changes = parse_attrs(&attrs)?;
            store
                .modify(&dn, changes, by.as_deref())
                .with_context(|| format!("Failed to modify {}", dn))?
        }
    };
    let projected = entry.select(&["*".to_string(), "+".to_string()]);
    println!("{}", serde_json::to_string_pretty(&projected)?);
    Ok(())
}

/// Groups repeated `name=value` arguments into multi-valued attributes.
/// `name=` yields an empty value list.
fn parse_attrs(attrs: &[String]) -> anyhow::Result<BTreeMap<String, Vec<String>>> {
    let mut parsed: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for attr in attrs {
        let (name, value) = attr
            .split_once('=')
            .with_context(|| format!("Attribute {:?} is not in name=value form", attr))?;
        let name = name.trim();
        if name.is_empty() {
            bail!("Attribute {:?} has an empty name", attr);
        }
        let values = parsed.entry(name.to_string()).or_default();
        if !value.is_empty() {
            values.push(value.to_string());
        }
    }
    Ok(parsed)
}
