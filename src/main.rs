//! CouchLite listener binary.
//!
//! Startup order: config → logging → metrics → config watcher → signals → serve.

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use clap::Parser;

use couchlite_listener::config::watcher::{apply_updates, ConfigWatcher};
use couchlite_listener::config::{load_config, ServerConfig};
use couchlite_listener::lifecycle::signals::spawn_signal_handler;
use couchlite_listener::observability::{logging, metrics};
use couchlite_listener::store::{DatabaseManager, MemoryReplicator, MemoryStore, Replicator};
use couchlite_listener::{ListenerServer, ListenerState};

#[derive(Parser, Debug)]
#[command(name = "couchlite-listener")]
#[command(about = "CouchDB-compatible replication listener", long_about = None)]
struct Cli {
    /// TOML configuration file. Defaults apply when it does not exist.
    #[arg(short, long, default_value = "couchlite.toml")]
    config: PathBuf,

    /// Override `listener.bind_address`.
    #[arg(short, long)]
    bind: Option<String>,

    /// Refuse every write.
    #[arg(long)]
    read_only: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config_exists = cli.config.exists();
    let mut config = if config_exists {
        load_config(&cli.config)?
    } else {
        ServerConfig::default()
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }
    if cli.read_only {
        config.access.read_only = true;
    }

    logging::init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "couchlite-listener starting");
    if !config_exists {
        tracing::warn!(path = ?cli.config, "Config file not found, using defaults");
    }
    tracing::info!(
        bind_address = %config.listener.bind_address,
        tls = config.listener.tls.is_some(),
        read_only = config.access.read_only,
        databases = config.databases.len(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let store = Arc::new(MemoryStore::with_databases(&config.databases)?);
    let manager: Arc<dyn DatabaseManager> = store;
    let replicator: Arc<dyn Replicator> = Arc::new(MemoryReplicator::new(manager.clone()));
    let live = Arc::new(ArcSwap::from_pointee(config));
    let state = ListenerState::new(live.clone(), manager, replicator)?;

    // Held for the life of the process; dropping it stops the watch.
    // Reloaded files replace the CLI overrides.
    let _watcher = if config_exists {
        let (watcher, updates) = ConfigWatcher::new(&cli.config);
        tokio::spawn(apply_updates(updates, live));
        match watcher.run() {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(error = %e, "Config hot reload disabled");
                None
            }
        }
    } else {
        None
    };

    spawn_signal_handler(state.shutdown.clone());
    ListenerServer::new(state).run().await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
