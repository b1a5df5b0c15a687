//! Configuration file watcher for hot reload.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::ServerConfig;

/// A watcher that monitors the configuration file for changes.
pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<ServerConfig>,
}

impl ConfigWatcher {
    /// Create a new ConfigWatcher.
    ///
    /// Returns the watcher and a receiver for configuration updates.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<ServerConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();

        (
            Self {
                path: path.to_path_buf(),
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching the file in a background thread.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.update_tx.clone();
        let path = self.path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        tracing::info!(path = ?path, "Config file change detected, reloading");
                        match load_config(&path) {
                            Ok(new_config) => {
                                let _ = tx.send(new_config);
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "Failed to reload config, keeping current configuration");
                            }
                        }
                    }
                }
                Err(e) => tracing::error!(error = ?e, "Watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.path, "Config watcher started");
        Ok(watcher)
    }
}

/// Swap every received config into `live` until the sender goes away.
///
/// Only settings read per request (access, limits) take effect; the
/// listener socket and log setup keep their startup values.
pub async fn apply_updates(
    mut updates: mpsc::UnboundedReceiver<ServerConfig>,
    live: Arc<ArcSwap<ServerConfig>>,
) {
    while let Some(config) = updates.recv().await {
        let previous = live.load();
        if previous.listener.bind_address != config.listener.bind_address {
            tracing::warn!(
                bind_address = %config.listener.bind_address,
                "Listener address changes need a restart"
            );
        }
        tracing::info!(
            read_only = config.access.read_only,
            max_body_size = config.limits.max_body_size,
            "Configuration reloaded"
        );
        live.store(Arc::new(config));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_apply_updates_swaps_config() {
        let live = Arc::new(ArcSwap::from_pointee(ServerConfig::default()));
        let (tx, rx) = mpsc::unbounded_channel();

        let mut next = ServerConfig::default();
        next.access.read_only = true;
        tx.send(next).unwrap();
        drop(tx);

        apply_updates(rx, live.clone()).await;
        assert!(live.load().access.read_only);
    }
}
