// ABOUTME: SyncDaemon for watermark polling - runs change scans on a fixed interval
// ABOUTME: Commits per-class checkpoints only after a scan completes successfully

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::interval;

use super::advancer::WatermarkAdvancer;
use super::handler::ChangeHandler;
use super::predicate::ChangerExclusion;
use super::scanner::{ModifyTimestampSync, ScanSummary, SyncOptions, SyncSettings};
use super::state::CheckpointState;
use super::token::SyncToken;
use crate::directory::Connect;
use crate::schema::{ConfiguredSchema, ObjectClass};

/// Configuration for the SyncDaemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Interval between sync cycles
    pub sync_interval: Duration,
    /// Path to store checkpoint state
    pub state_path: PathBuf,
    /// Object classes to poll (empty = every configured class)
    pub object_classes: Vec<ObjectClass>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(60),
            state_path: CheckpointState::default_path(),
            object_classes: Vec::new(),
        }
    }
}

/// Statistics from a sync cycle.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub classes_synced: usize,
    pub entries_found: u64,
    pub events_delivered: u64,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl SyncStats {
    /// Check if the sync cycle completed without errors.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// SyncDaemon polls a directory for changes.
///
/// Each cycle:
/// 1. Loads checkpoint state (adopting changed sync settings, watermarks kept)
/// 2. Scans every object class from its committed watermark
/// 3. Commits the new watermark of each class whose scan succeeded
/// 4. Persists the state for resume after restart
///
/// Scans are blocking and run on the blocking thread pool, one class at a time.
pub struct SyncDaemon<F, H> {
    config: DaemonConfig,
    connector: Arc<F>,
    schema: Arc<ConfiguredSchema>,
    settings: SyncSettings,
    handler: Arc<Mutex<H>>,
}

impl<F, H> SyncDaemon<F, H>
where
    F: Connect,
    H: ChangeHandler + Send + 'static,
{
    pub fn new(
        connector: F,
        schema: ConfiguredSchema,
        settings: SyncSettings,
        handler: H,
        config: DaemonConfig,
    ) -> Self {
        Self {
            config,
            connector: Arc::new(connector),
            schema: Arc::new(schema),
            settings,
            handler: Arc::new(Mutex::new(handler)),
        }
    }

    /// Shared handle to the change handler.
    pub fn handler(&self) -> Arc<Mutex<H>> {
        Arc::clone(&self.handler)
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Run a single sync cycle for all configured object classes.
    pub async fn run_sync_cycle(&self) -> Result<SyncStats> {
        let start = std::time::Instant::now();
        let mut stats = SyncStats::default();

        let mut state = self.load_or_create_state().await?;

        for object_class in self.object_classes() {
            match self.sync_class(&state, &object_class).await {
                Ok(summary) => {
                    stats.classes_synced += 1;
                    stats.entries_found += summary.found;
                    stats.events_delivered += summary.delivered;
                    if !state.commit(&summary) {
                        tracing::warn!(
                            "Checkpoint for {} is newer than {}, keeping it",
                            object_class,
                            summary.resume
                        );
                    }
                }
                Err(e) => {
                    // Log with :? to show full error chain including root cause
                    tracing::error!("Failed to sync {}: {:?}", object_class, e);
                    stats
                        .errors
                        .push(format!("Failed to sync {}: {}", object_class, e));
                }
            }
        }

        state.save(&self.config.state_path).await?;

        stats.duration_ms = start.elapsed().as_millis() as u64;
        Ok(stats)
    }

    /// Run the daemon continuously until stopped.
    pub async fn run(&self, mut shutdown: tokio::sync::broadcast::Receiver<()>) -> Result<()> {
        let mut sync_interval = interval(self.config.sync_interval);
        let mut cycles = 0u64;

        tracing::info!(
            "Starting SyncDaemon for {} with sync_interval={:?}",
            self.connector.location(),
            self.config.sync_interval
        );

        loop {
            tokio::select! {
                biased; // Check shutdown first

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping SyncDaemon");
                    break;
                }
                _ = sync_interval.tick() => {
                    cycles += 1;
                    tracing::info!("Starting sync cycle {}", cycles);

                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => {
                            // An interrupted scan commits nothing; the next start
                            // resumes from the last saved checkpoint.
                            tracing::info!("Shutdown signal received during sync cycle, aborting");
                            break;
                        }
                        result = self.run_sync_cycle() => {
                            match result {
                                Ok(stats) => {
                                    tracing::info!(
                                        "Sync cycle {} completed: {} classes, {} found, \
                                         {} delivered in {}ms",
                                        cycles,
                                        stats.classes_synced,
                                        stats.entries_found,
                                        stats.events_delivered,
                                        stats.duration_ms
                                    );
                                    if !stats.is_success() {
                                        tracing::warn!(
                                            "Sync cycle had {} errors",
                                            stats.errors.len()
                                        );
                                    }
                                }
                                Err(e) => {
                                    tracing::error!("Sync cycle {} failed: {}", cycles, e);
                                }
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn object_classes(&self) -> Vec<ObjectClass> {
        if self.config.object_classes.is_empty() {
            self.schema
                .classes()
                .iter()
                .map(|info| ObjectClass::named(info.name.clone()))
                .collect()
        } else {
            self.config.object_classes.clone()
        }
    }

    async fn load_or_create_state(&self) -> Result<CheckpointState> {
        let fingerprint = self.settings.fingerprint();
        let path = &self.config.state_path;

        if !path.exists() {
            tracing::info!("No checkpoint state at {:?}, starting fresh", path);
            return Ok(CheckpointState::new(
                &self.connector.location(),
                &self.settings.base_context,
                &fingerprint,
            ));
        }

        let mut state = CheckpointState::load(path).await?;
        if !state.matches_settings(&fingerprint) {
            tracing::warn!(
                "Sync settings changed since the last run, resuming {:?} from their checkpoints",
                state.tracked_classes()
            );
            state.adopt_settings(&self.settings.base_context, &fingerprint);
        }
        Ok(state)
    }

    async fn sync_class(
        &self,
        state: &CheckpointState,
        object_class: &ObjectClass,
    ) -> Result<ScanSummary> {
        let committed = state.watermark(object_class.name());
        let since = committed.map(SyncToken::from);

        let connector = Arc::clone(&self.connector);
        let schema = Arc::clone(&self.schema);
        let handler = Arc::clone(&self.handler);
        let settings = self.settings.clone();
        let class = object_class.clone();

        tokio::task::spawn_blocking(move || -> Result<ScanSummary> {
            let connection = connector
                .connect()
                .with_context(|| format!("Failed to connect to {}", connector.location()))?;
            let strategy = ModifyTimestampSync::new(settings, connection, schema, ChangerExclusion);

            let mut handler = handler
                .lock()
                .map_err(|_| anyhow!("change handler lock poisoned"))?;
            let mut advancer = WatermarkAdvancer::resume_from(committed);
            let summary = strategy.scan(
                &mut advancer,
                &class,
                since.as_ref(),
                &mut *handler,
                &SyncOptions::default(),
            )?;
            Ok(summary)
        })
        .await
        .context("Sync task panicked")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_config_default() {
        let config = DaemonConfig::default();
        assert_eq!(config.sync_interval, Duration::from_secs(60));
        assert_eq!(config.state_path, CheckpointState::default_path());
        assert!(config.object_classes.is_empty());
    }

    #[test]
    fn test_sync_stats_is_success() {
        let mut stats = SyncStats::default();
        assert!(stats.is_success());
        stats.errors.push("Failed to sync account: boom".to_string());
        assert!(!stats.is_success());
    }
}
