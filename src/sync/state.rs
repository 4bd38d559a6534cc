// ABOUTME: Checkpoint state for watermark polling - tracks the committed watermark per object class
// ABOUTME: Persisted as JSON so a restarted poller resumes where the last successful scan ended

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;

use super::scanner::ScanSummary;
use super::token::Watermark;

/// Committed progress for a single object class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassCheckpoint {
    pub object_class: String,
    /// Resume watermark of the last successful scan.
    /// Entries changed at or after this instant are picked up next time.
    pub watermark: Watermark,
    pub last_sync_at: DateTime<Utc>,
    /// Entries returned by the last scan
    pub last_found: u64,
    /// Events delivered by the last scan
    pub last_delivered: u64,
}

impl ClassCheckpoint {
    pub fn new(object_class: &str, watermark: Watermark) -> Self {
        Self {
            object_class: object_class.to_string(),
            watermark,
            last_sync_at: Utc::now(),
            last_found: 0,
            last_delivered: 0,
        }
    }
}

/// Checkpoints for every object class polled against one store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Store location (sanitized - no password)
    pub store: String,
    pub base_context: String,
    /// Fingerprint of the settings the checkpoints were taken under
    pub fingerprint: String,
    /// Per-class checkpoints, keyed by object class name
    pub classes: HashMap<String, ClassCheckpoint>,
    /// Version of the state format for future migrations
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CheckpointState {
    pub fn new(store: &str, base_context: &str, fingerprint: &str) -> Self {
        let now = Utc::now();
        Self {
            store: sanitize_url(store),
            base_context: base_context.to_string(),
            fingerprint: fingerprint.to_string(),
            classes: HashMap::new(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Committed watermark for `object_class`, if it has ever been synced.
    pub fn watermark(&self, object_class: &str) -> Option<Watermark> {
        self.classes.get(object_class).map(|cp| cp.watermark)
    }

    pub fn checkpoint(&self, object_class: &str) -> Option<&ClassCheckpoint> {
        self.classes.get(object_class)
    }

    /// Records a successful scan. The stored watermark never moves backwards;
    /// returns false when `summary.resume` is older than what is stored.
    pub fn commit(&mut self, summary: &ScanSummary) -> bool {
        let checkpoint = self
            .classes
            .entry(summary.object_class.clone())
            .or_insert_with(|| ClassCheckpoint::new(&summary.object_class, summary.resume));
        if summary.resume < checkpoint.watermark {
            return false;
        }
        checkpoint.watermark = summary.resume;
        checkpoint.last_sync_at = Utc::now();
        checkpoint.last_found = summary.found;
        checkpoint.last_delivered = summary.delivered;
        self.updated_at = Utc::now();
        true
    }

    /// Forget a class (e.g., it was removed from the configuration)
    pub fn remove(&mut self, object_class: &str) -> Option<ClassCheckpoint> {
        let removed = self.classes.remove(object_class);
        if removed.is_some() {
            self.updated_at = Utc::now();
        }
        removed
    }

    pub fn tracked_classes(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.classes.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn matches_settings(&self, fingerprint: &str) -> bool {
        self.fingerprint == fingerprint
    }

    /// Adopts new settings while keeping every class watermark. Resuming from
    /// the old watermark can only re-deliver entries; dropping it would skip
    /// every change made since the last committed scan.
    pub fn adopt_settings(&mut self, base_context: &str, fingerprint: &str) {
        self.base_context = base_context.to_string();
        self.fingerprint = fingerprint.to_string();
        self.updated_at = Utc::now();
    }

    /// Load state from a JSON file
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read checkpoint state from {:?}", path))?;
        let state: CheckpointState = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse checkpoint state from {:?}", path))?;
        Ok(state)
    }

    /// Save state to a JSON file
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize checkpoint state")?;
        fs::write(path, contents)
            .await
            .with_context(|| format!("Failed to write checkpoint state to {:?}", path))?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from(".directory-sync/checkpoints.json")
    }
}

/// Strips the password from a store URL. Plain file paths pass through.
pub fn sanitize_url(url: &str) -> String {
    if let Ok(mut parsed) = url::Url::parse(url) {
        if parsed.password().is_some() {
            let _ = parsed.set_password(Some("***"));
        }
        parsed.to_string()
    } else {
        url.to_string()
    }
}
