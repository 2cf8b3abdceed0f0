//! Run manifest for resumable pipelines.
//!
//! - Records which steps completed and where their checkpoints live
//! - Persisted atomically (write-then-rename) with a backup of the previous copy
//! - A missing manifest means "nothing to resume"

use crate::models::{ConfigError, Result, SieveError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Completed step entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Zero-based step index
    pub index: usize,
    /// Operator name
    pub operator: String,
    /// Identity of the step's configuration; a changed step is not resumable
    #[serde(default)]
    pub fingerprint: String,
    /// Rows read by the step, if it read at all
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_in: Option<usize>,
    /// Rows written to the checkpoint
    pub rows_out: usize,
    /// Checkpoint written by the step
    pub checkpoint: PathBuf,
    /// Wall time of the step
    pub duration_ms: u64,
    /// Completion timestamp
    pub completed_at: DateTime<Utc>,
}

/// Manifest for one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    /// Unique run identifier
    pub run_id: String,
    /// Operator names in step order
    pub pipeline: Vec<String>,
    /// Completed steps in order
    pub steps: Vec<StepRecord>,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

impl RunManifest {
    /// Create a manifest for a fresh run.
    pub fn new(pipeline: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            pipeline,
            steps: Vec::new(),
            started_at: now,
            updated_at: now,
        }
    }

    /// Append a completed step, replacing any stale entry at or after its index.
    pub fn record(&mut self, record: StepRecord) {
        self.steps.retain(|s| s.index < record.index);
        self.steps.push(record);
        self.updated_at = Utc::now();
    }

    /// Number of leading steps that completed, still have their checkpoint on
    /// disk, and were produced by the same step configuration (`fingerprints`,
    /// one per step).
    ///
    /// Fails if the manifest was written by a different pipeline.
    pub fn resumable_prefix(&self, pipeline: &[String], fingerprints: &[String]) -> Result<usize> {
        if self.pipeline != pipeline {
            return Err(ConfigError::Invalid(format!(
                "cannot resume: cache was produced by pipeline {:?}, current pipeline is {:?}",
                self.pipeline, pipeline
            ))
            .into());
        }

        Ok(self
            .steps
            .iter()
            .enumerate()
            .take_while(|(i, s)| {
                s.index == *i
                    && fingerprints.get(*i).is_some_and(|f| *f == s.fingerprint)
                    && s.checkpoint.exists()
            })
            .count())
    }

    /// Drop entries from `len` onward.
    pub fn truncate(&mut self, len: usize) {
        self.steps.truncate(len);
        self.updated_at = Utc::now();
    }
}

/// Persistence for the run manifest.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    dir: PathBuf,
    path: PathBuf,
    backup_path: PathBuf,
}

impl ManifestStore {
    pub fn new(dir: &Path, prefix: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            path: dir.join(format!("{prefix}_manifest.json")),
            backup_path: dir.join(format!("{prefix}_manifest.backup.json")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the manifest if one exists.
    pub fn load(&self) -> Result<Option<RunManifest>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let file =
            File::open(&self.path).map_err(|e| SieveError::io_at("opening manifest", &self.path, e))?;
        let manifest = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| SieveError::Parse(format!("Invalid manifest: {e}")))?;
        Ok(Some(manifest))
    }

    /// Save the manifest to disk (atomic write).
    pub fn save(&self, manifest: &RunManifest) -> Result<()> {
        if self.path.exists() {
            fs::copy(&self.path, &self.backup_path)
                .map_err(|e| SieveError::io_at("backing up manifest", &self.backup_path, e))?;
        }

        let temp_path = self.dir.join(format!(
            "{}.tmp",
            self.path.file_name().and_then(|n| n.to_str()).unwrap_or("manifest.json")
        ));
        let file = File::create(&temp_path)
            .map_err(|e| SieveError::io_at("creating temp manifest", &temp_path, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, manifest)
            .map_err(|e| SieveError::Internal(format!("Serializing manifest: {e}")))?;
        writer
            .flush()
            .map_err(|e| SieveError::io_at("flushing manifest", &temp_path, e))?;

        fs::rename(&temp_path, &self.path)
            .map_err(|e| SieveError::io_at("renaming manifest", &self.path, e))?;

        debug!(steps = manifest.steps.len(), "Manifest saved");
        Ok(())
    }
}
