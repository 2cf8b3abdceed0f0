//! Step-addressed file storage.
//!
//! Handle `i` reads checkpoint `i` (handle 0 reads the first-entry file) and
//! writes checkpoint `i + 1`. Checkpoints are written to a temp file and
//! renamed into place, so a reader never observes a partial file.

use super::format::{self, CacheType};
use super::manifest::{ManifestStore, RunManifest, StepRecord};
use crate::models::{Dataset, Result, SieveError, StorageConfig};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// The only logical view a step can read.
pub const DATAFRAME_VIEW: &str = "dataframe";

/// Whether a step may change the number of rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RowPolicy {
    /// Output has exactly as many rows as the input
    #[default]
    Preserve,
    /// Output may drop rows but never add them
    Filter,
}

/// Versioned dataset storage with one checkpoint per pipeline step.
#[derive(Debug)]
pub struct FileStorage {
    first_entry_file: PathBuf,
    cache_path: PathBuf,
    file_name_prefix: String,
    cache_type: CacheType,
    next_step: usize,
    manifest_store: ManifestStore,
    manifest: RunManifest,
}

impl FileStorage {
    /// Create storage rooted at `cache_path`, removing temp files left by a crashed writer.
    pub fn new(
        first_entry_file: impl Into<PathBuf>,
        cache_path: impl Into<PathBuf>,
        file_name_prefix: impl Into<String>,
        cache_type: CacheType,
    ) -> Result<Self> {
        let cache_path = cache_path.into();
        let file_name_prefix = file_name_prefix.into();

        fs::create_dir_all(&cache_path)
            .map_err(|e| SieveError::io_at("creating cache dir", &cache_path, e))?;
        remove_stale_temp_files(&cache_path)?;

        Ok(Self {
            first_entry_file: first_entry_file.into(),
            manifest_store: ManifestStore::new(&cache_path, &file_name_prefix),
            cache_path,
            file_name_prefix,
            cache_type,
            next_step: 0,
            manifest: RunManifest::new(Vec::new()),
        })
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        Self::new(
            &config.first_entry_file,
            &config.cache_path,
            &config.file_name_prefix,
            config.cache_type,
        )
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    pub fn first_entry_file(&self) -> &Path {
        &self.first_entry_file
    }

    pub fn cache_type(&self) -> CacheType {
        self.cache_type
    }

    pub fn manifest(&self) -> &RunManifest {
        &self.manifest
    }

    pub fn manifest_path(&self) -> &Path {
        self.manifest_store.path()
    }

    /// Path of checkpoint `n` (`n >= 1`; checkpoint 0 is the first-entry file).
    pub fn checkpoint_path(&self, n: usize) -> PathBuf {
        if n == 0 {
            return self.first_entry_file.clone();
        }
        self.cache_path.join(format!(
            "{}_step{}.{}",
            self.file_name_prefix,
            n,
            self.cache_type.extension()
        ))
    }

    /// Hand out the next step-scoped handle and advance the counter.
    pub fn step(&mut self) -> StepStorage {
        let index = self.next_step;
        self.next_step += 1;

        let (read_path, read_type) = if index == 0 {
            (
                self.first_entry_file.clone(),
                CacheType::from_path(&self.first_entry_file),
            )
        } else {
            (self.checkpoint_path(index), self.cache_type)
        };

        StepStorage {
            index,
            read_path,
            read_type,
            write_path: self.checkpoint_path(index + 1),
            write_type: self.cache_type,
            row_policy: None,
            rows_read: Mutex::new(None),
            rows_written: Mutex::new(None),
        }
    }

    /// Begin a fresh run: forget earlier progress and start from step 0.
    pub fn start_run(&mut self, pipeline: Vec<String>) -> Result<()> {
        self.manifest = RunManifest::new(pipeline);
        self.next_step = 0;
        self.manifest_store.save(&self.manifest)?;
        info!(run_id = %self.manifest.run_id, cache = %self.cache_path.display(), "Started run");
        Ok(())
    }

    /// Continue an earlier run of the same pipeline.
    ///
    /// `fingerprints` identify each step's configuration; completed steps are
    /// reused only up to the first one whose fingerprint differs. Returns the
    /// number of steps already complete; the next `step()` call yields the
    /// handle for the first incomplete step.
    pub fn resume_run(&mut self, pipeline: Vec<String>, fingerprints: &[String]) -> Result<usize> {
        let Some(mut manifest) = self.manifest_store.load()? else {
            self.start_run(pipeline)?;
            return Ok(0);
        };

        let completed = manifest.resumable_prefix(&pipeline, fingerprints)?;
        manifest.truncate(completed);
        self.manifest = manifest;
        self.resume_at(completed);
        self.manifest_store.save(&self.manifest)?;

        info!(
            run_id = %self.manifest.run_id,
            completed,
            remaining = pipeline.len().saturating_sub(completed),
            "Resuming run"
        );
        Ok(completed)
    }

    /// Leading steps whose manifest entry and checkpoint both exist.
    pub fn completed_steps(&self) -> usize {
        self.manifest
            .steps
            .iter()
            .enumerate()
            .take_while(|(i, s)| s.index == *i && s.checkpoint.exists())
            .count()
    }

    /// Position the counter so the next `step()` returns handle `n`.
    pub fn resume_at(&mut self, n: usize) {
        self.next_step = n;
    }

    /// Record a completed step in the manifest.
    pub fn record_step(&mut self, record: StepRecord) -> Result<()> {
        self.manifest.record(record);
        self.manifest_store.save(&self.manifest)
    }
}

/// Step-scoped view of the storage handed to one operator.
#[derive(Debug)]
pub struct StepStorage {
    index: usize,
    read_path: PathBuf,
    read_type: CacheType,
    write_path: PathBuf,
    write_type: CacheType,
    row_policy: Option<RowPolicy>,
    rows_read: Mutex<Option<usize>>,
    rows_written: Mutex<Option<usize>>,
}

impl StepStorage {
    /// Enforce a row policy on this step's write.
    pub fn with_row_policy(mut self, policy: RowPolicy) -> Self {
        self.row_policy = Some(policy);
        self
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn checkpoint_path(&self) -> &Path {
        &self.write_path
    }

    pub fn rows_read(&self) -> Option<usize> {
        *lock(&self.rows_read)
    }

    pub fn rows_written(&self) -> Option<usize> {
        *lock(&self.rows_written)
    }

    /// Materialize the dataset for a logical view.
    pub fn read(&self, view: &str) -> Result<Dataset> {
        if view != DATAFRAME_VIEW {
            return Err(SieveError::NotFound(format!("view '{view}'")));
        }
        if !self.read_path.exists() {
            return Err(SieveError::NotFound(format!(
                "checkpoint for step {} at {}",
                self.index,
                self.read_path.display()
            )));
        }

        let file = File::open(&self.read_path)
            .map_err(|e| SieveError::io_at("opening checkpoint", &self.read_path, e))?;
        let dataset = format::decode(file, self.read_type)?;

        *lock(&self.rows_read) = Some(dataset.len());
        debug!(step = self.index, rows = dataset.len(), path = %self.read_path.display(), "Read dataset");
        Ok(dataset)
    }

    /// Persist the dataset as this step's checkpoint. A step writes exactly once.
    pub fn write(&self, dataset: &Dataset) -> Result<()> {
        if self.rows_written().is_some() {
            return Err(SieveError::Internal(format!(
                "checkpoint for step {} already written",
                self.index
            )));
        }

        if let Some(policy) = self.row_policy {
            let before = match self.rows_read() {
                Some(rows) => rows,
                None => self.count_input_rows()?,
            };
            let after = dataset.len();
            let violated = match policy {
                RowPolicy::Preserve => after != before,
                RowPolicy::Filter => after > before,
            };
            if violated {
                return Err(SieveError::RowCountChanged { before, after });
            }
        }

        let temp_path = temp_path_for(&self.write_path);
        {
            let file = File::create(&temp_path)
                .map_err(|e| SieveError::io_at("creating temp checkpoint", &temp_path, e))?;
            let mut writer = BufWriter::new(file);
            format::encode(dataset, self.write_type, &mut writer)?;
            let file = writer
                .into_inner()
                .map_err(|e| SieveError::io_at("flushing checkpoint", &temp_path, e.into_error()))?;
            file.sync_all()
                .map_err(|e| SieveError::io_at("syncing checkpoint", &temp_path, e))?;
        }

        fs::rename(&temp_path, &self.write_path)
            .map_err(|e| SieveError::io_at("renaming checkpoint", &self.write_path, e))?;

        *lock(&self.rows_written) = Some(dataset.len());
        debug!(step = self.index, rows = dataset.len(), path = %self.write_path.display(), "Checkpoint written");
        Ok(())
    }

    /// Row count of the step input, for a step that writes without reading.
    fn count_input_rows(&self) -> Result<usize> {
        let file = File::open(&self.read_path)
            .map_err(|e| SieveError::io_at("opening checkpoint", &self.read_path, e))?;
        Ok(format::decode(file, self.read_type)?.len())
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn lock(slot: &Mutex<Option<usize>>) -> std::sync::MutexGuard<'_, Option<usize>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn remove_stale_temp_files(dir: &Path) -> Result<()> {
    let pattern = dir.join("*.tmp");
    let pattern_str = pattern.to_string_lossy();

    let stale: Vec<_> = glob::glob(&pattern_str)
        .map_err(|e| SieveError::Internal(format!("Invalid glob pattern: {e}")))?
        .filter_map(|r| r.ok())
        .collect();

    for path in stale {
        warn!(path = %path.display(), "Removing partial checkpoint left by an interrupted write");
        fs::remove_file(&path).map_err(|e| SieveError::io_at("removing temp file", &path, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup(cache_type: CacheType) -> (TempDir, FileStorage) {
        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("input.jsonl");
        fs::write(&input, "{\"text\": \"a\"}\n{\"text\": \"b\"}\n{\"text\": \"c\"}\n").unwrap();
        let storage =
            FileStorage::new(&input, temp_dir.path().join("cache"), "step", cache_type).unwrap();
        (temp_dir, storage)
    }

    #[test]
    fn test_step_handles_chain_checkpoints() {
        let (_tmp, mut storage) = setup(CacheType::Json);

        let first = storage.step();
        assert_eq!(first.index(), 0);
        let mut ds = first.read(DATAFRAME_VIEW).unwrap();
        assert_eq!(ds.len(), 3);
        ds.set_column("n", vec![json!(1), json!(2), json!(3)]).unwrap();
        first.write(&ds).unwrap();
        assert!(storage.checkpoint_path(1).exists());

        let second = storage.step();
        assert_eq!(second.index(), 1);
        assert_eq!(second.read(DATAFRAME_VIEW).unwrap(), ds);
    }

    #[test]
    fn test_read_before_checkpoint_exists_is_not_found() {
        let (_tmp, mut storage) = setup(CacheType::Json);
        let _first = storage.step();
        let second = storage.step();
        assert!(matches!(second.read(DATAFRAME_VIEW), Err(SieveError::NotFound(_))));
    }

    #[test]
    fn test_unknown_view_is_not_found() {
        let (_tmp, mut storage) = setup(CacheType::Json);
        let step = storage.step();
        assert!(matches!(step.read("embeddings"), Err(SieveError::NotFound(_))));
    }

    #[test]
    fn test_preserve_policy_rejects_row_count_change() {
        let (_tmp, mut storage) = setup(CacheType::Jsonl);
        let step = storage.step().with_row_policy(RowPolicy::Preserve);
        let mut ds = step.read(DATAFRAME_VIEW).unwrap();
        ds.retain_rows(&[true, false, true]).unwrap();

        assert!(matches!(
            step.write(&ds),
            Err(SieveError::RowCountChanged { before: 3, after: 2 })
        ));
        assert!(!step.checkpoint_path().exists());
    }

    #[test]
    fn test_row_policy_applies_to_write_without_read() {
        let (_tmp, mut storage) = setup(CacheType::Jsonl);
        let step = storage.step().with_row_policy(RowPolicy::Preserve);
        let ds = Dataset::from_json_rows(json!([{"text": "only"}])).unwrap();

        assert!(matches!(
            step.write(&ds),
            Err(SieveError::RowCountChanged { before: 3, after: 1 })
        ));
        assert!(!step.checkpoint_path().exists());

        // Nothing to compare against: step 1's input was never written.
        let next = storage.step().with_row_policy(RowPolicy::Filter);
        assert!(matches!(next.write(&ds), Err(SieveError::Io { .. })));
    }

    #[test]
    fn test_filter_policy_allows_fewer_rows() {
        let (_tmp, mut storage) = setup(CacheType::Jsonl);
        let step = storage.step().with_row_policy(RowPolicy::Filter);
        let mut ds = step.read(DATAFRAME_VIEW).unwrap();
        ds.retain_rows(&[false, false, true]).unwrap();
        step.write(&ds).unwrap();
        assert_eq!(step.rows_read(), Some(3));
        assert_eq!(step.rows_written(), Some(1));
    }

    #[test]
    fn test_checkpoint_is_written_once() {
        let (_tmp, mut storage) = setup(CacheType::Json);
        let step = storage.step();
        let ds = step.read(DATAFRAME_VIEW).unwrap();
        step.write(&ds).unwrap();
        assert!(matches!(step.write(&ds), Err(SieveError::Internal(_))));
    }

    #[test]
    fn test_checkpoint_naming() {
        let (tmp, storage) = setup(CacheType::Jsonl);
        assert_eq!(
            storage.checkpoint_path(2),
            tmp.path().join("cache").join("step_step2.jsonl")
        );
    }

    #[test]
    fn test_new_removes_stale_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let cache = temp_dir.path().join("cache");
        fs::create_dir_all(&cache).unwrap();
        let stale = cache.join("step_step1.json.tmp");
        fs::write(&stale, "{\"columns\": [").unwrap();

        FileStorage::new(temp_dir.path().join("in.json"), &cache, "step", CacheType::Json).unwrap();
        assert!(!stale.exists());
    }

    #[test]
    fn test_resume_run_skips_completed_steps() {
        let (_tmp, mut storage) = setup(CacheType::Json);
        let pipeline = vec!["a".to_string(), "b".to_string()];
        storage.start_run(pipeline.clone()).unwrap();

        let step = storage.step();
        let ds = step.read(DATAFRAME_VIEW).unwrap();
        step.write(&ds).unwrap();
        storage
            .record_step(StepRecord {
                index: 0,
                operator: "a".to_string(),
                fingerprint: "a".to_string(),
                rows_in: step.rows_read(),
                rows_out: 3,
                checkpoint: step.checkpoint_path().to_path_buf(),
                duration_ms: 1,
                completed_at: chrono::Utc::now(),
            })
            .unwrap();

        let mut reopened = FileStorage::new(
            &storage.first_entry_file,
            storage.cache_path(),
            "step",
            CacheType::Json,
        )
        .unwrap();
        let fingerprints = vec!["a".to_string(), "b".to_string()];
        assert_eq!(reopened.resume_run(pipeline, &fingerprints).unwrap(), 1);
        assert_eq!(reopened.completed_steps(), 1);
        assert_eq!(reopened.step().index(), 1);
    }
}
