//! Sequential pipeline over one shared storage.
//!
//! Flow per step:
//! storage.step() → operator.run(step_storage, keys) → checkpoint → manifest

use super::{PipelineReport, StepReport};
use crate::models::{ConfigError, PipelineConfig, Result, SieveError};
use crate::operators::{BoundKeys, Operator, OperatorContext, OperatorRegistry};
use crate::serving::ServingRegistry;
use crate::storage::{FileStorage, RowPolicy, StepRecord};
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;
use tracing::{error, info};

/// What a checkpoint depends on, besides the checkpoint before it.
#[derive(Serialize)]
struct Fingerprint<'a> {
    operator: &'a str,
    keys: BTreeMap<&'a str, &'a str>,
    params: &'a toml::Table,
    input: &'a Path,
}

/// An operator with its keys bound.
pub struct PipelineStep {
    operator: Box<dyn Operator>,
    keys: BoundKeys,
    params: toml::Table,
    row_policy: RowPolicy,
}

impl PipelineStep {
    /// Bind `keys` against the operator's signature.
    pub fn new(operator: Box<dyn Operator>, keys: &BTreeMap<String, String>) -> Result<Self> {
        Self::with_params(operator, keys, toml::Table::new())
    }

    /// Like [`PipelineStep::new`], remembering the params the operator was built from.
    pub fn with_params(
        operator: Box<dyn Operator>,
        keys: &BTreeMap<String, String>,
        params: toml::Table,
    ) -> Result<Self> {
        let signature = operator.signature();
        let keys = signature.bind(operator.name(), keys)?;
        Ok(Self {
            operator,
            keys,
            params,
            row_policy: signature.row_policy,
        })
    }

    /// Stable identity of this step over the given pipeline input.
    pub fn fingerprint(&self, input: &Path) -> Result<String> {
        let fingerprint = Fingerprint {
            operator: self.operator_name(),
            keys: self.keys.iter().collect(),
            params: &self.params,
            input,
        };
        serde_json::to_string(&fingerprint)
            .map_err(|e| SieveError::Internal(format!("Fingerprinting step: {e}")))
    }

    pub fn operator_name(&self) -> &str {
        self.operator.name()
    }

    pub fn keys(&self) -> &BoundKeys {
        &self.keys
    }

    pub fn params(&self) -> &toml::Table {
        &self.params
    }
}

/// Assembles a [`Pipeline`].
pub struct PipelineBuilder {
    storage: FileStorage,
    steps: Vec<PipelineStep>,
    show_progress: bool,
}

impl PipelineBuilder {
    /// Append an operator; `keys` maps roles to columns.
    pub fn step(mut self, operator: Box<dyn Operator>, keys: &BTreeMap<String, String>) -> Result<Self> {
        self.steps.push(PipelineStep::new(operator, keys)?);
        Ok(self)
    }

    /// Append an operator built from `params`. Changing them invalidates the
    /// step's checkpoint on resume.
    pub fn step_with_params(
        mut self,
        operator: Box<dyn Operator>,
        keys: &BTreeMap<String, String>,
        params: &toml::Table,
    ) -> Result<Self> {
        self.steps
            .push(PipelineStep::with_params(operator, keys, params.clone())?);
        Ok(self)
    }

    pub fn show_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        if self.steps.is_empty() {
            return Err(ConfigError::Invalid("pipeline has no steps".to_string()).into());
        }
        Ok(Pipeline {
            storage: self.storage,
            steps: self.steps,
            show_progress: self.show_progress,
        })
    }
}

/// Ordered operators sharing one storage.
pub struct Pipeline {
    storage: FileStorage,
    steps: Vec<PipelineStep>,
    show_progress: bool,
}

impl Pipeline {
    pub fn builder(storage: FileStorage) -> PipelineBuilder {
        PipelineBuilder {
            storage,
            steps: Vec::new(),
            show_progress: false,
        }
    }

    /// Assemble a pipeline from its declarative configuration.
    pub fn from_config(
        config: &PipelineConfig,
        operators: &OperatorRegistry,
        servings: &ServingRegistry,
    ) -> Result<Self> {
        config.validate()?;

        let mut builder = Self::builder(FileStorage::from_config(&config.storage)?);
        for step in &config.steps {
            let mut ctx = OperatorContext::new(step.params.clone());
            if let Some(name) = &step.serving {
                ctx = ctx.with_serving(servings.get(name)?);
            }
            let operator = operators.lookup(&step.operator)?.construct(&ctx)?;
            builder = builder.step_with_params(operator, &step.keys, &step.params)?;
        }
        builder.build()
    }

    /// Show or hide the step progress bar.
    pub fn set_show_progress(&mut self, show: bool) {
        self.show_progress = show;
    }

    pub fn storage(&self) -> &FileStorage {
        &self.storage
    }

    pub fn steps(&self) -> &[PipelineStep] {
        &self.steps
    }

    pub fn operator_names(&self) -> Vec<String> {
        self.steps
            .iter()
            .map(|s| s.operator_name().to_string())
            .collect()
    }

    /// Run every step from the first-entry dataset.
    pub async fn forward(&mut self) -> Result<PipelineReport> {
        self.storage.start_run(self.operator_names())?;
        self.run_from(0).await
    }

    /// Continue an earlier run, skipping leading steps whose checkpoints
    /// survive and whose configuration is unchanged.
    pub async fn forward_resuming(&mut self) -> Result<PipelineReport> {
        let fingerprints = self.fingerprints()?;
        let completed = self.storage.resume_run(self.operator_names(), &fingerprints)?;
        self.run_from(completed).await
    }

    fn fingerprints(&self) -> Result<Vec<String>> {
        let input = self.storage.first_entry_file();
        self.steps.iter().map(|s| s.fingerprint(input)).collect()
    }

    async fn run_from(&mut self, start: usize) -> Result<PipelineReport> {
        let started = Instant::now();
        let total = self.steps.len();

        info!(
            run_id = %self.storage.manifest().run_id,
            steps = total,
            skipped = start,
            cache = %self.storage.cache_path().display(),
            "Starting pipeline"
        );

        let fingerprints = self.fingerprints()?;
        let pb = self.progress_bar(total, start);
        let mut reports = Vec::with_capacity(total.saturating_sub(start));

        let steps = self.steps.iter().enumerate().zip(fingerprints);
        for ((index, step), fingerprint) in steps.skip(start) {
            let operator = step.operator_name();
            pb.set_message(operator.to_string());

            let record = execute_step(&mut self.storage, index, step, fingerprint)
                .await
                .map_err(|e| {
                    error!(step = index, operator, error = %e, "Step failed");
                    SieveError::StepFailed {
                        step: index,
                        operator: operator.to_string(),
                        source: Box::new(e),
                    }
                })?;

            info!(
                step = index,
                operator,
                rows_in = record.rows_in,
                rows_out = record.rows_out,
                duration_ms = record.duration_ms,
                "Step complete"
            );
            reports.push(StepReport::from(&record));
            pb.inc(1);
        }

        pb.finish_with_message("done");

        let report = PipelineReport {
            run_id: self.storage.manifest().run_id.clone(),
            steps: reports,
            skipped: start,
            runtime: started.elapsed(),
        };
        info!(
            executed = report.steps.len(),
            final_rows = report.final_rows(),
            runtime_secs = report.runtime.as_secs_f64(),
            "Pipeline complete"
        );
        Ok(report)
    }

    fn progress_bar(&self, total: usize, start: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(total as u64);
        if let Ok(style) =
            ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("##-"));
        }
        pb.set_position(start as u64);
        pb
    }
}

/// Run one step and record it in the manifest.
async fn execute_step(
    storage: &mut FileStorage,
    index: usize,
    step: &PipelineStep,
    fingerprint: String,
) -> Result<StepRecord> {
    let handle = storage.step().with_row_policy(step.row_policy);
    if handle.index() != index {
        return Err(SieveError::Internal(format!(
            "storage handed out step {} for step {index}",
            handle.index()
        )));
    }

    let started = Instant::now();
    step.operator.run(&handle, &step.keys).await?;

    let rows_out = handle
        .rows_written()
        .ok_or(SieveError::NoCheckpointWritten { step: index })?;

    let record = StepRecord {
        index,
        operator: step.operator_name().to_string(),
        fingerprint,
        rows_in: handle.rows_read(),
        rows_out,
        checkpoint: handle.checkpoint_path().to_path_buf(),
        duration_ms: started.elapsed().as_millis() as u64,
        completed_at: Utc::now(),
    };
    storage.record_step(record.clone())?;
    Ok(record)
}
