//! End-to-end pipeline tests over real checkpoint files.
//!
//! A stub local engine stands in for the model so the runs are deterministic.

use async_trait::async_trait;
use serde_json::{Value, json};
use sieve::serving::LocalEngine;
use sieve::storage::{DATAFRAME_VIEW, read_dataset_file};
use sieve::{
    CacheType, FileStorage, GenerationParams, LocalServing, OperatorContext, OperatorRegistry,
    Pipeline, PipelineConfig, Result, Serving, ServingOutput, ServingRegistry, SieveError,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

/// Scores `row{i}` as `(i + 1) / 10`, so ten rows score 0.1 through 1.0.
#[derive(Default)]
struct RowIndexJudge {
    calls: AtomicUsize,
}

#[async_trait]
impl LocalEngine for RowIndexJudge {
    async fn generate(&self, prompts: &[String], _params: &GenerationParams) -> Result<Vec<ServingOutput>> {
        self.calls.fetch_add(prompts.len(), Ordering::SeqCst);
        prompts
            .iter()
            .map(|prompt| {
                let index: usize = prompt
                    .rsplit("row")
                    .next()
                    .and_then(|n| n.trim().parse().ok())
                    .ok_or_else(|| SieveError::ServingFatal(format!("unexpected prompt {prompt:?}")))?;
                Ok(ServingOutput::Text(format!("Score: {:.1}", (index + 1) as f64 / 10.0)))
            })
            .collect()
    }
}

fn write_input(dir: &Path, rows: usize) -> std::path::PathBuf {
    let path = dir.join("input.jsonl");
    let body: String = (0..rows)
        .map(|i| format!("{}\n", json!({"id": i, "text": format!("row{i}"), "source": "web"})))
        .collect();
    std::fs::write(&path, body).unwrap();
    path
}

fn keys(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn params(toml_src: &str) -> toml::Table {
    toml::from_str(toml_src).unwrap()
}

fn judge_serving(engine: Arc<RowIndexJudge>) -> Arc<Serving> {
    Arc::new(Serving::Local(LocalServing::with_engine("judge", engine, 3)))
}

/// Scorer then filter keeps exactly the rows scoring above 0.5.
#[tokio::test]
async fn test_score_then_filter_keeps_top_half() {
    let tmp = TempDir::new().unwrap();
    let input = write_input(tmp.path(), 10);
    let storage = FileStorage::new(&input, tmp.path().join("cache"), "curate", CacheType::Json).unwrap();

    let registry = OperatorRegistry::with_builtins().unwrap();
    let engine = Arc::new(RowIndexJudge::default());

    let scorer_ctx = OperatorContext::new(params(r#"prompt_template = "Rate: {text}""#))
        .with_serving(judge_serving(engine.clone()));
    let scorer = registry.lookup("llm_scorer").unwrap().construct(&scorer_ctx).unwrap();

    let filter_ctx = OperatorContext::new(params("min_score = 0.5"));
    let filter = registry.lookup("score_filter").unwrap().construct(&filter_ctx).unwrap();

    let mut pipeline = Pipeline::builder(storage)
        .step(scorer, &keys(&[("input", "text")]))
        .unwrap()
        .step(filter, &BTreeMap::new())
        .unwrap()
        .build()
        .unwrap();

    let report = pipeline.forward().await.unwrap();

    assert_eq!(engine.calls.load(Ordering::SeqCst), 10);
    assert_eq!(report.steps.len(), 2);
    assert_eq!(report.steps[0].rows_out, 10);
    assert_eq!(report.steps[1].rows_in, Some(10));
    assert_eq!(report.final_rows(), Some(5));

    let step1 = tmp.path().join("cache/curate_step1.json");
    let step2 = tmp.path().join("cache/curate_step2.json");
    assert!(step1.exists());
    assert!(step2.exists());

    let scored = read_dataset_file(&step1).unwrap();
    assert_eq!(scored.columns(), ["id", "text", "source", "score"]);
    assert_eq!(scored.len(), 10);

    let kept = read_dataset_file(&step2).unwrap();
    assert_eq!(kept.columns(), ["id", "text", "source", "score"]);
    let ids: Vec<&Value> = kept.column("id").unwrap();
    assert_eq!(ids, [&json!(5), &json!(6), &json!(7), &json!(8), &json!(9)]);
    assert!(kept.numbers("score").unwrap().iter().all(|s| *s > 0.5));
    assert!(kept.texts("source").unwrap().iter().all(|s| s == "web"));
}

/// The dataset read by step i+1 is exactly the one written by step i.
#[tokio::test]
async fn test_checkpoint_round_trip_between_steps() {
    let tmp = TempDir::new().unwrap();
    let input = write_input(tmp.path(), 4);

    for cache_type in [CacheType::Json, CacheType::Jsonl] {
        let cache = tmp.path().join(format!("cache-{}", cache_type.extension()));
        let mut storage = FileStorage::new(&input, &cache, "rt", cache_type).unwrap();

        let first = storage.step();
        let mut dataset = first.read(DATAFRAME_VIEW).unwrap();
        dataset
            .set_column(
                "meta",
                vec![json!({"a": [1, 2]}), Value::Null, json!("x"), json!(0.25)],
            )
            .unwrap();
        first.write(&dataset).unwrap();

        let second = storage.step();
        assert_eq!(second.read(DATAFRAME_VIEW).unwrap(), dataset);
    }
}

/// A declarative config builds the same pipeline and can be resumed.
#[tokio::test]
async fn test_config_driven_run_and_resume() {
    let tmp = TempDir::new().unwrap();
    let input = write_input(tmp.path(), 6);

    // The declared backend is replaced by a stub under the same name.
    let mut config = PipelineConfig::from_toml(
        r#"
[storage]
first_entry_file = "placeholder"
cache_path = "placeholder"
file_name_prefix = "cfg"
cache_type = "jsonl"

[serving.judge]
kind = "local"
base_url = "http://localhost:1/v1"
model = "stub"

[[steps]]
operator = "llm_scorer"
serving = "judge"
keys = { input = "text", output = "quality" }
params = { prompt_template = "{text}", clamp = [0.0, 1.0] }

[[steps]]
operator = "score_filter"
keys = { input = "quality" }
params = { min_score = 0.3 }

[[steps]]
operator = "text_flags"
keys = { input = "text" }
"#,
    )
    .unwrap();
    config.storage.first_entry_file = input;
    config.storage.cache_path = tmp.path().join("cache");

    let engine = Arc::new(RowIndexJudge::default());
    let mut servings = ServingRegistry::new();
    servings.insert("judge", Serving::Local(LocalServing::with_engine("judge", engine.clone(), 4)));

    let operators = OperatorRegistry::with_builtins().unwrap();
    let mut pipeline = Pipeline::from_config(&config, &operators, &servings).unwrap();
    let report = pipeline.forward().await.unwrap();

    assert_eq!(report.final_rows(), Some(3));
    let last = tmp.path().join("cache/cfg_step3.jsonl");
    let flagged = read_dataset_file(&last).unwrap();
    assert_eq!(flagged.columns(), ["id", "text", "source", "quality", "text_flags"]);

    // Drop the final checkpoint: a resumed run redoes only that step.
    std::fs::remove_file(&last).unwrap();
    let mut resumed = Pipeline::from_config(&config, &operators, &servings).unwrap();
    let report = resumed.forward_resuming().await.unwrap();

    assert_eq!(report.skipped, 2);
    assert_eq!(report.steps.len(), 1);
    assert_eq!(report.steps[0].operator, "text_flags");
    assert_eq!(engine.calls.load(Ordering::SeqCst), 6);
    assert_eq!(read_dataset_file(&last).unwrap(), flagged);
}

/// Editing a step's params between runs invalidates its checkpoint.
#[tokio::test]
async fn test_resume_after_param_change_reruns_step() {
    let tmp = TempDir::new().unwrap();
    let input = tmp.path().join("scored.jsonl");
    let body: String = [0.2, 0.5, 0.9]
        .iter()
        .enumerate()
        .map(|(i, score)| format!("{}\n", json!({"id": i, "text": format!("row{i}"), "score": score})))
        .collect();
    std::fs::write(&input, body).unwrap();

    let config_for = |min_score: f64| {
        let mut config = PipelineConfig::from_toml(&format!(
            r#"
[storage]
first_entry_file = "placeholder"
cache_path = "placeholder"
file_name_prefix = "edit"
cache_type = "jsonl"

[[steps]]
operator = "score_filter"
params = {{ min_score = {min_score:?} }}

[[steps]]
operator = "text_flags"
keys = {{ input = "text" }}
"#
        ))
        .unwrap();
        config.storage.first_entry_file = input.clone();
        config.storage.cache_path = tmp.path().join("cache");
        config
    };

    let operators = OperatorRegistry::with_builtins().unwrap();
    let servings = ServingRegistry::new();

    let mut first = Pipeline::from_config(&config_for(0.1), &operators, &servings).unwrap();
    assert_eq!(first.forward().await.unwrap().final_rows(), Some(3));

    std::fs::remove_file(tmp.path().join("cache/edit_step2.jsonl")).unwrap();
    let mut edited = Pipeline::from_config(&config_for(0.8), &operators, &servings).unwrap();
    let report = edited.forward_resuming().await.unwrap();

    assert_eq!(report.skipped, 0);
    assert_eq!(report.final_rows(), Some(1));
    let kept = read_dataset_file(&tmp.path().join("cache/edit_step2.jsonl")).unwrap();
    assert_eq!(kept.column("id").unwrap(), [&json!(2)]);
}

/// Unknown operators and bad keys are rejected before anything runs.
#[tokio::test]
async fn test_config_errors_surface_before_running() {
    let tmp = TempDir::new().unwrap();
    let input = write_input(tmp.path(), 2);
    let operators = OperatorRegistry::with_builtins().unwrap();
    let servings = ServingRegistry::new();

    let mut config = PipelineConfig::from_toml(
        r#"
[storage]
first_entry_file = "placeholder"
cache_path = "placeholder"

[[steps]]
operator = "dedupe"
"#,
    )
    .unwrap();
    config.storage.first_entry_file = input;
    config.storage.cache_path = tmp.path().join("cache");

    let err = Pipeline::from_config(&config, &operators, &servings).err().unwrap();
    assert!(matches!(
        err,
        SieveError::Configuration(sieve::ConfigError::UnknownOperator(ref name)) if name == "dedupe"
    ));

    config.steps[0].operator = "text_flags".to_string();
    config.steps[0].keys = keys(&[("input", "text"), ("label", "x")]);
    let err = Pipeline::from_config(&config, &operators, &servings).err().unwrap();
    assert!(matches!(
        err,
        SieveError::Configuration(sieve::ConfigError::InvalidKeys { .. })
    ));
}
