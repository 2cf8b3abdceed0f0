//! Shared fixtures for operator tests.

use crate::models::Result;
use crate::serving::{GenerationParams, LocalEngine, LocalServing, Serving, ServingOutput};
use crate::storage::{CacheType, FileStorage};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;

/// Storage whose first-entry file holds `rows` (a JSON array of objects).
pub fn storage_with(rows: Value) -> (TempDir, FileStorage) {
    let temp_dir = TempDir::new().unwrap();
    let input = temp_dir.path().join("input.json");
    std::fs::write(&input, rows.to_string()).unwrap();
    let storage = FileStorage::new(&input, temp_dir.path().join("cache"), "test", CacheType::Json).unwrap();
    (temp_dir, storage)
}

/// Engine answering each prompt through a closure.
pub struct FnEngine<F>(pub F);

#[async_trait]
impl<F> LocalEngine for FnEngine<F>
where
    F: Fn(&str) -> ServingOutput + Send + Sync,
{
    async fn generate(&self, prompts: &[String], _params: &GenerationParams) -> Result<Vec<ServingOutput>> {
        Ok(prompts.iter().map(|p| (self.0)(p)).collect())
    }
}

pub fn local_serving<F>(f: F) -> Arc<Serving>
where
    F: Fn(&str) -> ServingOutput + Send + Sync + 'static,
{
    Arc::new(Serving::Local(LocalServing::with_engine(
        "stub",
        Arc::new(FnEngine(f)),
        4,
    )))
}
