//! Threshold filter over a numeric column.

use super::{BoundKeys, Operator, OperatorContext, OperatorSignature};
use crate::models::{ConfigError, Result};
use crate::storage::{DATAFRAME_VIEW, RowPolicy, StepStorage};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

pub const NAME: &str = "score_filter";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct FilterParams {
    min_score: f64,
    #[serde(default)]
    max_score: Option<f64>,
}

/// Keeps rows with `min_score < value <= max_score`.
#[derive(Debug, Clone)]
pub struct ScoreFilter {
    min_score: f64,
    max_score: Option<f64>,
}

impl ScoreFilter {
    pub fn new(min_score: f64, max_score: Option<f64>) -> Self {
        Self {
            min_score,
            max_score,
        }
    }

    pub fn from_context(ctx: &OperatorContext) -> Result<Self> {
        let params: FilterParams = ctx.params(NAME)?;
        if let Some(max) = params.max_score.filter(|max| *max < params.min_score) {
            return Err(ConfigError::InvalidParams {
                operator: NAME.to_string(),
                message: format!("max_score {max} is below min_score {}", params.min_score),
            }
            .into());
        }
        Ok(Self::new(params.min_score, params.max_score))
    }

    fn keeps(&self, value: f64) -> bool {
        value > self.min_score && self.max_score.is_none_or(|max| value <= max)
    }
}

#[async_trait]
impl Operator for ScoreFilter {
    fn name(&self) -> &str {
        NAME
    }

    fn signature(&self) -> OperatorSignature {
        OperatorSignature::new(RowPolicy::Filter).input("input", Some("score"))
    }

    async fn run(&self, storage: &StepStorage, keys: &BoundKeys) -> Result<()> {
        let mut dataset = storage.read(DATAFRAME_VIEW)?;
        let column = keys.get("input")?;

        let mask: Vec<bool> = dataset
            .numbers(column)?
            .into_iter()
            .map(|value| self.keeps(value))
            .collect();
        let removed = dataset.retain_rows(&mask)?;

        info!(
            operator = NAME,
            column,
            kept = dataset.len(),
            removed,
            min_score = self.min_score,
            "Filtered rows"
        );
        storage.write(&dataset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SieveError;
    use crate::operators::testing::storage_with;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn test_bounds_are_exclusive_below_inclusive_above() {
        let filter = ScoreFilter::new(0.5, Some(0.9));
        assert!(!filter.keeps(0.5));
        assert!(filter.keeps(0.51));
        assert!(filter.keeps(0.9));
        assert!(!filter.keeps(0.91));
    }

    #[tokio::test]
    async fn test_run_drops_rows_and_keeps_columns() {
        let (_tmp, mut storage) = storage_with(json!([
            {"text": "a", "score": 0.2},
            {"text": "b", "score": 0.7},
            {"text": "c", "score": 0.5},
            {"text": "d", "score": 1.0},
        ]));
        let filter = ScoreFilter::new(0.5, None);
        let keys = filter.signature().bind(NAME, &BTreeMap::new()).unwrap();

        let step = storage.step().with_row_policy(RowPolicy::Filter);
        filter.run(&step, &keys).await.unwrap();

        let out = storage.step().read(DATAFRAME_VIEW).unwrap();
        assert_eq!(out.texts("text").unwrap(), vec!["b", "d"]);
        assert_eq!(out.columns(), ["text", "score"]);
    }

    #[tokio::test]
    async fn test_non_numeric_cell_is_an_error() {
        let (_tmp, mut storage) = storage_with(json!([{"score": 0.9}, {"score": "high"}]));
        let filter = ScoreFilter::new(0.5, None);
        let keys = filter.signature().bind(NAME, &BTreeMap::new()).unwrap();
        let err = filter.run(&storage.step(), &keys).await.unwrap_err();
        assert!(matches!(err, SieveError::InvalidInput(_)));
    }

    #[test]
    fn test_params_validation() {
        let ctx = OperatorContext::new(toml::from_str("min_score = 0.8\nmax_score = 0.2").unwrap());
        assert!(ScoreFilter::from_context(&ctx).is_err());
        let ctx = OperatorContext::new(toml::Table::new());
        assert!(ScoreFilter::from_context(&ctx).is_err());
    }
}
