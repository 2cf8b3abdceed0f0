//! Embedding vectors from an embedding backend.

use super::{BoundKeys, Operator, OperatorContext, OperatorSignature};
use crate::models::{Result, SieveError};
use crate::serving::{GenerationParams, Serving, ServingOutput};
use crate::storage::{DATAFRAME_VIEW, RowPolicy, StepStorage};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

pub const NAME: &str = "embedder";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct EmbedderParams {}

/// Writes one embedding vector per row.
pub struct Embedder {
    serving: Arc<Serving>,
}

impl Embedder {
    pub fn from_context(ctx: &OperatorContext) -> Result<Self> {
        let _: EmbedderParams = ctx.params(NAME)?;
        Ok(Self {
            serving: ctx.require_serving(NAME)?,
        })
    }
}

#[async_trait]
impl Operator for Embedder {
    fn name(&self) -> &str {
        NAME
    }

    fn signature(&self) -> OperatorSignature {
        OperatorSignature::new(RowPolicy::Preserve)
            .input("input", None)
            .output("output", Some("embedding"))
    }

    async fn run(&self, storage: &StepStorage, keys: &BoundKeys) -> Result<()> {
        let mut dataset = storage.read(DATAFRAME_VIEW)?;
        let input = keys.get("input")?;
        let output = keys.get("output")?;

        let texts = dataset.texts(input)?;
        let responses = self
            .serving
            .request(&texts, &GenerationParams::default())
            .await?;

        let mut dims = None;
        let mut vectors = Vec::with_capacity(responses.len());
        for (row, response) in responses.into_iter().enumerate() {
            match response {
                ServingOutput::Embedding(vector) => {
                    dims.get_or_insert(vector.len());
                    vectors.push(Value::from(vector));
                }
                ServingOutput::Failed(message) => {
                    return Err(SieveError::ServingFatal(format!(
                        "row {row}: request failed: {message}"
                    )));
                }
                ServingOutput::Text(_) => {
                    return Err(SieveError::InvalidInput(format!(
                        "row {row}: embedder needs an embedding backend, got text"
                    )));
                }
            }
        }

        info!(operator = NAME, rows = vectors.len(), column = output, dims = dims.unwrap_or(0), "Embedded rows");
        dataset.set_column(output, vectors)?;
        storage.write(&dataset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::testing::{local_serving, storage_with};
    use serde_json::json;

    fn keys(op: &Embedder) -> BoundKeys {
        op.signature()
            .bind(NAME, &[("input".to_string(), "text".to_string())].into())
            .unwrap()
    }

    #[tokio::test]
    async fn test_writes_vectors() {
        let (_tmp, mut storage) = storage_with(json!([{"text": "ab"}, {"text": "abcd"}]));
        let serving = local_serving(|p| ServingOutput::Embedding(vec![p.len() as f64, 0.5]));
        let op = Embedder::from_context(&OperatorContext::default().with_serving(serving)).unwrap();

        op.run(&storage.step(), &keys(&op)).await.unwrap();

        let out = storage.step().read(DATAFRAME_VIEW).unwrap();
        assert_eq!(out.column("embedding").unwrap(), vec![&json!([2.0, 0.5]), &json!([4.0, 0.5])]);
    }

    #[tokio::test]
    async fn test_text_backend_is_rejected() {
        let (_tmp, mut storage) = storage_with(json!([{"text": "ab"}]));
        let serving = local_serving(|p| ServingOutput::Text(p.to_string()));
        let op = Embedder::from_context(&OperatorContext::default().with_serving(serving)).unwrap();
        let err = op.run(&storage.step(), &keys(&op)).await.unwrap_err();
        assert!(matches!(err, SieveError::InvalidInput(_)));
    }
}
