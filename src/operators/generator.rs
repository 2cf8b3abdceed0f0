//! Prompted text generation into a new column.

use super::{BoundKeys, Operator, OperatorContext, OperatorSignature, default_prompt_template, render_prompt};
use crate::models::{Result, SieveError};
use crate::serving::{GenerationParams, Serving, ServingOutput};
use crate::storage::{DATAFRAME_VIEW, RowPolicy, StepStorage};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

pub const NAME: &str = "prompt_generator";

/// What to do with an item the backend could not answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnFailure {
    /// Fail the step
    #[default]
    Error,
    /// Write `null` and carry on
    Null,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct GeneratorParams {
    #[serde(default = "default_prompt_template")]
    prompt_template: String,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    stop: Option<Vec<String>>,
    #[serde(default)]
    on_failure: OnFailure,
}

/// Generates text per row from a prompt template.
pub struct PromptGenerator {
    serving: Arc<Serving>,
    prompt_template: String,
    generation: GenerationParams,
    on_failure: OnFailure,
}

impl PromptGenerator {
    pub fn from_context(ctx: &OperatorContext) -> Result<Self> {
        let params: GeneratorParams = ctx.params(NAME)?;
        Ok(Self {
            serving: ctx.require_serving(NAME)?,
            prompt_template: params.prompt_template,
            generation: GenerationParams {
                system_prompt: params.system_prompt,
                max_tokens: params.max_tokens,
                temperature: params.temperature,
                stop: params.stop,
            },
            on_failure: params.on_failure,
        })
    }

    fn cell(&self, row: usize, output: ServingOutput) -> Result<Value> {
        let error = match output {
            ServingOutput::Text(text) => return Ok(Value::String(text)),
            ServingOutput::Failed(message) => {
                SieveError::ServingFatal(format!("row {row}: request failed: {message}"))
            }
            ServingOutput::Embedding(_) => SieveError::InvalidInput(format!(
                "row {row}: generator needs a text backend, got an embedding"
            )),
        };

        match self.on_failure {
            OnFailure::Null => {
                warn!(operator = NAME, row, error = %error, "Writing null for failed row");
                Ok(Value::Null)
            }
            OnFailure::Error => Err(error),
        }
    }
}

#[async_trait]
impl Operator for PromptGenerator {
    fn name(&self) -> &str {
        NAME
    }

    fn signature(&self) -> OperatorSignature {
        OperatorSignature::new(RowPolicy::Preserve)
            .input("input", None)
            .output("output", Some("generated_text"))
    }

    async fn run(&self, storage: &StepStorage, keys: &BoundKeys) -> Result<()> {
        let mut dataset = storage.read(DATAFRAME_VIEW)?;
        let input = keys.get("input")?;
        let output = keys.get("output")?;

        let prompts: Vec<String> = dataset
            .texts(input)?
            .iter()
            .map(|text| render_prompt(&self.prompt_template, text))
            .collect();
        let responses = self.serving.request(&prompts, &self.generation).await?;

        let cells = responses
            .into_iter()
            .enumerate()
            .map(|(row, response)| self.cell(row, response))
            .collect::<Result<Vec<_>>>()?;
        let nulls = cells.iter().filter(|c| c.is_null()).count();

        info!(operator = NAME, rows = cells.len(), column = output, nulls, "Generated text");
        dataset.set_column(output, cells)?;
        storage.write(&dataset)
    }
}
