//! LLM-as-judge scoring.

use super::{BoundKeys, Operator, OperatorContext, OperatorSignature, default_prompt_template, render_prompt};
use crate::models::{ConfigError, Result, SieveError};
use crate::serving::{GenerationParams, Serving, ServingOutput};
use crate::storage::{DATAFRAME_VIEW, RowPolicy, StepStorage};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, LazyLock};
use tracing::{info, warn};

pub const NAME: &str = "llm_scorer";

const NUMBER: &str = r"(-?\d+(?:\.\d+)?)";

static BOLD_SCORE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(&format!(r"\*\*[Ss]core:?\*\*:?\s*{NUMBER}")).ok());
static LABELLED_SCORE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(&format!(r"[Ss]core\s*[:=]\s*{NUMBER}")).ok());
static UNIT_DECIMAL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\b(0\.\d+|1\.0+)\b").ok());

/// Extract a score from a judge response.
///
/// Tried in order: `**Score:** 0.8`, `Score: 0.8`, a bare number, then the
/// first decimal in `[0, 1]` anywhere in the text.
pub fn parse_score(content: &str) -> Option<f64> {
    let capture = |re: &Option<Regex>| -> Option<f64> {
        re.as_ref()?.captures(content)?.get(1)?.as_str().parse().ok()
    };

    capture(&BOLD_SCORE)
        .or_else(|| capture(&LABELLED_SCORE))
        .or_else(|| content.trim().parse::<f64>().ok().filter(|s| s.is_finite()))
        .or_else(|| capture(&UNIT_DECIMAL))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScorerParams {
    #[serde(default = "default_prompt_template")]
    prompt_template: String,
    #[serde(default)]
    system_prompt: Option<String>,
    /// `[low, high]` bounds applied to every parsed score
    #[serde(default)]
    clamp: Option<[f64; 2]>,
    /// Used for rows whose response is missing, failed or unparseable
    #[serde(default)]
    fallback_score: Option<f64>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    max_tokens: Option<u32>,
}

/// Scores each row's text with a serving backend and writes the score column.
pub struct LlmScorer {
    serving: Arc<Serving>,
    prompt_template: String,
    clamp: Option<(f64, f64)>,
    fallback_score: Option<f64>,
    generation: GenerationParams,
}

impl LlmScorer {
    pub fn from_context(ctx: &OperatorContext) -> Result<Self> {
        let params: ScorerParams = ctx.params(NAME)?;
        let clamp = match params.clamp {
            Some([low, high]) if low > high => {
                return Err(ConfigError::InvalidParams {
                    operator: NAME.to_string(),
                    message: format!("clamp bounds reversed: [{low}, {high}]"),
                }
                .into());
            }
            Some([low, high]) => Some((low, high)),
            None => None,
        };

        Ok(Self {
            serving: ctx.require_serving(NAME)?,
            prompt_template: params.prompt_template,
            clamp,
            fallback_score: params.fallback_score,
            generation: GenerationParams {
                system_prompt: params.system_prompt,
                max_tokens: params.max_tokens,
                temperature: params.temperature,
                stop: None,
            },
        })
    }

    fn score(&self, row: usize, output: &ServingOutput) -> Result<f64> {
        let parsed = match output {
            ServingOutput::Text(text) => parse_score(text).ok_or_else(|| {
                SieveError::Parse(format!("row {row}: no score in response {text:?}"))
            }),
            ServingOutput::Failed(message) => Err(SieveError::ServingFatal(format!(
                "row {row}: request failed: {message}"
            ))),
            ServingOutput::Embedding(_) => Err(SieveError::InvalidInput(format!(
                "row {row}: scorer needs a text backend, got an embedding"
            ))),
        };

        let score = match (parsed, self.fallback_score) {
            (Ok(score), _) => score,
            (Err(e), Some(fallback)) => {
                warn!(operator = NAME, row, error = %e, fallback, "Using fallback score");
                return Ok(fallback);
            }
            (Err(e), None) => return Err(e),
        };

        Ok(match self.clamp {
            Some((low, high)) => score.clamp(low, high),
            None => score,
        })
    }
}

#[async_trait]
impl Operator for LlmScorer {
    fn name(&self) -> &str {
        NAME
    }

    fn signature(&self) -> OperatorSignature {
        OperatorSignature::new(RowPolicy::Preserve)
            .input("input", None)
            .output("output", Some("score"))
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

        let scores = responses
            .iter()
            .enumerate()
            .map(|(row, response)| self.score(row, response).map(Value::from))
            .collect::<Result<Vec<_>>>()?;

        let mean = scores.iter().filter_map(Value::as_f64).sum::<f64>() / scores.len().max(1) as f64;
        info!(operator = NAME, rows = scores.len(), column = output, mean, "Scored rows");

        dataset.set_column(output, scores)?;
        storage.write(&dataset)
    }
}
