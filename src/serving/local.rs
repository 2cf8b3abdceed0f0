//! Local batched inference.
//!
//! Inputs are split into `batch_size` chunks and handed to a [`LocalEngine`]
//! one chunk at a time. Engine errors propagate immediately; there is no retry.

use super::{GenerationParams, ServingOutput};
use crate::models::{LocalEngineKind, LocalServingConfig, Result, SieveError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Opaque batched inference engine.
#[async_trait]
pub trait LocalEngine: Send + Sync {
    /// Produce one output per prompt, in order.
    async fn generate(&self, prompts: &[String], params: &GenerationParams) -> Result<Vec<ServingOutput>>;
}

/// Local serving backend.
pub struct LocalServing {
    name: String,
    engine: Arc<dyn LocalEngine>,
    batch_size: usize,
}

impl LocalServing {
    pub fn from_config(name: &str, config: &LocalServingConfig) -> Result<Self> {
        let engine: Arc<dyn LocalEngine> = match config.engine {
            LocalEngineKind::CompletionsServer => Arc::new(CompletionsServerEngine::new(config)?),
        };
        info!(
            serving = name,
            base_url = %config.base_url,
            model = %config.model,
            batch_size = config.batch_size,
            "Local serving ready"
        );
        Ok(Self::with_engine(name, engine, config.batch_size))
    }

    pub fn with_engine(name: impl Into<String>, engine: Arc<dyn LocalEngine>, batch_size: usize) -> Self {
        Self {
            name: name.into(),
            engine,
            batch_size: batch_size.max(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub async fn request(
        &self,
        inputs: &[String],
        params: &GenerationParams,
    ) -> Result<Vec<ServingOutput>> {
        let start = Instant::now();
        let mut outputs = Vec::with_capacity(inputs.len());

        for (batch, chunk) in inputs.chunks(self.batch_size).enumerate() {
            let produced = self.engine.generate(chunk, params).await?;
            if produced.len() != chunk.len() {
                return Err(SieveError::ServingFatal(format!(
                    "engine returned {} outputs for {} inputs",
                    produced.len(),
                    chunk.len()
                )));
            }
            debug!(serving = %self.name, batch, size = chunk.len(), "Batch generated");
            outputs.extend(produced);
        }

        info!(
            serving = %self.name,
            items = outputs.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Local generation complete"
        );
        Ok(outputs)
    }
}

#[derive(Debug, Serialize)]
struct CompletionsRequest<'a> {
    model: &'a str,
    prompt: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
}

#[derive(Debug, Deserialize)]
struct CompletionsResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    index: usize,
    text: String,
}

/// Co-located OpenAI-compatible server (vLLM, TGI, llama.cpp) driven in batches
/// through its `/completions` endpoint.
pub struct CompletionsServerEngine {
    client: reqwest::Client,
    url: String,
    model: String,
    default_temperature: Option<f64>,
    default_max_tokens: Option<u32>,
}

impl CompletionsServerEngine {
    pub fn new(config: &LocalServingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SieveError::Internal(format!("Building HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: format!("{}/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            default_temperature: config.temperature,
            default_max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl LocalEngine for CompletionsServerEngine {
    async fn generate(&self, prompts: &[String], params: &GenerationParams) -> Result<Vec<ServingOutput>> {
        let prompts: Vec<String> = match params.system_prompt.as_deref() {
            Some(system) => prompts.iter().map(|p| format!("{system}\n\n{p}")).collect(),
            None => prompts.to_vec(),
        };

        let request = CompletionsRequest {
            model: &self.model,
            prompt: &prompts,
            max_tokens: params.max_tokens.or(self.default_max_tokens),
            temperature: params.temperature.or(self.default_temperature),
            stop: params.stop.as_deref(),
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| SieveError::ServingFatal(format!("Local engine unreachable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SieveError::ServingFatal(format!(
                "Local engine returned HTTP {}: {}",
                status.as_u16(),
                body.chars().take(200).collect::<String>()
            )));
        }

        let mut parsed: CompletionsResponse = response
            .json()
            .await
            .map_err(|e| SieveError::ServingFatal(format!("Unparseable engine response: {e}")))?;
        parsed.choices.sort_by_key(|c| c.index);

        Ok(parsed
            .choices
            .into_iter()
            .map(|c| ServingOutput::Text(c.text))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Upper-cases prompts and records batch sizes.
    #[derive(Default)]
    struct RecordingEngine {
        batches: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl LocalEngine for RecordingEngine {
        async fn generate(&self, prompts: &[String], _params: &GenerationParams) -> Result<Vec<ServingOutput>> {
            self.batches.lock().unwrap().push(prompts.len());
            Ok(prompts.iter().map(|p| ServingOutput::Text(p.to_uppercase())).collect())
        }
    }

    struct ShortEngine;

    #[async_trait]
    impl LocalEngine for ShortEngine {
        async fn generate(&self, prompts: &[String], _params: &GenerationParams) -> Result<Vec<ServingOutput>> {
            Ok(prompts.iter().skip(1).map(|p| ServingOutput::Text(p.clone())).collect())
        }
    }

    #[tokio::test]
    async fn test_chunks_by_batch_size_and_preserves_order() {
        let engine = Arc::new(RecordingEngine::default());
        let serving = LocalServing::with_engine("local", engine.clone(), 4);
        let inputs: Vec<String> = (0..10).map(|i| format!("item{i}")).collect();

        let outputs = serving.request(&inputs, &GenerationParams::default()).await.unwrap();

        assert_eq!(*engine.batches.lock().unwrap(), vec![4, 4, 2]);
        assert_eq!(outputs.len(), 10);
        assert_eq!(outputs[7], ServingOutput::Text("ITEM7".to_string()));
    }

    #[tokio::test]
    async fn test_wrong_output_count_is_fatal() {
        let serving = LocalServing::with_engine("local", Arc::new(ShortEngine), 8);
        let inputs = vec!["a".to_string(), "b".to_string()];
        let err = serving.request(&inputs, &GenerationParams::default()).await.unwrap_err();
        assert!(matches!(err, SieveError::ServingFatal(_)));
    }

    #[test]
    fn test_completions_url_normalised() {
        let config = LocalServingConfig {
            engine: LocalEngineKind::CompletionsServer,
            base_url: "http://localhost:8000/v1/".to_string(),
            model: "qwen".to_string(),
            batch_size: 8,
            timeout_secs: 5,
            temperature: None,
            max_tokens: None,
        };
        let engine = CompletionsServerEngine::new(&config).unwrap();
        assert_eq!(engine.url, "http://localhost:8000/v1/completions");
    }
}
