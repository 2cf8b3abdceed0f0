//! Model-serving backends.
//!
//! Operators hand a batch of inputs to a [`Serving`] and get back one output
//! per input, in input order. Two backends exist:
//! - [`LocalServing`]: batched inference on a co-located engine, no retry
//! - [`ApiServing`]: one request per input over a bounded worker pool, with
//!   retry for transient failures

mod api;
mod local;
mod rate_limiter;
mod registry;
mod transport;

pub use api::{ApiServing, ApiStats, RetryPolicy};
pub use local::{CompletionsServerEngine, LocalEngine, LocalServing};
pub use rate_limiter::{RateLimiter, RateLimiterStats};
pub use registry::ServingRegistry;
pub use transport::{HttpTransport, Transport, TransportReply};

use crate::models::{Result, ServingConfig};
use serde::{Deserialize, Serialize};

/// Request/response schema of a remote API backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiFlavor {
    /// Chat-completions: text in, text out
    #[default]
    Chat,
    /// Embeddings: text in, vector out
    Embedding,
}

/// Per-call generation settings. Unset fields fall back to backend defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationParams {
    pub system_prompt: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub stop: Option<Vec<String>>,
}

/// Result for one input of a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum ServingOutput {
    Text(String),
    Embedding(Vec<f64>),
    /// The item failed after all attempts; carries the last error message
    Failed(String),
}

impl ServingOutput {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// A serving backend, selected at construction.
pub enum Serving {
    Local(LocalServing),
    Api(ApiServing),
}

impl Serving {
    /// Build a backend from its configuration.
    pub fn from_config(name: &str, config: &ServingConfig) -> Result<Self> {
        Ok(match config {
            ServingConfig::Api(api) => Self::Api(ApiServing::from_config(name, api)?),
            ServingConfig::Local(local) => Self::Local(LocalServing::from_config(name, local)?),
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Local(local) => local.name(),
            Self::Api(api) => api.name(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::Api(_) => "api",
        }
    }

    /// Run a batch. The output has exactly one entry per input, in order.
    pub async fn request(
        &self,
        inputs: &[String],
        params: &GenerationParams,
    ) -> Result<Vec<ServingOutput>> {
        match self {
            Self::Local(local) => local.request(inputs, params).await,
            Self::Api(api) => api.request(inputs, params).await,
        }
    }
}

impl std::fmt::Debug for Serving {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Serving")
            .field("kind", &self.kind())
            .field("name", &self.name())
            .finish()
    }
}
