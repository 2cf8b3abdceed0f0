//! Configuration models for sieve.
//!
//! A pipeline is declared in one TOML file: where the dataset lives, which
//! serving backends exist, and the ordered operator steps.

use crate::serving::ApiFlavor;
use crate::storage::CacheType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Dataset source and checkpoint location
    pub storage: StorageConfig,

    /// Named serving backends referenced by steps
    #[serde(default)]
    pub serving: BTreeMap<String, ServingConfig>,

    /// Ordered operator steps
    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Dataset read by the first step
    pub first_entry_file: PathBuf,

    /// Directory for step checkpoints
    pub cache_path: PathBuf,

    /// Checkpoint file name prefix
    #[serde(default = "default_file_name_prefix")]
    pub file_name_prefix: String,

    /// Checkpoint serialization
    #[serde(default)]
    pub cache_type: CacheType,
}

fn default_file_name_prefix() -> String {
    "sieve_step".to_string()
}

/// Serving backend configuration, tagged by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ServingConfig {
    /// Remote HTTP API, one request per item
    Api(ApiServingConfig),
    /// Local batched inference
    Local(LocalServingConfig),
}

/// Remote API backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiServingConfig {
    /// Full endpoint URL (e.g. ".../v1/chat/completions")
    pub api_url: String,

    /// Model identifier sent with every request
    pub model: String,

    /// API key; `${VAR}` placeholders are expanded
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Request/response schema
    #[serde(default)]
    pub flavor: ApiFlavor,

    /// Maximum concurrent requests
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Maximum attempts per item (including the first)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// First retry delay in milliseconds, doubled per attempt
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    /// Upper bound for a single retry delay in seconds
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    /// Extra headers; values support `${VAR}` expansion
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Default sampling temperature
    #[serde(default)]
    pub temperature: Option<f64>,

    /// Default completion budget
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

fn default_max_workers() -> usize {
    8
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout() -> u64 {
    120
}

fn default_base_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_secs() -> u64 {
    60
}

/// Local engine selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalEngineKind {
    /// Co-located OpenAI-compatible server (vLLM, TGI, llama.cpp)
    #[default]
    CompletionsServer,
}

/// Local batched backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalServingConfig {
    /// Inference engine
    #[serde(default)]
    pub engine: LocalEngineKind,

    /// Base URL of the co-located server (e.g. "http://localhost:8000/v1")
    pub base_url: String,

    /// Model name as loaded by the server
    pub model: String,

    /// Inputs per engine call
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Per-batch timeout in seconds
    #[serde(default = "default_local_timeout")]
    pub timeout_secs: u64,

    /// Default sampling temperature
    #[serde(default)]
    pub temperature: Option<f64>,

    /// Default completion budget
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

fn default_batch_size() -> usize {
    32
}

fn default_local_timeout() -> u64 {
    600
}

/// One pipeline step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    /// Registered operator name
    pub operator: String,

    /// Serving backend name, for operators that need one
    #[serde(default)]
    pub serving: Option<String>,

    /// Role → column overrides
    #[serde(default)]
    pub keys: BTreeMap<String, String>,

    /// Operator-specific construction parameters
    #[serde(default)]
    pub params: toml::Table,
}

impl PipelineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_owned(),
                source,
            },
            other => other,
        })
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source: e,
        })
    }

    /// Check cross references that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.steps.is_empty() {
            return Err(ConfigError::Invalid("pipeline has no steps".to_string()));
        }

        for step in &self.steps {
            if let Some(name) = &step.serving {
                if !self.serving.contains_key(name) {
                    return Err(ConfigError::UnknownServing(name.clone()));
                }
            }
        }

        for (name, serving) in &self.serving {
            match serving {
                ServingConfig::Api(api) if api.max_workers == 0 || api.max_retries == 0 => {
                    return Err(ConfigError::Invalid(format!(
                        "serving '{name}': max_workers and max_retries must be at least 1"
                    )));
                }
                ServingConfig::Local(local) if local.batch_size == 0 => {
                    return Err(ConfigError::Invalid(format!(
                        "serving '{name}': batch_size must be at least 1"
                    )));
                }
                _ => {}
            }
        }

        Ok(())
    }
}

impl ApiServingConfig {
    /// Minimal configuration with defaults for everything optional.
    pub fn new(api_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            model: model.into(),
            api_key: None,
            api_key_env: None,
            flavor: ApiFlavor::default(),
            max_workers: default_max_workers(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_secs: default_max_backoff_secs(),
            headers: HashMap::new(),
            temperature: None,
            max_tokens: None,
        }
    }

    /// Resolve the API key from config or environment.
    ///
    /// Returns `None` when neither is configured (valid for unauthenticated endpoints).
    pub fn resolve_api_key(&self, serving: &str) -> Result<Option<String>, ConfigError> {
        if let Some(key) = &self.api_key {
            return Ok(Some(expand_env_vars(key)));
        }

        match &self.api_key_env {
            Some(env_var) => std::env::var(env_var)
                .map(Some)
                .map_err(|_| ConfigError::MissingApiKey {
                    serving: serving.to_string(),
                    env_var: env_var.clone(),
                }),
            None => Ok(None),
        }
    }
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let Ok(re) = regex::Regex::new(r"\$\{([^}]+)\}") else {
        return s.to_string();
    };

    let mut result = s.to_string();
    for cap in re.captures_iter(s) {
        if let Ok(value) = std::env::var(&cap[1]) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

/// Expand environment variables in all headers.
pub fn expand_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (k.clone(), expand_env_vars(v)))
        .collect()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Missing API key for serving '{serving}': set {env_var} env var or api_key in config")]
    MissingApiKey { serving: String, env_var: String },

    #[error("Serving backend not found: '{0}'")]
    UnknownServing(String),

    #[error("Operator not registered: '{0}'")]
    UnknownOperator(String),

    #[error("Operator already registered: '{0}'")]
    DuplicateOperator(String),

    #[error("Invalid keys for operator '{operator}': {message}")]
    InvalidKeys { operator: String, message: String },

    #[error("Invalid parameters for operator '{operator}': {message}")]
    InvalidParams { operator: String, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
