//! Operators: the uniform unit of pipeline work.
//!
//! An operator reads the `dataframe` view from its step storage, computes new
//! columns (or drops rows, if its signature says so) and writes the next
//! checkpoint. Which columns it reads and writes is decided by the pipeline
//! author through [`BoundKeys`], validated against the operator's
//! [`OperatorSignature`] before anything runs.

mod embedder;
mod filter;
mod flags;
mod generator;
mod registry;
mod scorer;
#[cfg(test)]
mod testing;

pub use embedder::Embedder;
pub use filter::ScoreFilter;
pub use flags::{TextFlags, TextFlagsOperator};
pub use generator::{OnFailure, PromptGenerator};
pub use registry::{OperatorConstructor, OperatorDescriptor, OperatorRegistry};
pub use scorer::{LlmScorer, parse_score};

use crate::models::{ConfigError, Result};
use crate::serving::Serving;
use crate::storage::{RowPolicy, StepStorage};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A pipeline step implementation.
#[async_trait]
pub trait Operator: Send + Sync {
    /// Registered name.
    fn name(&self) -> &str;

    /// Key roles and row policy.
    fn signature(&self) -> OperatorSignature;

    /// Read the step's dataset, transform it and write exactly one checkpoint.
    async fn run(&self, storage: &StepStorage, keys: &BoundKeys) -> Result<()>;
}

/// Whether a key names a column the operator reads or one it writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDirection {
    Input,
    Output,
}

/// One key role in a signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpec {
    pub role: &'static str,
    pub direction: KeyDirection,
    /// Column used when the pipeline does not override the role
    pub default: Option<&'static str>,
}

/// What an operator expects from the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorSignature {
    pub keys: Vec<KeySpec>,
    pub row_policy: RowPolicy,
}

impl OperatorSignature {
    pub fn new(row_policy: RowPolicy) -> Self {
        Self {
            keys: Vec::new(),
            row_policy,
        }
    }

    pub fn input(mut self, role: &'static str, default: Option<&'static str>) -> Self {
        self.keys.push(KeySpec {
            role,
            direction: KeyDirection::Input,
            default,
        });
        self
    }

    pub fn output(mut self, role: &'static str, default: Option<&'static str>) -> Self {
        self.keys.push(KeySpec {
            role,
            direction: KeyDirection::Output,
            default,
        });
        self
    }

    /// Resolve role → column overrides against this signature.
    ///
    /// Unknown roles and roles left without a column are configuration errors.
    pub fn bind(
        &self,
        operator: &str,
        overrides: &BTreeMap<String, String>,
    ) -> std::result::Result<BoundKeys, ConfigError> {
        let invalid = |message: String| ConfigError::InvalidKeys {
            operator: operator.to_string(),
            message,
        };

        if let Some(unknown) = overrides
            .keys()
            .find(|role| !self.keys.iter().any(|k| k.role == role.as_str()))
        {
            let known: Vec<_> = self.keys.iter().map(|k| k.role).collect();
            return Err(invalid(format!("unknown role '{unknown}' (expected one of {known:?})")));
        }

        let mut columns = BTreeMap::new();
        for spec in &self.keys {
            let column = overrides
                .get(spec.role)
                .cloned()
                .or_else(|| spec.default.map(str::to_string))
                .ok_or_else(|| invalid(format!("role '{}' needs a column", spec.role)))?;
            if column.is_empty() {
                return Err(invalid(format!("role '{}' has an empty column name", spec.role)));
            }
            columns.insert(spec.role.to_string(), column);
        }

        Ok(BoundKeys { columns })
    }
}

/// Role → column mapping, validated against a signature.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoundKeys {
    columns: BTreeMap<String, String>,
}

impl BoundKeys {
    /// Column bound to `role`.
    pub fn get(&self, role: &str) -> Result<&str> {
        self.columns.get(role).map(String::as_str).ok_or_else(|| {
            ConfigError::InvalidKeys {
                operator: String::new(),
                message: format!("role '{role}' is not bound"),
            }
            .into()
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.columns.iter().map(|(r, c)| (r.as_str(), c.as_str()))
    }
}

/// Everything a constructor may draw on.
#[derive(Debug, Clone, Default)]
pub struct OperatorContext {
    pub params: toml::Table,
    pub serving: Option<Arc<Serving>>,
}

impl OperatorContext {
    pub fn new(params: toml::Table) -> Self {
        Self {
            params,
            serving: None,
        }
    }

    pub fn with_serving(mut self, serving: Arc<Serving>) -> Self {
        self.serving = Some(serving);
        self
    }

    /// Deserialize the params table into an operator's parameter struct.
    pub fn params<T: DeserializeOwned>(&self, operator: &str) -> Result<T> {
        toml::Value::Table(self.params.clone())
            .try_into()
            .map_err(|e: toml::de::Error| {
                ConfigError::InvalidParams {
                    operator: operator.to_string(),
                    message: e.message().to_string(),
                }
                .into()
            })
    }

    /// The serving backend, for operators that cannot work without one.
    pub fn require_serving(&self, operator: &str) -> Result<Arc<Serving>> {
        self.serving.clone().ok_or_else(|| {
            ConfigError::Invalid(format!("operator '{operator}' requires a serving backend")).into()
        })
    }
}

/// Substitute `{text}` in a prompt template.
pub(crate) fn render_prompt(template: &str, text: &str) -> String {
    template.replace("{text}", text)
}

pub(crate) fn default_prompt_template() -> String {
    "{text}".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SieveError;
    use serde::Deserialize;

    fn signature() -> OperatorSignature {
        OperatorSignature::new(RowPolicy::Preserve)
            .input("input", None)
            .output("output", Some("score"))
    }

    fn overrides(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_bind_applies_defaults_and_overrides() {
        let keys = signature().bind("op", &overrides(&[("input", "text")])).unwrap();
        assert_eq!(keys.get("input").unwrap(), "text");
        assert_eq!(keys.get("output").unwrap(), "score");

        let keys = signature()
            .bind("op", &overrides(&[("input", "text"), ("output", "quality")]))
            .unwrap();
        assert_eq!(keys.get("output").unwrap(), "quality");
    }

    #[test]
    fn test_bind_rejects_unknown_role() {
        let err = signature()
            .bind("op", &overrides(&[("input", "text"), ("label", "x")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidKeys { ref message, .. } if message.contains("label")));
    }

    #[test]
    fn test_bind_rejects_missing_required_role() {
        assert!(matches!(
            signature().bind("op", &BTreeMap::new()),
            Err(ConfigError::InvalidKeys { .. })
        ));
    }

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct Params {
        threshold: f64,
    }

    #[test]
    fn test_params_deserialize_and_report_errors() {
        let ctx = OperatorContext::new(toml::from_str("threshold = 0.5").unwrap());
        let params: Params = ctx.params("op").unwrap();
        assert_eq!(params.threshold, 0.5);

        let ctx = OperatorContext::new(toml::from_str("thresold = 0.5").unwrap());
        assert!(matches!(
            ctx.params::<Params>("op"),
            Err(SieveError::Configuration(ConfigError::InvalidParams { .. }))
        ));
    }

    #[test]
    fn test_require_serving() {
        assert!(OperatorContext::default().require_serving("op").is_err());
    }

    #[test]
    fn test_render_prompt() {
        assert_eq!(render_prompt("Rate: {text}!", "hi"), "Rate: hi!");
    }
}
