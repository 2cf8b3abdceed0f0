//! Operator registry: name → constructor.
//!
//! The registry is an ordinary value built at startup. Nothing registers
//! itself; every operator a pipeline may use is added with an explicit
//! [`OperatorRegistry::register`] call.

use super::{
    Embedder, LlmScorer, Operator, OperatorContext, PromptGenerator, ScoreFilter, TextFlagsOperator,
    embedder, filter, flags, generator, scorer,
};
use crate::models::{ConfigError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Builds an operator instance from its construction context.
pub type OperatorConstructor =
    Arc<dyn Fn(&OperatorContext) -> Result<Box<dyn Operator>> + Send + Sync>;

/// A registered operator.
#[derive(Clone)]
pub struct OperatorDescriptor {
    name: String,
    description: String,
    constructor: OperatorConstructor,
}

impl OperatorDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Build an instance.
    pub fn construct(&self, ctx: &OperatorContext) -> Result<Box<dyn Operator>> {
        (self.constructor)(ctx)
    }
}

impl std::fmt::Debug for OperatorDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorDescriptor")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Registry of available operators.
#[derive(Debug, Default, Clone)]
pub struct OperatorRegistry {
    descriptors: BTreeMap<String, OperatorDescriptor>,
}

impl OperatorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in operator.
    pub fn with_builtins() -> Result<Self> {
        let mut registry = Self::new();
        registry.register_builtins()?;
        Ok(registry)
    }

    /// Register the built-in operators.
    pub fn register_builtins(&mut self) -> Result<()> {
        self.register(
            scorer::NAME,
            "Score text with an LLM judge and write the parsed score",
            |ctx| Ok(Box::new(LlmScorer::from_context(ctx)?)),
        )?;
        self.register(
            filter::NAME,
            "Keep rows whose score is above min_score (and at most max_score)",
            |ctx| Ok(Box::new(ScoreFilter::from_context(ctx)?)),
        )?;
        self.register(
            generator::NAME,
            "Generate text from a prompt template",
            |ctx| Ok(Box::new(PromptGenerator::from_context(ctx)?)),
        )?;
        self.register(
            embedder::NAME,
            "Embed text with an embedding backend",
            |ctx| Ok(Box::new(Embedder::from_context(ctx)?)),
        )?;
        self.register(
            flags::NAME,
            "Flag truncation, answer tags, reasoning and self-correction",
            |ctx| Ok(Box::new(TextFlagsOperator::from_context(ctx)?)),
        )?;
        Ok(())
    }

    /// Add an operator. Registering a name twice is an error; nothing is replaced.
    pub fn register<F>(&mut self, name: &str, description: &str, constructor: F) -> Result<()>
    where
        F: Fn(&OperatorContext) -> Result<Box<dyn Operator>> + Send + Sync + 'static,
    {
        if self.descriptors.contains_key(name) {
            return Err(ConfigError::DuplicateOperator(name.to_string()).into());
        }

        self.descriptors.insert(
            name.to_string(),
            OperatorDescriptor {
                name: name.to_string(),
                description: description.to_string(),
                constructor: Arc::new(constructor),
            },
        );
        debug!(operator = name, "Registered operator");
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<&OperatorDescriptor> {
        self.descriptors
            .get(name)
            .ok_or_else(|| ConfigError::UnknownOperator(name.to_string()).into())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.descriptors.contains_key(name)
    }

    /// Descriptors in name order.
    pub fn descriptors(&self) -> impl Iterator<Item = &OperatorDescriptor> {
        self.descriptors.values()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SieveError;

    #[test]
    fn test_builtins_are_listed_in_name_order() {
        let registry = OperatorRegistry::with_builtins().unwrap();
        let names: Vec<_> = registry.descriptors().map(|d| d.name()).collect();
        assert_eq!(
            names,
            ["embedder", "llm_scorer", "prompt_generator", "score_filter", "text_flags"]
        );
    }

    #[test]
    fn test_lookup_constructs_working_operator() {
        let registry = OperatorRegistry::with_builtins().unwrap();
        let ctx = OperatorContext::new(toml::from_str("min_score = 0.5").unwrap());
        let op = registry.lookup("score_filter").unwrap().construct(&ctx).unwrap();
        assert_eq!(op.name(), "score_filter");
    }

    #[test]
    fn test_unknown_operator() {
        let registry = OperatorRegistry::new();
        assert!(matches!(
            registry.lookup("nope"),
            Err(SieveError::Configuration(ConfigError::UnknownOperator(_)))
        ));
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut registry = OperatorRegistry::with_builtins().unwrap();
        let err = registry
            .register("text_flags", "replacement", |_| Ok(Box::new(TextFlagsOperator)))
            .unwrap_err();
        assert!(matches!(
            err,
            SieveError::Configuration(ConfigError::DuplicateOperator(ref name)) if name == "text_flags"
        ));
        assert_eq!(
            registry.lookup("text_flags").unwrap().description(),
            "Flag truncation, answer tags, reasoning and self-correction"
        );
    }
}
