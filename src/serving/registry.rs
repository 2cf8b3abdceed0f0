//! Named serving backends built from configuration.

use super::Serving;
use crate::models::{ConfigError, PipelineConfig, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Registry of configured serving backends, shared by the operators that use them.
#[derive(Debug, Default)]
pub struct ServingRegistry {
    backends: BTreeMap<String, Arc<Serving>>,
}

impl ServingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every backend declared in the pipeline config.
    ///
    /// # Errors
    ///
    /// Fails if a backend needs an API key that is not configured, or if a
    /// client cannot be built.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let mut registry = Self::new();
        for (name, serving) in &config.serving {
            registry.insert(name, Serving::from_config(name, serving)?);
        }
        info!(backends = registry.backends.len(), "Serving registry built");
        Ok(registry)
    }

    /// Add or replace a backend.
    pub fn insert(&mut self, name: impl Into<String>, serving: Serving) {
        self.backends.insert(name.into(), Arc::new(serving));
    }

    pub fn get(&self, name: &str) -> Result<Arc<Serving>> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownServing(name.to_string()).into())
    }

    pub fn names(&self) -> Vec<&str> {
        self.backends.keys().map(String::as_str).collect()
    }
}
