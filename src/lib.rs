//! sieve - Checkpointed operator pipelines for curating LLM training data.
//!
//! ## Architecture
//!
//! A pipeline chains interchangeable operators over one tabular dataset:
//! - **Storage**: every step reads the previous checkpoint and writes a new,
//!   immutable one (`{cache_path}/{prefix}_step{n}.json`)
//! - **Operators**: scorers, generators and filters behind one trait, bound to
//!   columns through validated keys
//! - **Serving**: local batched inference or a remote API with a bounded
//!   worker pool and retry
//! - **Registry**: operators are registered explicitly at startup and looked
//!   up by name from the pipeline config
//!
//! ## Failure model
//!
//! - A failing step aborts the run; earlier checkpoints stay on disk
//! - Transient serving failures are retried; items that never succeed are
//!   marked failed without breaking batch alignment
//! - A run can be resumed from the last completed checkpoint

pub mod models;
pub mod operators;
pub mod pipeline;
pub mod serving;
pub mod storage;

// Re-exports for convenience
pub use models::{ConfigError, Dataset, PipelineConfig, Record, Result, SieveError};
pub use operators::{BoundKeys, Operator, OperatorContext, OperatorRegistry, OperatorSignature};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineReport};
pub use serving::{ApiServing, GenerationParams, LocalServing, Serving, ServingOutput, ServingRegistry};
pub use storage::{CacheType, FileStorage, RowPolicy, StepStorage};
