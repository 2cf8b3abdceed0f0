//! Pipeline: ordered operators over one step-versioned storage.

mod executor;
mod report;

pub use executor::{Pipeline, PipelineBuilder, PipelineStep};
pub use report::{PipelineReport, StepReport};
