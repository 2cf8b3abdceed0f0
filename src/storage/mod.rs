//! Step-versioned dataset storage.
//!
//! Every step reads the checkpoint written by its predecessor and writes a new
//! one; checkpoints are never modified after they are written.

mod file_storage;
mod format;
mod manifest;

pub use file_storage::{DATAFRAME_VIEW, FileStorage, RowPolicy, StepStorage};
pub use format::{CacheType, decode, encode, read_dataset_file};
pub use manifest::{ManifestStore, RunManifest, StepRecord};
