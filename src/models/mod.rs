//! Core data models for sieve: configuration, errors and the dataset table.

mod config;
mod dataset;
mod error;

pub use config::*;
pub use dataset::*;
pub use error::*;
