//! Library crate for recon-pipeline exposing the orchestration building blocks.
pub mod analyzer;
pub mod client;
pub mod config;
pub mod error;
pub mod llm;
pub mod merge;
pub mod parse;
pub mod passive;
pub mod pipeline;
pub mod prompts;
pub mod runner;
pub mod scanners;
mod schema;
pub mod store;
pub mod tasks;
pub mod types;

pub use error::{AnalysisError, CallError, PipelineError, StoreError};
pub use pipeline::{Pipeline, PipelineReport, RunOptions};
