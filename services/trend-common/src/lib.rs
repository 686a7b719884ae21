//! Shared types and configuration for the trend engine.
//!
//! - `config`: JSON configuration with environment overrides
//! - `logging`: `tracing` subscriber setup
//! - `source`: provider and completeness-source identifiers

pub mod config;
pub mod logging;
pub mod source;

pub use config::{Config, MissingScorePolicy, SourceRoute};
pub use source::{ProviderId, SourceId};
