//! Scenario harness for portathread.
//!
//! This crate provides:
//! - Scenarios: the two demo programs shipped with the library (once-flag
//!   race, long sleep) plus one end-to-end exercise per primitive, run on
//!   the active substrate
//! - Structured logging: JSONL records and an artifact index with SHA-256
//!   digests

#![forbid(unsafe_code)]

pub mod scenarios;
pub mod structured_log;

use portathread_core::ThreadError;
use thiserror::Error;

pub use scenarios::{SCENARIOS, Scenario, ScenarioConfig, ScenarioReport};
pub use structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};

/// Errors raised while running scenarios or writing their evidence.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("unknown scenario '{0}'")]
    UnknownScenario(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("scenario invariant broken: {0}")]
    Invariant(String),
    #[error("primitive failed: {0}")]
    Primitive(#[from] ThreadError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
