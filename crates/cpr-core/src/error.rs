//! Error Types
//!
//! Construction-time failures only. Runtime game conditions (missing team,
//! missing history, an agent that never answered) are recovered where they
//! happen and logged instead of being raised.

use thiserror::Error;

/// Invalid bounded-history parameters
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HistoryError {
    #[error("window capacity must be greater than zero")]
    ZeroCapacity,
    #[error("decay factor {0} outside [0, 1]")]
    InvalidDecay(f64),
}

/// Invalid governance inputs
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GovernanceError {
    #[error("no candidates to select a chair from")]
    EmptyCandidates,
    #[error("cannot select {wanted} chairs from {available} candidates")]
    NotEnoughCandidates { wanted: usize, available: usize },
    #[error("invalid policy parameter: {0}")]
    InvalidPolicy(String),
    #[error(transparent)]
    History(#[from] HistoryError),
}

/// Configuration loading and validation failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error(transparent)]
    Policy(#[from] GovernanceError),
}

/// Turn recording failures
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Top-level failure building or running a simulation
#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Governance(#[from] GovernanceError),
    #[error(transparent)]
    Recorder(#[from] RecorderError),
    #[error("simulation needs at least one agent")]
    NoAgents,
}
