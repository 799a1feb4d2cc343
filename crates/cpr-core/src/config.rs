//! Configuration System
//!
//! Run parameters loaded from `commons.toml`. Every section is optional and
//! falls back to its defaults; command-line flags override what is loaded.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::governance::chair::ChairAgreement;
use crate::governance::policy::{
    FlatQuotaParams, GovernanceRules, LeaderParams, MonitoringParams, PolicyKind, RankWeightedParams,
    ScoreShareParams,
};
use crate::Points;

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "commons.toml";

/// Top-level configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub simulation: SimulationConfig,
    pub governance: GovernanceConfig,
    pub agents: AgentMixConfig,
    pub output: OutputConfig,
}

/// Run length, population and the game's clock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub seed: u64,
    pub iterations: u32,
    pub turns_per_iteration: u32,
    pub agent_count: usize,
    pub team_size: usize,
    pub initial_score: Points,
    /// Elimination threshold is drawn from `[threshold_min, threshold_max)`
    pub threshold_min: Points,
    pub threshold_max: Points,
    /// Per-phase deadline for agent answers; unset waits forever
    pub phase_timeout_ms: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            iterations: 3,
            turns_per_iteration: 10,
            agent_count: 12,
            team_size: 4,
            initial_score: 50,
            threshold_min: 5,
            threshold_max: 15,
            phase_timeout_ms: Some(500),
        }
    }
}

impl SimulationConfig {
    pub fn phase_timeout(&self) -> Option<Duration> {
        self.phase_timeout_ms.map(Duration::from_millis)
    }
}

/// Rules shared by every team plus the policy menu teams vote over
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    pub chair_attempts: u32,
    pub chair_count: usize,
    pub offence_threshold: u32,
    pub policy_menu: Vec<PolicyKind>,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            chair_attempts: 10,
            chair_count: 2,
            offence_threshold: 2,
            policy_menu: vec![
                PolicyKind::FlatQuota(FlatQuotaParams::default()),
                PolicyKind::FlatQuota(FlatQuotaParams {
                    contribution: 20,
                    withdrawal: 20,
                    ..FlatQuotaParams::default()
                }),
                PolicyKind::ScoreShare(ScoreShareParams::default()),
                PolicyKind::RankWeighted(RankWeightedParams::default()),
                PolicyKind::LeaderPrivileged(LeaderParams::default()),
                PolicyKind::Monitoring(MonitoringParams::default()),
            ],
        }
    }
}

impl GovernanceConfig {
    pub fn rules(&self) -> GovernanceRules {
        GovernanceRules {
            offence_threshold: self.offence_threshold,
            agreement: ChairAgreement::new(self.chair_attempts, self.chair_count),
        }
    }
}

/// Relative weights of the built-in agent temperaments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentMixConfig {
    pub honest: f64,
    pub freeloader: f64,
    pub skimmer: f64,
    pub opportunist: f64,
}

impl Default for AgentMixConfig {
    fn default() -> Self {
        Self {
            honest: 0.5,
            freeloader: 0.15,
            skimmer: 0.15,
            opportunist: 0.2,
        }
    }
}

impl AgentMixConfig {
    pub fn weights(&self) -> [f64; 4] {
        [self.honest, self.freeloader, self.skimmer, self.opportunist]
    }
}

/// Where results go
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub directory: String,
    /// Write every turn to `turns.jsonl`
    pub record_turns: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: "output".to_string(),
            record_turns: true,
        }
    }
}

impl SimConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load from the default path, or use defaults if it is missing or broken.
    pub fn load_or_default() -> Self {
        Self::load(DEFAULT_CONFIG_PATH).unwrap_or_else(|e| {
            tracing::warn!(path = DEFAULT_CONFIG_PATH, error = %e, "could not load config; using defaults");
            Self::default()
        })
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject parameter combinations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sim = &self.simulation;
        if sim.iterations == 0 {
            return Err(ConfigError::Invalid("iterations must be at least 1".into()));
        }
        if sim.team_size == 0 {
            return Err(ConfigError::Invalid("team_size must be at least 1".into()));
        }
        if sim.threshold_max < sim.threshold_min {
            return Err(ConfigError::Invalid(format!(
                "threshold range [{}, {}) is inverted",
                sim.threshold_min, sim.threshold_max
            )));
        }
        let gov = &self.governance;
        if gov.policy_menu.is_empty() {
            return Err(ConfigError::Invalid("policy_menu must not be empty".into()));
        }
        if gov.chair_attempts == 0 || gov.chair_count < 2 {
            return Err(ConfigError::Invalid(
                "chair agreement needs at least one attempt and two chairs".into(),
            ));
        }
        for policy in &gov.policy_menu {
            policy.validate()?;
        }
        let weights = self.agents.weights();
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) || weights.iter().sum::<f64>() <= 0.0 {
            return Err(ConfigError::Invalid("agent mix weights must be non-negative and not all zero".into()));
        }
        Ok(())
    }
}
