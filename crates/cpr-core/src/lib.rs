//! Common-Pool Resource Governance Engine
//!
//! Teams of agents share a pool under adopted articles of association.
//! The library exposes the governance primitives, the turn systems and the
//! orchestrator that drives them.

pub mod components;
pub mod config;
pub mod context;
pub mod error;
pub mod governance;
pub mod output;
pub mod setup;
pub mod systems;

/// Scores, pool balances and every amount moved between them
pub type Points = i64;

pub use components::{AgentRoster, CommonPool, CprAgent, Declaration, Team, TeamRegistry};
pub use config::SimConfig;
pub use context::SimulationContext;
pub use error::{ConfigError, GovernanceError, HistoryError, RecorderError, SimError};
pub use governance::{ArticlesOfAssociation, PolicyKind};
pub use systems::RoundOrchestrator;
