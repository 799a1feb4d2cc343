//! Shared identifiers and per-turn record types for the commons simulation.
//!
//! This crate contains pure data structures with no simulation logic.
//! It is a dependency for the governance engine and for anything that
//! consumes the turn-by-turn recording.

pub mod ids;
pub mod record;

#[cfg(feature = "test-fixtures")]
pub mod fixtures;

pub use ids::{AgentId, TeamId};
pub use record::{AgentRecord, AuditKind, BallotKind, PoolFlows, TeamRecord, TurnRecord};
