//! Components
//!
//! Agents, teams and the bounded histories governance is built on.

pub mod agent;
pub mod audit;
pub mod history;
pub mod team;

pub use agent::{
    AgentHandle, AgentRoster, AgentState, ContributionView, CprAgent, Declaration, MemberClaim, PhaseReport, WithdrawalView,
};
pub use audit::{AuditBook, AuditLedger, AuditOutcome};
pub use history::{DecayAccumulator, WindowCounter};
pub use team::{CommonPool, PoolEntry, PoolEntryKind, Team, TeamRegistry};
