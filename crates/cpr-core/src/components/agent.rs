//! Agent Components
//!
//! The decision interface agents implement, the views they decide from,
//! and the roster that holds each agent's authoritative score and status.
//! Agents never touch a pool directly; they answer questions and the
//! orchestrator applies the answers.

use std::collections::BTreeMap;
use std::sync::Arc;

use bevy_ecs::prelude::*;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use cpr_events::{AgentId, AuditKind, TeamId};

use crate::governance::policy::{PolicyKind, Strictness};
use crate::governance::rank::RankBoundaries;
use crate::Points;

/// What an agent puts in or takes out, and what it claims to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Declaration {
    pub actual: Points,
    pub stated: Points,
}

impl Declaration {
    pub fn honest(amount: Points) -> Self {
        Self { actual: amount, stated: amount }
    }

    pub fn new(actual: Points, stated: Points) -> Self {
        Self { actual, stated }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_honest(&self) -> bool {
        self.actual == self.stated
    }
}

/// Inputs to a contribution decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContributionView {
    pub agent: AgentId,
    pub score: Points,
    pub turn_score: Points,
    pub expected: Points,
    pub common_pool: Points,
    pub team_size: usize,
    pub rank: Option<u8>,
}

/// Inputs to a withdrawal decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalView {
    pub agent: AgentId,
    pub score: Points,
    pub expected: Points,
    pub common_pool: Points,
    pub team_size: usize,
    pub rank: Option<u8>,
}

/// One member's public claim in a phase, next to what the rules expected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberClaim {
    pub agent: AgentId,
    pub stated: Points,
    pub expected: Points,
}

/// What every member of a team can see once a phase has been served:
/// each member's claim and the pool movement the phase produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseReport {
    pub kind: AuditKind,
    pub claims: Vec<MemberClaim>,
    /// Net change of the common pool; negative after withdrawals
    pub pool_change: Points,
}

impl PhaseReport {
    /// Stated movement the pool change does not account for.
    ///
    /// Positive when members claimed to put in more, or take out less,
    /// than the pool shows.
    pub fn unexplained(&self) -> Points {
        let stated: Points = self.claims.iter().map(|c| c.stated).sum();
        match self.kind {
            AuditKind::Contribution => stated - self.pool_change,
            AuditKind::Withdrawal => -self.pool_change - stated,
        }
    }

    /// Members whose own claim already breaks the rules.
    pub fn open_breaches(&self) -> impl Iterator<Item = AgentId> + '_ {
        let kind = self.kind;
        self.claims
            .iter()
            .filter(move |c| match kind {
                AuditKind::Contribution => c.stated < c.expected,
                AuditKind::Withdrawal => c.stated > c.expected,
            })
            .map(|c| c.agent)
    }
}

/// The decisions an agent is asked to make.
///
/// Only the turn decisions are required; votes and proposals default to
/// abstaining or agreeing with the status quo.
pub trait CprAgent: Send {
    fn id(&self) -> AgentId;

    /// After a roll: `true` keeps `accumulated`, `false` rolls again.
    fn stick_or_again(&mut self, accumulated: Points, previous_roll: Points) -> bool;

    fn decide_contribution(&mut self, view: &ContributionView) -> Declaration;

    fn decide_withdrawal(&mut self, view: &WithdrawalView) -> Declaration;

    /// Menu indices, most preferred first.
    fn policy_vote(&mut self, menu: &[PolicyKind]) -> Vec<usize> {
        (0..menu.len()).collect()
    }

    fn audit_vote(&mut self, _kind: AuditKind, _members: &[AgentId]) -> Option<AgentId> {
        None
    }

    fn leadership_vote(&mut self, _candidates: &[AgentId]) -> Option<AgentId> {
        None
    }

    fn strictness_vote(&mut self) -> Vec<Strictness> {
        Vec::new()
    }

    fn propose_rank_boundaries(&mut self, current: &RankBoundaries) -> RankBoundaries {
        *current
    }

    /// As chair, the ranks to commit after a contribution phase.
    fn propose_ranks(&mut self, recomputed: &BTreeMap<AgentId, u8>) -> BTreeMap<AgentId, u8> {
        recomputed.clone()
    }

    /// Sent to every member before the audit vote of a phase.
    fn observe_phase(&mut self, _report: &PhaseReport) {}

    fn on_audit_result(&mut self, _target: AgentId, _kind: AuditKind, _lied: bool) {}

    fn on_eliminated(&mut self) {}
}

/// Shared, lockable handle to an agent
pub type AgentHandle = Arc<Mutex<Box<dyn CprAgent>>>;

pub fn handle(agent: Box<dyn CprAgent>) -> AgentHandle {
    Arc::new(Mutex::new(agent))
}

/// Core-owned state of one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub id: AgentId,
    pub score: Points,
    pub team: Option<TeamId>,
    pub alive: bool,
}

impl AgentState {
    pub fn new(id: AgentId, score: Points) -> Self {
        Self {
            id,
            score,
            team: None,
            alive: true,
        }
    }
}

struct RosterEntry {
    state: AgentState,
    handle: AgentHandle,
}

/// Resource: every agent known to the run, alive or not
#[derive(Resource, Default)]
pub struct AgentRoster {
    entries: BTreeMap<AgentId, RosterEntry>,
}

impl std::fmt::Debug for AgentRoster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(id, e)| (id, &e.state)))
            .finish()
    }
}

impl AgentRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an agent under its own id. Returns false on a duplicate id.
    pub fn insert(&mut self, agent: Box<dyn CprAgent>, score: Points) -> bool {
        let id = agent.id();
        if self.entries.contains_key(&id) {
            tracing::warn!(agent = %id, "duplicate agent id; ignoring");
            return false;
        }
        self.entries.insert(
            id,
            RosterEntry {
                state: AgentState::new(id, score),
                handle: handle(agent),
            },
        );
        true
    }

    pub fn state(&self, id: AgentId) -> Option<&AgentState> {
        self.entries.get(&id).map(|e| &e.state)
    }

    pub fn state_mut(&mut self, id: AgentId) -> Option<&mut AgentState> {
        self.entries.get_mut(&id).map(|e| &mut e.state)
    }

    pub fn handle(&self, id: AgentId) -> Option<AgentHandle> {
        self.entries.get(&id).map(|e| Arc::clone(&e.handle))
    }

    pub fn score(&self, id: AgentId) -> Points {
        self.state(id).map_or(0, |s| s.score)
    }

    pub fn is_alive(&self, id: AgentId) -> bool {
        self.state(id).map_or(false, |s| s.alive)
    }

    pub fn states(&self) -> impl Iterator<Item = &AgentState> {
        self.entries.values().map(|e| &e.state)
    }

    pub fn states_mut(&mut self) -> impl Iterator<Item = &mut AgentState> {
        self.entries.values_mut().map(|e| &mut e.state)
    }

    /// Living agents in id order
    pub fn alive(&self) -> Vec<AgentId> {
        self.states().filter(|s| s.alive).map(|s| s.id).collect()
    }

    /// `(id, handle)` pairs for the given agents that are known and alive
    pub fn handles(&self, ids: &[AgentId]) -> Vec<(AgentId, AgentHandle)> {
        ids.iter()
            .filter_map(|id| {
                let entry = self.entries.get(id)?;
                entry.state.alive.then(|| (*id, Arc::clone(&entry.handle)))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
