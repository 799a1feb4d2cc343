//! Team Components
//!
//! Teams, their common pools and the registry that maps agents to teams.

use std::collections::BTreeMap;

use bevy_ecs::prelude::*;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use cpr_events::{AgentId, PoolFlows, TeamId, TeamRecord};

use crate::governance::policy::ArticlesOfAssociation;
use crate::Points;

/// Kind of pool movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolEntryKind {
    Contribution,
    Withdrawal,
    AuditCost,
}

/// One accepted (possibly clamped) pool movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolEntry {
    pub kind: PoolEntryKind,
    pub agent: Option<AgentId>,
    pub requested: Points,
    pub accepted: Points,
}

#[derive(Debug, Default)]
struct PoolState {
    balance: Points,
    opening: Points,
    journal: Vec<PoolEntry>,
}

impl PoolState {
    fn apply(&mut self, kind: PoolEntryKind, agent: Option<AgentId>, requested: Points, accepted: Points) {
        match kind {
            PoolEntryKind::Contribution => self.balance += accepted,
            PoolEntryKind::Withdrawal | PoolEntryKind::AuditCost => self.balance -= accepted,
        }
        self.journal.push(PoolEntry { kind, agent, requested, accepted });
    }
}

/// A team's shared balance. Never negative.
///
/// Every change goes through `deposit`, `withdraw` or `charge_audit` under
/// one lock and is journaled for the current turn.
#[derive(Debug, Default)]
pub struct CommonPool {
    state: Mutex<PoolState>,
}

impl CommonPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance(&self) -> Points {
        self.state.lock().balance
    }

    /// Start a turn: snapshot the opening balance and clear the journal.
    pub fn open_turn(&self) {
        let mut state = self.state.lock();
        state.opening = state.balance;
        state.journal.clear();
    }

    /// Add a contribution; negative amounts are refused. Returns the amount accepted.
    pub fn deposit(&self, agent: AgentId, amount: Points) -> Points {
        let accepted = amount.max(0);
        self.state.lock().apply(PoolEntryKind::Contribution, Some(agent), amount, accepted);
        accepted
    }

    /// Take up to `requested`; never more than the balance.
    pub fn withdraw(&self, agent: AgentId, requested: Points) -> Points {
        let mut state = self.state.lock();
        let accepted = requested.clamp(0, state.balance);
        if accepted != requested {
            tracing::debug!(%agent, requested, accepted, "withdrawal clamped to pool");
        }
        state.apply(PoolEntryKind::Withdrawal, Some(agent), requested, accepted);
        accepted
    }

    /// Pay for a formal audit; clamped to the balance.
    pub fn charge_audit(&self, cost: Points) -> Points {
        let mut state = self.state.lock();
        let accepted = cost.clamp(0, state.balance);
        state.apply(PoolEntryKind::AuditCost, None, cost, accepted);
        accepted
    }

    /// Totals accepted since `open_turn`.
    pub fn flows(&self) -> PoolFlows {
        let state = self.state.lock();
        let mut flows = PoolFlows {
            opening: state.opening,
            closing: state.balance,
            ..PoolFlows::default()
        };
        for entry in &state.journal {
            match entry.kind {
                PoolEntryKind::Contribution => flows.contributions += entry.accepted,
                PoolEntryKind::Withdrawal => flows.withdrawals += entry.accepted,
                PoolEntryKind::AuditCost => flows.audit_costs += entry.accepted,
            }
        }
        flows
    }

    pub fn journal(&self) -> Vec<PoolEntry> {
        self.state.lock().journal.clone()
    }
}

/// A group of agents sharing one pool under one policy
#[derive(Debug)]
pub struct Team {
    pub id: TeamId,
    members: Vec<AgentId>,
    pool: CommonPool,
    policy: Box<dyn ArticlesOfAssociation>,
}

impl Team {
    pub fn new(id: TeamId, members: Vec<AgentId>, policy: Box<dyn ArticlesOfAssociation>) -> Self {
        Self {
            id,
            members,
            pool: CommonPool::new(),
            policy,
        }
    }

    pub fn members(&self) -> &[AgentId] {
        &self.members
    }

    pub fn contains(&self, agent: AgentId) -> bool {
        self.members.contains(&agent)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn pool(&self) -> &CommonPool {
        &self.pool
    }

    pub fn policy(&self) -> &dyn ArticlesOfAssociation {
        self.policy.as_ref()
    }

    pub fn policy_mut(&mut self) -> &mut dyn ArticlesOfAssociation {
        self.policy.as_mut()
    }

    /// Replace the rulebook (after the policy vote).
    pub fn adopt(&mut self, policy: Box<dyn ArticlesOfAssociation>) {
        tracing::info!(team = %self.id, from = self.policy.policy_id(), to = policy.policy_id(), "policy adopted");
        self.policy = policy;
    }

    /// Drop `agent` from the team and from the policy's books.
    pub fn remove_member(&mut self, agent: AgentId) -> bool {
        let before = self.members.len();
        self.members.retain(|m| *m != agent);
        let removed = self.members.len() != before;
        if removed {
            self.policy.forget(agent);
        }
        removed
    }

    pub fn record(&self) -> TeamRecord {
        TeamRecord {
            team_id: self.id,
            common_pool: self.pool.balance(),
            policy_id: self.policy.policy_id().to_string(),
            rank_boundaries: self.policy.rank_boundaries().map(|b| b.to_vec()),
            leader: self.policy.leader(),
            member_count: self.members.len(),
            flows: self.pool.flows(),
        }
    }
}

/// Resource: all live teams and the agent → team index
#[derive(Resource, Debug, Default)]
pub struct TeamRegistry {
    teams: BTreeMap<TeamId, Team>,
    membership: BTreeMap<AgentId, TeamId>,
}

impl TeamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a team. Agents already in another team are moved out of it.
    pub fn insert(&mut self, team: Team) {
        for member in team.members() {
            if let Some(previous) = self.membership.insert(*member, team.id) {
                if let Some(old) = self.teams.get_mut(&previous) {
                    old.remove_member(*member);
                }
            }
        }
        self.teams.insert(team.id, team);
    }

    pub fn get(&self, id: TeamId) -> Option<&Team> {
        self.teams.get(&id)
    }

    pub fn get_mut(&mut self, id: TeamId) -> Option<&mut Team> {
        self.teams.get_mut(&id)
    }

    pub fn team_of(&self, agent: AgentId) -> Option<TeamId> {
        self.membership.get(&agent).copied()
    }

    pub fn ids(&self) -> Vec<TeamId> {
        self.teams.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Team> {
        self.teams.values()
    }

    pub fn len(&self) -> usize {
        self.teams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.teams.is_empty()
    }

    /// Remove `agent` from whichever team holds it.
    pub fn remove_member(&mut self, agent: AgentId) -> Option<TeamId> {
        let team_id = self.membership.remove(&agent)?;
        if let Some(team) = self.teams.get_mut(&team_id) {
            team.remove_member(agent);
        }
        Some(team_id)
    }

    /// Destroy teams with no members left.
    pub fn prune_empty(&mut self) -> Vec<TeamId> {
        let empty: Vec<TeamId> = self.teams.values().filter(|t| t.is_empty()).map(|t| t.id).collect();
        for id in &empty {
            self.teams.remove(id);
            tracing::info!(team = %id, "team dissolved");
        }
        empty
    }

    pub fn clear(&mut self) {
        self.teams.clear();
        self.membership.clear();
    }
}
